use thiserror::Error;

/// Error surfaced to the executor when the pipeline cannot produce output.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline stage '{stage}' failed fatally: {message}")]
    Fatal {
        stage: &'static str,
        message: String,
    },
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Fatal { .. } => "PIPELINE_FATAL",
        }
    }
}

/// How a single stage failed.
///
/// A recoverable failure is logged and the stage's input passes through to
/// the next stage unchanged; a fatal failure aborts the whole pipeline.
#[derive(Debug)]
pub enum StageFailure {
    Recoverable(String),
    Fatal(String),
}

pub type StageResult = std::result::Result<(), StageFailure>;
pub type Result<T> = std::result::Result<T, PipelineError>;
