//! The deterministic context-assembly pipeline: a fixed, ordered sequence of
//! processors that turns the active branch of a session tree plus agent
//! configuration into the canonical message list for an LLM request,
//! honoring a token budget along the way.
//!
//! External collaborators (tokenizers, transcription, asset storage,
//! worldbook) are traits defined here and implemented outside the core.

pub mod context;
pub mod error;
pub mod estimator;
pub mod model;
pub mod sources;
pub mod stage;
pub mod stages;
pub mod trace;
pub mod worldbook;

pub use context::{
    DraftMessage, MessagePart, MessageSource, PipelineContext, PipelineInput, PipelineOutput,
    SourceKind,
};
pub use error::{PipelineError, StageFailure, StageResult};
pub use estimator::{
    CharEstimator, DocumentCostRule, TokenEstimate, TokenEstimator, VisionCostRule,
};
pub use model::{DocumentFormat, ModelProfile};
pub use sources::{AssetStore, NoAssets, TranscriptStore};
pub use stage::{Pipeline, PipelineDeps, PipelineStage};
pub use trace::{TraceBuffer, TraceEvent};
pub use worldbook::{ActivationMode, WorldbookEntry, WorldbookSource};
