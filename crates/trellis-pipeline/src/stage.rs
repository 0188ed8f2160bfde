//! The stage trait and the fixed-order pipeline runner.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::context::{PipelineContext, PipelineOutput};
use crate::error::{PipelineError, Result, StageFailure, StageResult};
use crate::estimator::TokenEstimator;
use crate::sources::{AssetStore, TranscriptStore};
use crate::stages::{
    assets::AssetResolver, extraction::ExtractionStage, formatting::FormatStage,
    injection::InjectionAssembler, limiter::TokenLimiter, regex_rules::RegexProcessor,
    session_loader::SessionLoader, worldbook::WorldbookStage,
};
use crate::worldbook::WorldbookSource;

/// One processor in the context pipeline.
///
/// Stages are pure with respect to their declared inputs: they read the
/// pipeline context and rewrite `ctx.messages`. A recoverable failure leaves
/// the message list exactly as the stage received it.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ordering key among stages sharing a slot. Lower runs first.
    fn priority(&self) -> i32 {
        0
    }

    fn enabled(&self, _ctx: &PipelineContext<'_>) -> bool {
        true
    }

    async fn run(&self, ctx: &mut PipelineContext<'_>) -> StageResult;
}

/// External collaborators the standard stages need.
pub struct PipelineDeps {
    pub estimator: Arc<dyn TokenEstimator>,
    pub transcripts: Arc<dyn TranscriptStore>,
    pub assets: Arc<dyn AssetStore>,
    pub worldbook: Option<Arc<dyn WorldbookSource>>,
}

/// The fixed, ordered processor sequence. Stages occupy numbered slots;
/// custom stages can share a slot and are ordered by priority within it.
pub struct Pipeline {
    stages: Vec<(u8, Box<dyn PipelineStage>)>,
}

impl Pipeline {
    /// The standard eight-stage pipeline.
    pub fn standard(deps: PipelineDeps) -> Self {
        let mut pipeline = Self { stages: Vec::new() };
        pipeline.push(1, SessionLoader);
        pipeline.push(2, RegexProcessor);
        pipeline.push(3, InjectionAssembler);
        pipeline.push(
            4,
            ExtractionStage::new(deps.transcripts.clone(), deps.assets.clone()),
        );
        pipeline.push(5, WorldbookStage::new(deps.worldbook.clone()));
        pipeline.push(6, TokenLimiter::new(deps.estimator.clone()));
        pipeline.push(7, FormatStage);
        pipeline.push(8, AssetResolver::new(deps.assets.clone()));
        pipeline
    }

    /// Add a stage to a slot. Execution order is slot ascending, then
    /// priority within the slot (stable on insertion order).
    pub fn push(&mut self, slot: u8, stage: impl PipelineStage + 'static) {
        self.stages.push((slot, Box::new(stage)));
        self.stages
            .sort_by_key(|(slot, stage)| (*slot, stage.priority()));
    }

    /// Run every enabled stage in order.
    ///
    /// Recoverable stage failures are logged and the stage's input passes
    /// through unchanged; a fatal failure aborts with `PipelineError`.
    pub async fn run(&self, mut ctx: PipelineContext<'_>) -> Result<PipelineOutput> {
        for (_, stage) in &self.stages {
            if !stage.enabled(&ctx) {
                ctx.trace.push(stage.name(), "skipped (disabled)");
                continue;
            }
            let saved = ctx.messages.clone();
            match stage.run(&mut ctx).await {
                Ok(()) => {
                    debug!(stage = stage.name(), messages = ctx.messages.len(), "stage complete");
                }
                Err(StageFailure::Recoverable(message)) => {
                    warn!(stage = stage.name(), %message, "stage failed, passing input through");
                    ctx.messages = saved;
                    ctx.warn(stage.name(), message);
                }
                Err(StageFailure::Fatal(message)) => {
                    return Err(PipelineError::Fatal {
                        stage: stage.name(),
                        message,
                    });
                }
            }
        }
        Ok(PipelineOutput {
            messages: ctx.messages,
            trace: ctx.trace,
            warnings: ctx.warnings,
        })
    }
}
