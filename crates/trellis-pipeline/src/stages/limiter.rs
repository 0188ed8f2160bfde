//! Stage 6: enforce the token budget.
//!
//! Preset, profile, and injected messages are protected; session history and
//! worldbook content is disposable. The newest disposable suffix that fits
//! the remaining budget survives; when `retained_characters` is configured,
//! the oldest survivor is reduced to a head-summary instead of keeping its
//! full body.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use trellis_core::AssetKind;

use crate::context::{DraftMessage, MessagePart, PipelineContext};
use crate::error::StageResult;
use crate::estimator::TokenEstimator;
use crate::model::ModelProfile;
use crate::stage::PipelineStage;

pub struct TokenLimiter {
    estimator: Arc<dyn TokenEstimator>,
}

const STAGE: &str = "token_limiter";
const ELLIPSIS: &str = "…";

impl TokenLimiter {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { estimator }
    }

    fn message_cost(&self, message: &DraftMessage, model_id: &str, model: &ModelProfile) -> u64 {
        let mut total = 0u64;
        for part in &message.parts {
            total += match part {
                MessagePart::Text { text } => {
                    self.estimator.estimate_text(text, model_id).count as u64
                }
                MessagePart::Attachment { asset } => match asset.kind {
                    AssetKind::Image => self
                        .estimator
                        .estimate_image(
                            asset.width.unwrap_or(0),
                            asset.height.unwrap_or(0),
                            &model.vision_cost,
                        ) as u64,
                    AssetKind::Audio => self
                        .estimator
                        .estimate_audio(asset.duration_secs.unwrap_or(0.0))
                        as u64,
                    AssetKind::Video => self
                        .estimator
                        .estimate_video(asset.duration_secs.unwrap_or(0.0))
                        as u64,
                    AssetKind::Document => self
                        .estimator
                        .estimate_document(asset.pages.unwrap_or(1), &model.document_cost)
                        as u64,
                    AssetKind::Text => 0,
                },
                MessagePart::ToolUse { input, .. } => self
                    .estimator
                    .estimate_text(&input.to_string(), model_id)
                    .count as u64,
                MessagePart::ToolResult { content, .. } => {
                    self.estimator.estimate_text(content, model_id).count as u64
                }
                // Already-resolved parts should not exist before stage 8.
                _ => 0,
            };
        }
        total
    }
}

#[async_trait]
impl PipelineStage for TokenLimiter {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn enabled(&self, ctx: &PipelineContext<'_>) -> bool {
        let cm = &ctx.input.agent.parameters.context_management;
        cm.enabled && cm.max_context_tokens > 0
    }

    async fn run(&self, ctx: &mut PipelineContext<'_>) -> StageResult {
        let cm = ctx.input.agent.parameters.context_management.clone();
        let model_id = ctx.input.agent.model_id.clone();
        let model = ctx.input.model;
        let budget = cm.max_context_tokens as u64;

        let costs: Vec<u64> = ctx
            .messages
            .iter()
            .map(|m| self.message_cost(m, &model_id, model))
            .collect();

        let reserved: u64 = ctx
            .messages
            .iter()
            .zip(&costs)
            .filter(|(m, _)| m.source.kind.is_protected())
            .map(|(_, c)| *c)
            .sum();

        if reserved > budget {
            warn!(
                reserved,
                budget, "token budget exceeded by protected messages alone"
            );
            ctx.warn(
                STAGE,
                format!("protected messages ({reserved} tokens) exceed budget ({budget})"),
            );
            return Ok(());
        }
        let remaining = budget - reserved;

        // Disposable indices in list order (oldest first).
        let disposable: Vec<usize> = ctx
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.source.kind.is_protected())
            .map(|(i, _)| i)
            .collect();

        // Keep the newest suffix that fits.
        let mut kept: Vec<usize> = Vec::new();
        let mut total = 0u64;
        for &i in disposable.iter().rev() {
            if total + costs[i] > remaining {
                break;
            }
            total += costs[i];
            kept.push(i);
        }
        kept.reverse();

        if kept.len() == disposable.len() {
            ctx.trace
                .push(STAGE, format!("all {} disposable messages fit", kept.len()));
            return Ok(());
        }

        // Head-summary retention: shrink the oldest survivor; if even the
        // summary overflows, drop it and try the next.
        let mut summarized: Option<(usize, String)> = None;
        if cm.retained_characters > 0 {
            while let Some(&oldest) = kept.first() {
                let text = ctx.messages[oldest].text();
                let retained: String = text.chars().take(cm.retained_characters as usize).collect();
                if retained.chars().count() >= text.chars().count() {
                    break; // already short enough, nothing to reduce
                }
                let summary = format!("{retained}{ELLIPSIS}");
                let summary_cost = self.estimator.estimate_text(&summary, &model_id).count as u64;
                let rest: u64 = kept[1..].iter().map(|&i| costs[i]).sum();
                if rest + summary_cost <= remaining {
                    summarized = Some((oldest, summary));
                    break;
                }
                kept.remove(0);
            }
        }

        let dropped = disposable.len() - kept.len();
        let keep_set: std::collections::HashSet<usize> = kept.iter().copied().collect();
        ctx.messages = std::mem::take(&mut ctx.messages)
            .into_iter()
            .enumerate()
            .filter_map(|(i, mut message)| {
                if !message.source.kind.is_protected() && !keep_set.contains(&i) {
                    return None;
                }
                if let Some((target, summary)) = &summarized {
                    if i == *target {
                        message.set_text(summary.clone());
                        message.truncated = true;
                    }
                }
                Some(message)
            })
            .collect();

        ctx.trace.push(
            STAGE,
            format!(
                "dropped {dropped} messages, kept {} disposable ({total} tokens of {remaining})",
                kept.len()
            ),
        );
        Ok(())
    }
}
