//! Context preview: the structured report behind the "what will be sent"
//! UI. Built from a dry pipeline run; nothing here mutates the session.

use serde::Serialize;

use trellis_core::Role;
use trellis_pipeline::{
    DraftMessage, PipelineOutput, SourceKind, TokenEstimator, TraceEvent,
};

#[derive(Debug, Clone, Serialize)]
pub struct PreviewMessage {
    pub role: Role,
    pub text: String,
    pub source: SourceKind,
    pub tokens: u32,
    pub truncated: bool,
}

#[derive(Debug, Serialize)]
pub struct ContextPreviewData {
    /// Preset/profile/injected messages, in final order.
    pub preset_messages: Vec<PreviewMessage>,
    /// Surviving session-history messages.
    pub history_messages: Vec<PreviewMessage>,
    /// The full canonical list, in request order.
    pub final_messages: Vec<PreviewMessage>,
    pub total_tokens: u64,
    pub trace: Vec<TraceEvent>,
    pub warnings: Vec<String>,
}

impl ContextPreviewData {
    pub fn from_output(
        output: PipelineOutput,
        estimator: &dyn TokenEstimator,
        model_id: &str,
    ) -> Self {
        let preview = |message: &DraftMessage| {
            let text = message.text();
            let tokens = estimator.estimate_text(&text, model_id).count;
            PreviewMessage {
                role: message.role,
                text,
                source: message.source.kind,
                tokens,
                truncated: message.truncated,
            }
        };

        let final_messages: Vec<PreviewMessage> = output.messages.iter().map(preview).collect();
        let preset_messages = final_messages
            .iter()
            .filter(|m| m.source.is_protected())
            .cloned()
            .collect();
        let history_messages = final_messages
            .iter()
            .filter(|m| m.source == SourceKind::SessionHistory)
            .cloned()
            .collect();
        let total_tokens = final_messages.iter().map(|m| m.tokens as u64).sum();

        Self {
            preset_messages,
            history_messages,
            final_messages,
            total_tokens,
            trace: output.trace.events().to_vec(),
            warnings: output.warnings,
        }
    }
}
