//! The shared state every pipeline stage reads and writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trellis_core::{
    AgentDefinition, AssetRef, FormatConfig, NodeId, RegexPreset, RegexRule, Role, Session,
    UserProfile,
};

use crate::model::ModelProfile;
use crate::trace::TraceBuffer;

/// Where a draft message came from. Drives token-limiter protection and the
/// preview report's grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    SessionHistory,
    AgentPreset,
    UserProfile,
    DepthInjection,
    AnchorInjection,
    Worldbook,
    /// Inserted by format processors (e.g. alternation padding).
    Synthetic,
}

impl SourceKind {
    /// Protected messages are never truncated by the token limiter.
    pub fn is_protected(&self) -> bool {
        matches!(
            self,
            SourceKind::AgentPreset
                | SourceKind::UserProfile
                | SourceKind::DepthInjection
                | SourceKind::AnchorInjection
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSource {
    pub kind: SourceKind,
    /// Node id / preset id / worldbook entry id, where applicable.
    pub id: Option<String>,
    /// Sequential index within the originating collection.
    pub index: usize,
}

impl MessageSource {
    pub fn new(kind: SourceKind, id: Option<String>, index: usize) -> Self {
        Self { kind, id, index }
    }
}

/// Tagged union of message content.
///
/// Until the terminal asset-resolver stage, attachment parts are typed
/// handles (`Attachment`); the resolver turns them into inline Base64 parts
/// or provider file URIs, producing the canonical request form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    /// Intermediate form: an unresolved asset handle.
    Attachment { asset: AssetRef },
    Image { media_type: String, data: String },
    Audio { media_type: String, data: String },
    Video { media_type: String, data: String },
    Document { media_type: String, data: String },
    /// Provider-managed file reference instead of inline bytes.
    FileUri { media_type: String, uri: String },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult { id: String, content: String },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }

    pub fn is_attachment(&self) -> bool {
        matches!(self, MessagePart::Attachment { .. })
    }
}

/// One message flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftMessage {
    pub role: Role,
    pub parts: Vec<MessagePart>,
    pub source: MessageSource,
    /// Tie-break key for injected messages sharing an insertion point.
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub truncated: bool,
    /// Rules captured at node creation, used in message-bound binding mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_rules: Option<Vec<RegexRule>>,
}

impl DraftMessage {
    pub fn text_message(role: Role, text: impl Into<String>, source: MessageSource) -> Self {
        Self {
            role,
            parts: vec![MessagePart::text(text)],
            source,
            order: 0,
            truncated: false,
            bound_rules: None,
        }
    }

    /// Concatenated text content (most messages have a single text part).
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// Replace the first text part (or prepend one) with `text`, dropping any
    /// further text parts.
    pub fn set_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        let mut replaced = false;
        self.parts.retain_mut(|part| match part {
            MessagePart::Text { text: existing } => {
                if replaced {
                    false
                } else {
                    *existing = text.clone();
                    replaced = true;
                    true
                }
            }
            _ => true,
        });
        if !replaced {
            self.parts.insert(0, MessagePart::text(text));
        }
    }

    pub fn append_text(&mut self, extra: &str) {
        if let Some(MessagePart::Text { text }) = self
            .parts
            .iter_mut()
            .rev()
            .find(|p| matches!(p, MessagePart::Text { .. }))
        {
            text.push_str(extra);
        } else {
            self.parts.push(MessagePart::text(extra));
        }
    }

    pub fn attachments(&self) -> impl Iterator<Item = &AssetRef> {
        self.parts.iter().filter_map(|part| match part {
            MessagePart::Attachment { asset } => Some(asset),
            _ => None,
        })
    }

    pub fn has_content(&self) -> bool {
        self.parts.iter().any(|part| match part {
            MessagePart::Text { text } => !text.is_empty(),
            _ => true,
        })
    }
}

/// Immutable inputs the executor hands to one pipeline run.
#[derive(Clone, Copy)]
pub struct PipelineInput<'a> {
    pub session: &'a Session,
    pub agent: &'a AgentDefinition,
    pub user_profile: Option<&'a UserProfile>,
    /// Rule presets configured globally (outside any agent/profile).
    pub global_regex: &'a [RegexPreset],
    pub model: &'a ModelProfile,
    /// The in-flight assistant node, excluded from session loading.
    pub exclude: Option<&'a NodeId>,
    pub format: &'a FormatConfig,
}

/// Mutable state threaded through the stages.
pub struct PipelineContext<'a> {
    pub input: PipelineInput<'a>,
    pub messages: Vec<DraftMessage>,
    pub now: DateTime<Utc>,
    pub trace: TraceBuffer,
    pub warnings: Vec<String>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(input: PipelineInput<'a>) -> Self {
        Self {
            input,
            messages: Vec::new(),
            now: Utc::now(),
            trace: TraceBuffer::default(),
            warnings: Vec::new(),
        }
    }

    pub fn warn(&mut self, stage: &'static str, message: impl Into<String>) {
        let message = message.into();
        self.trace.push(stage, message.clone());
        self.warnings.push(message);
    }
}

/// What the pipeline hands back to the executor.
#[derive(Debug)]
pub struct PipelineOutput {
    pub messages: Vec<DraftMessage>,
    pub trace: TraceBuffer,
    pub warnings: Vec<String>,
}
