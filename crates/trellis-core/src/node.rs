use serde::{Deserialize, Serialize};
use std::fmt;

use crate::agent::RegexRule;
use crate::types::{AgentId, AssetId, NodeId};

/// The author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Lifecycle state of a node. Terminal states (`Complete`, `Error`) are never
/// re-entered once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// An LLM stream is actively appending to this node.
    Generating,
    #[default]
    Complete,
    Error,
}

/// Discriminates real messages from the sentinel anchors that only appear in
/// agent preset lists (never in session trees).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Message,
    /// Marks where session history is spliced during injection.
    ChatHistoryAnchor,
    /// Marks where the user profile is spliced during injection.
    UserProfileAnchor,
}

/// Media class of an attachment, as recorded by the asset manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
}

/// Typed handle to an externally managed asset. Dimension fields are filled
/// in by the asset manager where known; token estimation falls back to fixed
/// costs when they are absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRef {
    pub id: AssetId,
    pub name: String,
    pub kind: AssetKind,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub pages: Option<u32>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

impl AssetRef {
    pub fn new(name: impl Into<String>, kind: AssetKind) -> Self {
        Self {
            id: AssetId::new(),
            name: name.into(),
            kind,
            mime: None,
            width: None,
            height: None,
            duration_secs: None,
            pages: None,
            size_bytes: None,
        }
    }
}

/// Frozen identity of the agent that produced an assistant node, so the UI
/// keeps rendering the right name/icon even after the agent is edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
}

/// Token accounting reported by the provider for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Streaming performance measurements for one assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PerfStats {
    /// Milliseconds from request start to the first streamed token.
    pub first_token_ms: Option<u64>,
    pub tokens_per_second: Option<f64>,
}

/// Records that a message body was reduced by the token limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub original_chars: usize,
    pub retained_chars: usize,
}

/// Mutable per-node metadata. Everything here survives persistence; the regex
/// rule snapshot is only populated when the session uses message-bound rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeMetadata {
    #[serde(default)]
    pub agent: Option<AgentSnapshot>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    /// Reasoning/thinking text streamed alongside the visible content.
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub performance: Option<PerfStats>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub compression: Option<CompressionInfo>,
    /// Regex rules in effect when this node was created (message-bound mode).
    #[serde(default)]
    pub rule_snapshot: Option<Vec<RegexRule>>,
}

/// One message in the conversation tree.
///
/// `id`, `parent_id`, and `role` are immutable after creation; content,
/// attachments, status, metadata, enablement, and the child list mutate
/// through the node store only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    /// Chronological creation order.
    pub children_ids: Vec<NodeId>,
    /// Branch memory: the child last viewed under this node.
    #[serde(default)]
    pub last_selected_child_id: Option<NodeId>,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<AssetRef>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub kind: NodeKind,
    /// RFC3339 creation timestamp.
    pub timestamp: String,
    #[serde(default)]
    pub metadata: NodeMetadata,
}

fn default_true() -> bool {
    true
}

impl Node {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            parent_id: None,
            children_ids: Vec::new(),
            last_selected_child_id: None,
            role,
            content: content.into(),
            attachments: Vec::new(),
            status: NodeStatus::Complete,
            enabled: true,
            kind: NodeKind::Message,
            timestamp: chrono::Utc::now().to_rfc3339(),
            metadata: NodeMetadata::default(),
        }
    }

    /// Sentinel constructor for preset lists.
    pub fn anchor(kind: NodeKind) -> Self {
        let mut node = Self::new(Role::System, "");
        node.kind = kind;
        node
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<AssetRef>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn is_anchor(&self) -> bool {
        !matches!(self.kind, NodeKind::Message)
    }

    pub fn is_leaf(&self) -> bool {
        self.children_ids.is_empty()
    }
}

/// Fields accepted when creating a node through the store.
#[derive(Debug, Clone, Default)]
pub struct NodeDraft {
    pub role: Option<Role>,
    pub content: String,
    pub attachments: Vec<AssetRef>,
    pub status: NodeStatus,
    pub enabled: bool,
    pub metadata: NodeMetadata,
}

impl NodeDraft {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: Some(role),
            content: content.into(),
            attachments: Vec::new(),
            status: NodeStatus::Complete,
            enabled: true,
            metadata: NodeMetadata::default(),
        }
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<AssetRef>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Optional fields to update on an existing node. `None` fields are left
/// untouched. Role, parent, and id cannot be targeted through this struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub content: Option<String>,
    pub attachments: Option<Vec<AssetRef>>,
    pub status: Option<NodeStatus>,
    pub enabled: Option<bool>,
    pub metadata: Option<NodeMetadata>,
}

impl NodeUpdate {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.attachments.is_none()
            && self.status.is_none()
            && self.enabled.is_none()
            && self.metadata.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_defaults() {
        let node = Node::new(Role::User, "hi");
        assert!(node.enabled);
        assert_eq!(node.status, NodeStatus::Complete);
        assert_eq!(node.kind, NodeKind::Message);
        assert!(node.parent_id.is_none());
        assert!(node.children_ids.is_empty());
    }

    #[test]
    fn anchor_is_anchor() {
        let anchor = Node::anchor(NodeKind::ChatHistoryAnchor);
        assert!(anchor.is_anchor());
        assert!(!Node::new(Role::User, "x").is_anchor());
    }

    #[test]
    fn role_round_trips() {
        for role in [Role::System, Role::User, Role::Assistant] {
            let s = role.to_string();
            assert_eq!(s.parse::<Role>().unwrap(), role);
        }
        assert!("tool".parse::<Role>().is_err());
    }

    #[test]
    fn empty_update_is_empty() {
        assert!(NodeUpdate::default().is_empty());
        assert!(!NodeUpdate::content("x").is_empty());
    }
}
