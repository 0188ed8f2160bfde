//! Core data model for the trellis chat engine: id newtypes, the
//! tree-structured node/session model, agent definitions, and engine
//! configuration.
//!
//! This crate is pure data — mutation logic lives in `trellis-tree`, context
//! assembly in `trellis-pipeline`, and orchestration in `trellis-engine`.

pub mod agent;
pub mod config;
pub mod node;
pub mod session;
pub mod types;

pub use agent::{
    AgentDefinition, AgentParameters, AnchorPosition, AnchorTarget, ApplyTarget, ContextManagement,
    DepthRange, InjectionStrategy, PresetMessage, RegexPreset, RegexRule, SamplingParams,
    SubstitutionMode, ThinkRule, UserProfile,
};
pub use config::{FormatConfig, HistoryTuning, StreamConfig, TrellisConfig};
pub use node::{
    AgentSnapshot, AssetKind, AssetRef, CompressionInfo, Node, NodeDraft, NodeKind, NodeMetadata,
    NodeStatus, NodeUpdate, PerfStats, Role, TokenUsage,
};
pub use session::{RuleBinding, SamplingOverrides, Session, SessionMeta};
pub use types::{AgentId, AssetId, NodeId, SessionId};
