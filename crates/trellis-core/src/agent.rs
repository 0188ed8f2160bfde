use serde::{Deserialize, Serialize};

use crate::node::{Node, Role};
use crate::types::AgentId;

/// Sampling parameters forwarded to the LLM request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    1.0
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: None,
            max_tokens: default_max_tokens(),
            stop: Vec::new(),
        }
    }
}

/// Token-budget policy for context assembly. `max_context_tokens == 0` means
/// unlimited even when enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContextManagement {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_context_tokens: u32,
    /// When > 0, the oldest surviving message is reduced to this many leading
    /// characters instead of being dropped outright.
    #[serde(default)]
    pub retained_characters: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgentParameters {
    #[serde(default)]
    pub sampling: SamplingParams,
    #[serde(default)]
    pub context_management: ContextManagement,
}

/// A pattern that strips reasoning blocks from assistant content before it is
/// re-sent to a provider (e.g. `<think>...</think>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkRule {
    pub pattern: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Which rendering of the conversation a regex rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyTarget {
    /// UI display only — ignored by the context pipeline.
    Render,
    /// The assembled LLM request.
    Request,
}

/// How template variables in a rule's replacement string are expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubstitutionMode {
    /// Replacement is used literally; template variables are not expanded.
    #[default]
    None,
    /// `{{user}}` / `{{char}}` are inserted verbatim.
    Raw,
    /// Template values are regex-escaped before insertion.
    Escaped,
}

/// Depth window measured from the tail of the message list (0 = last).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthRange {
    pub min: u32,
    /// Inclusive; `None` = unbounded.
    #[serde(default)]
    pub max: Option<u32>,
}

impl DepthRange {
    pub fn contains(&self, depth: u32) -> bool {
        depth >= self.min && self.max.map_or(true, |max| depth <= max)
    }
}

/// One user-configured text substitution rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegexRule {
    #[serde(default)]
    pub name: String,
    pub pattern: String,
    pub replacement: String,
    /// Regex flags as a letter string, e.g. "i", "im", "s".
    #[serde(default)]
    pub flags: String,
    pub target_roles: Vec<Role>,
    #[serde(default)]
    pub depth_range: Option<DepthRange>,
    pub apply_to: ApplyTarget,
    #[serde(default)]
    pub substitution: SubstitutionMode,
    #[serde(default)]
    pub priority: i32,
    /// Strings trimmed from every captured group before expansion.
    #[serde(default)]
    pub trim_from_captures: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// An ordered bundle of regex rules toggled as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegexPreset {
    pub name: String,
    pub rules: Vec<RegexRule>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Named insertion point used by anchor injection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorTarget {
    ChatHistory,
    UserProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorPosition {
    Before,
    After,
}

/// Where a preset message lands in the assembled message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InjectionStrategy {
    /// Implicit: position follows the chat-history anchor's location within
    /// the preset list.
    #[default]
    Default,
    /// Insert at `len(messages) - depth` (0 = after last message).
    Depth { depth: u32 },
    /// Multi-point ("10~5") or cyclic ("cycle:4") depth specification.
    AdvancedDepth { spec: String },
    /// Insert relative to a named anchor; ties broken by `order` ascending.
    Anchor {
        target: AnchorTarget,
        position: AnchorPosition,
        #[serde(default)]
        order: i32,
    },
}

/// One entry of an agent's preset list: a node (possibly an anchor sentinel)
/// plus the strategy that places it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetMessage {
    pub node: Node,
    #[serde(default)]
    pub strategy: InjectionStrategy,
}

impl PresetMessage {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            strategy: InjectionStrategy::Default,
        }
    }

    pub fn with_strategy(mut self, strategy: InjectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// A persona bound to sessions: presets, model, parameters, substitution
/// rules. Persisted opaquely; the pipeline only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    pub model_id: String,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub user_profile_id: Option<String>,
    #[serde(default)]
    pub preset_messages: Vec<PresetMessage>,
    /// How many preset messages the UI surfaces before the history anchor.
    #[serde(default)]
    pub display_preset_count: u32,
    #[serde(default)]
    pub parameters: AgentParameters,
    #[serde(default)]
    pub think_rules: Vec<ThinkRule>,
    #[serde(default)]
    pub regex_config: Vec<RegexPreset>,
}

impl AgentDefinition {
    pub fn named(id: &str, name: &str, model_id: &str) -> Self {
        Self {
            id: AgentId::from(id),
            name: name.to_string(),
            icon: None,
            model_id: model_id.to_string(),
            profile_id: None,
            user_profile_id: None,
            preset_messages: Vec::new(),
            display_preset_count: 0,
            parameters: AgentParameters::default(),
            think_rules: Vec::new(),
            regex_config: Vec::new(),
        }
    }
}

/// User persona text injected into the assembled context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub regex_config: Vec<RegexPreset>,
}
