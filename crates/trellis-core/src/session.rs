use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::node::{Node, NodeKind, Role};
use crate::types::{AgentId, NodeId, SessionId};

/// Which regex rule set applies to a message during context assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleBinding {
    /// Each message uses the rule snapshot captured when its node was created.
    MessageBound,
    /// All messages use the currently configured rules.
    #[default]
    SessionBound,
}

/// Partial sampling parameters overriding the agent's defaults for one
/// session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SamplingOverrides {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// A full conversation: the node tree plus the active-leaf pointer that
/// selects the current branch.
///
/// The undo history is engine-side state and is deliberately not part of this
/// record — it does not survive restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    #[serde(default)]
    pub title: Option<String>,
    pub nodes: HashMap<NodeId, Node>,
    pub root_node_id: NodeId,
    pub active_leaf_id: NodeId,
    /// Agent of the most recent assistant turn, cached for list rendering.
    #[serde(default)]
    pub display_agent_id: Option<AgentId>,
    /// How many assistant turns each agent contributed.
    #[serde(default)]
    pub agent_usage: HashMap<String, u32>,
    #[serde(default)]
    pub parameter_overrides: Option<SamplingOverrides>,
    #[serde(default)]
    pub regex_binding: RuleBinding,
    pub created_at: String,
    pub updated_at: String,
}

impl Session {
    /// Create a session whose root is a single system node.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let root = Node::new(Role::System, system_prompt);
        let root_id = root.id.clone();
        let now = chrono::Utc::now().to_rfc3339();
        let mut nodes = HashMap::new();
        nodes.insert(root_id.clone(), root);
        Self {
            id: SessionId::new(),
            title: None,
            nodes,
            root_node_id: root_id.clone(),
            active_leaf_id: root_id,
            display_agent_id: None,
            agent_usage: HashMap::new(),
            parameter_overrides: None,
            regex_binding: RuleBinding::default(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }

    /// Check the structural invariants. Returns the first violation found.
    /// Used by tests and debug assertions; production code relies on the node
    /// store keeping these true.
    pub fn validate(&self) -> Result<(), String> {
        let root = self
            .nodes
            .get(&self.root_node_id)
            .ok_or_else(|| format!("root {} not in nodes", self.root_node_id))?;
        if root.parent_id.is_some() {
            return Err("root has a parent".to_string());
        }
        if !self.nodes.contains_key(&self.active_leaf_id) {
            return Err(format!("active leaf {} not in nodes", self.active_leaf_id));
        }

        for (id, node) in &self.nodes {
            if node.id != *id {
                return Err(format!("node {} keyed under {}", node.id, id));
            }
            if node.kind != NodeKind::Message {
                return Err(format!("anchor node {} inside session tree", id));
            }
            match &node.parent_id {
                None => {
                    if *id != self.root_node_id {
                        return Err(format!("non-root node {} has no parent", id));
                    }
                }
                Some(parent_id) => {
                    let parent = self
                        .nodes
                        .get(parent_id)
                        .ok_or_else(|| format!("parent {} of {} missing", parent_id, id))?;
                    let occurrences = parent
                        .children_ids
                        .iter()
                        .filter(|child| **child == *id)
                        .count();
                    if occurrences != 1 {
                        return Err(format!(
                            "node {} appears {} times in parent {} children",
                            id, occurrences, parent_id
                        ));
                    }
                }
            }
            for child_id in &node.children_ids {
                let child = self
                    .nodes
                    .get(child_id)
                    .ok_or_else(|| format!("child {} of {} missing", child_id, id))?;
                if child.parent_id.as_ref() != Some(id) {
                    return Err(format!("child {} does not point back to {}", child_id, id));
                }
            }
            // Acyclicity: the parent walk must terminate at the root without
            // revisiting any node.
            let mut seen = std::collections::HashSet::new();
            let mut cursor = Some(id.clone());
            while let Some(current) = cursor {
                if !seen.insert(current.clone()) {
                    return Err(format!("cycle through {}", current));
                }
                cursor = self
                    .nodes
                    .get(&current)
                    .and_then(|n| n.parent_id.clone());
            }
        }
        Ok(())
    }
}

/// Lightweight record for index listings — enough to render a session picker
/// without loading the full tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: SessionId,
    #[serde(default)]
    pub title: Option<String>,
    pub message_count: usize,
    pub updated_at: String,
}

impl From<&Session> for SessionMeta {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title.clone(),
            message_count: session.nodes.len(),
            updated_at: session.updated_at.clone(),
        }
    }
}
