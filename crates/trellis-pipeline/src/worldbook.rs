//! Worldbook (lore/RAG) entry source consumed by the worldbook stage.

use serde::{Deserialize, Serialize};

use trellis_core::InjectionStrategy;

/// When a worldbook entry becomes active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ActivationMode {
    /// Active on every request, no keyword required.
    Always,
    /// Active only when one of the entry's keys matches the scanned text.
    Gate,
    /// Key-gated, and only fires every `every`-th completed user→assistant
    /// exchange along the active path. Regenerations do not advance the
    /// count; switching branches recounts from the new path.
    Turn { every: u32 },
    /// Like `Always`, but the entry content is fixed — no rescan between
    /// requests is expected by the source.
    Static,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldbookEntry {
    pub id: String,
    /// Keyword triggers; matching is substring-based.
    #[serde(default)]
    pub keys: Vec<String>,
    pub content: String,
    pub mode: ActivationMode,
    #[serde(default)]
    pub strategy: InjectionStrategy,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl WorldbookEntry {
    pub fn matches(&self, haystack: &str) -> bool {
        if self.keys.is_empty() {
            return false;
        }
        if self.case_sensitive {
            self.keys.iter().any(|key| haystack.contains(key.as_str()))
        } else {
            let lowered = haystack.to_lowercase();
            self.keys
                .iter()
                .any(|key| lowered.contains(&key.to_lowercase()))
        }
    }
}

/// External worldbook service. The stage scans messages for triggers and
/// splices active entries into the list.
pub trait WorldbookSource: Send + Sync {
    fn entries(&self) -> Vec<WorldbookEntry>;
}
