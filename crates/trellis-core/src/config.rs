use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// History log tuning defaults — see the history module for how each bound is
// enforced.
pub const MAX_HISTORY_LENGTH: usize = 50;
pub const SNAPSHOT_INTERVAL: usize = 15;
pub const SNAPSHOT_COMPLEXITY_THRESHOLD: usize = 30;

// Streaming defaults.
pub const STREAM_FLUSH_MS: u64 = 60; // coalesce chunk applications within this window
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Separator used when format processors merge messages.
pub const MERGE_SEPARATOR: &str = "\n\n---\n\n";

/// Top-level engine config (trellis.toml + TRELLIS_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrellisConfig {
    #[serde(default)]
    pub history: HistoryTuning,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub format: FormatConfig,
}

impl TrellisConfig {
    /// Load from `trellis.toml` (if present) with `TRELLIS_*` env overrides,
    /// e.g. `TRELLIS_STREAM__FLUSH_MS=30`.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("trellis.toml"))
            .merge(Env::prefixed("TRELLIS_").split("__"))
            .extract()
    }
}

/// Bounds for the undo/redo history log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HistoryTuning {
    /// Entries beyond this are trimmed from the front (oldest first).
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// A snapshot is forced after this many delta entries.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: usize,
    /// A snapshot is forced once the deltas since the last snapshot touch
    /// more than this many distinct nodes.
    #[serde(default = "default_complexity_threshold")]
    pub complexity_threshold: usize,
}

fn default_max_entries() -> usize {
    MAX_HISTORY_LENGTH
}

fn default_snapshot_interval() -> usize {
    SNAPSHOT_INTERVAL
}

fn default_complexity_threshold() -> usize {
    SNAPSHOT_COMPLEXITY_THRESHOLD
}

impl Default for HistoryTuning {
    fn default() -> Self {
        Self {
            max_entries: MAX_HISTORY_LENGTH,
            snapshot_interval: SNAPSHOT_INTERVAL,
            complexity_threshold: SNAPSHOT_COMPLEXITY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_flush_ms")]
    pub flush_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_flush_ms() -> u64 {
    STREAM_FLUSH_MS
}

fn default_timeout_secs() -> u64 {
    REQUEST_TIMEOUT_SECS
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_ms: STREAM_FLUSH_MS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Which message-format normalization rules run, and in what shape. Vendors
/// differ on what they accept past the head system message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatConfig {
    #[serde(default = "bool_true")]
    pub merge_system_to_head: bool,
    #[serde(default)]
    pub merge_consecutive_roles: bool,
    #[serde(default)]
    pub ensure_alternating_roles: bool,
    #[serde(default)]
    pub convert_system_to_user: bool,
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn bool_true() -> bool {
    true
}

fn default_separator() -> String {
    MERGE_SEPARATOR.to_string()
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            merge_system_to_head: true,
            merge_consecutive_roles: false,
            ensure_alternating_roles: false,
            convert_system_to_user: false,
            separator: MERGE_SEPARATOR.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = TrellisConfig::default();
        assert_eq!(config.history.max_entries, MAX_HISTORY_LENGTH);
        assert_eq!(config.history.snapshot_interval, SNAPSHOT_INTERVAL);
        assert_eq!(config.stream.flush_ms, STREAM_FLUSH_MS);
        assert_eq!(config.format.separator, MERGE_SEPARATOR);
        assert!(config.format.merge_system_to_head);
    }
}
