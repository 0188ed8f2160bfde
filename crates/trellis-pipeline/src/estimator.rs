//! Token estimation seam. Real tokenizers live outside the core; the
//! pipeline only needs counts. `CharEstimator` is the shipping fallback and
//! the estimator used in tests.

use serde::{Deserialize, Serialize};

/// Result of a text estimation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEstimate {
    pub count: u32,
    /// True when the count is heuristic rather than from a real tokenizer.
    pub estimated: bool,
    pub tokenizer_name: Option<String>,
}

/// Converts image dimensions to a token count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum VisionCostRule {
    /// Flat cost per image regardless of size.
    Fixed { tokens: u32 },
    /// Base cost plus a per-tile cost over a fixed tile grid.
    Tiled {
        base: u32,
        per_tile: u32,
        tile_width: u32,
        tile_height: u32,
    },
}

impl VisionCostRule {
    pub fn cost(&self, width: u32, height: u32) -> u32 {
        match *self {
            VisionCostRule::Fixed { tokens } => tokens,
            VisionCostRule::Tiled {
                base,
                per_tile,
                tile_width,
                tile_height,
            } => {
                // Unknown dimensions count as a single tile.
                let tiles_x = width.div_ceil(tile_width.max(1)).max(1);
                let tiles_y = height.div_ceil(tile_height.max(1)).max(1);
                base + tiles_x * tiles_y * per_tile
            }
        }
    }
}

impl Default for VisionCostRule {
    fn default() -> Self {
        VisionCostRule::Fixed { tokens: 768 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DocumentCostRule {
    PerPage { tokens: u32 },
    Fixed { tokens: u32 },
}

impl Default for DocumentCostRule {
    fn default() -> Self {
        DocumentCostRule::PerPage { tokens: 800 }
    }
}

/// External tokenizer interface consumed by the token limiter and the
/// context preview.
pub trait TokenEstimator: Send + Sync {
    fn estimate_text(&self, text: &str, model_id: &str) -> TokenEstimate;

    fn estimate_image(&self, width: u32, height: u32, rule: &VisionCostRule) -> u32 {
        rule.cost(width, height)
    }

    fn estimate_audio(&self, duration_secs: f64) -> u32;

    fn estimate_video(&self, duration_secs: f64) -> u32;

    fn estimate_document(&self, pages: u32, rule: &DocumentCostRule) -> u32 {
        match *rule {
            DocumentCostRule::PerPage { tokens } => pages.max(1) * tokens,
            DocumentCostRule::Fixed { tokens } => tokens,
        }
    }
}

/// Heuristic fallback: roughly four characters per token for Latin-heavy
/// text. Always flagged as estimated.
pub struct CharEstimator;

impl TokenEstimator for CharEstimator {
    fn estimate_text(&self, text: &str, _model_id: &str) -> TokenEstimate {
        TokenEstimate {
            count: (text.chars().count() as u32).div_ceil(4),
            estimated: true,
            tokenizer_name: None,
        }
    }

    fn estimate_audio(&self, duration_secs: f64) -> u32 {
        (duration_secs * 25.0).ceil() as u32
    }

    fn estimate_video(&self, duration_secs: f64) -> u32 {
        (duration_secs * 258.0).ceil() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_estimator_rounds_up() {
        let est = CharEstimator.estimate_text("abcde", "any");
        assert_eq!(est.count, 2);
        assert!(est.estimated);
    }

    #[test]
    fn fixed_vision_cost_ignores_dimensions() {
        let rule = VisionCostRule::Fixed { tokens: 100 };
        assert_eq!(rule.cost(0, 0), 100);
        assert_eq!(rule.cost(4000, 4000), 100);
    }

    #[test]
    fn tiled_vision_cost() {
        let rule = VisionCostRule::Tiled {
            base: 85,
            per_tile: 170,
            tile_width: 512,
            tile_height: 512,
        };
        assert_eq!(rule.cost(512, 512), 85 + 170);
        assert_eq!(rule.cost(1024, 512), 85 + 2 * 170);
        // Unknown dimensions fall back to one tile.
        assert_eq!(rule.cost(0, 0), 85 + 170);
    }

    #[test]
    fn document_cost_per_page() {
        let rule = DocumentCostRule::PerPage { tokens: 500 };
        assert_eq!(CharEstimator.estimate_document(3, &rule), 1500);
        assert_eq!(CharEstimator.estimate_document(0, &rule), 500);
    }
}
