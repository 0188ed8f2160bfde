use serde::{Deserialize, Serialize};

use trellis_core::AssetKind;

use crate::estimator::{DocumentCostRule, VisionCostRule};

/// How the provider prefers to receive document attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    /// Inline Base64 data URI.
    #[default]
    Base64,
    /// Opaque provider-managed file reference.
    ProviderFile,
}

/// Modality capabilities and cost rules for the model a request targets.
/// Supplied by the provider layer; the pipeline only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    #[serde(default)]
    pub supports_images: bool,
    #[serde(default)]
    pub supports_audio: bool,
    #[serde(default)]
    pub supports_video: bool,
    #[serde(default)]
    pub supports_documents: bool,
    #[serde(default)]
    pub vision_cost: VisionCostRule,
    #[serde(default)]
    pub document_cost: DocumentCostRule,
    #[serde(default)]
    pub document_format: DocumentFormat,
    /// Messages at or beyond this tail depth always use transcripts instead
    /// of raw media, even when the modality is supported.
    #[serde(default)]
    pub force_transcribe_depth: Option<u32>,
}

impl ModelProfile {
    pub fn text_only() -> Self {
        Self {
            supports_images: false,
            supports_audio: false,
            supports_video: false,
            supports_documents: false,
            vision_cost: VisionCostRule::default(),
            document_cost: DocumentCostRule::default(),
            document_format: DocumentFormat::Base64,
            force_transcribe_depth: None,
        }
    }

    pub fn multimodal() -> Self {
        Self {
            supports_images: true,
            supports_audio: true,
            supports_video: true,
            supports_documents: true,
            ..Self::text_only()
        }
    }

    pub fn supports(&self, kind: AssetKind) -> bool {
        match kind {
            AssetKind::Text => true,
            AssetKind::Image => self.supports_images,
            AssetKind::Audio => self.supports_audio,
            AssetKind::Video => self.supports_video,
            AssetKind::Document => self.supports_documents,
        }
    }
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self::text_only()
    }
}
