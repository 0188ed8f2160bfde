//! External data-source seams consumed by the pipeline.
//!
//! Defined here, in the consuming crate, so the asset and transcription
//! subsystems can depend on `trellis-pipeline` without a cycle.

use async_trait::async_trait;

use trellis_core::{AssetId, AssetRef};

/// Read access to asset binary content, used by the extraction stage (text
/// inlining) and the terminal asset resolver (Base64 encoding).
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Returns `None` when the asset is unknown or its bytes are unavailable.
    async fn read_bytes(&self, id: &AssetId) -> Option<Vec<u8>>;
}

/// Transcript lookup for non-text attachments.
///
/// The pipeline only ever reads existing transcripts; `request_transcript`
/// is fire-and-forget so a missing transcript can be ready next turn.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn get_transcript(&self, asset: &AssetRef) -> Option<String>;

    /// Kick off transcription in the background. Never awaited here.
    fn request_transcript(&self, _asset: &AssetRef) {}
}

/// An asset store with no assets — useful for text-only deployments and
/// tests that never touch attachments.
pub struct NoAssets;

#[async_trait]
impl AssetStore for NoAssets {
    async fn read_bytes(&self, _id: &AssetId) -> Option<Vec<u8>> {
        None
    }
}

#[async_trait]
impl TranscriptStore for NoAssets {
    async fn get_transcript(&self, _asset: &AssetRef) -> Option<String> {
        None
    }
}
