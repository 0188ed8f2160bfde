//! Stage 4: inline plain-text attachments and swap unsupported media for
//! transcripts.
//!
//! Plain text is detected by extension plus a magic-number sniff of the
//! bytes. Non-text media stays raw when the model can ingest it and the
//! message is recent enough; otherwise an existing transcript is inlined and
//! the media dropped. A required-but-missing transcript is a warning, never
//! an error — the raw attachment rides along.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use trellis_core::{AssetKind, AssetRef};

use crate::context::{MessagePart, PipelineContext};
use crate::error::StageResult;
use crate::sources::{AssetStore, TranscriptStore};
use crate::stage::PipelineStage;

pub struct ExtractionStage {
    transcripts: Arc<dyn TranscriptStore>,
    assets: Arc<dyn AssetStore>,
}

const STAGE: &str = "extraction";

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "log", "csv", "tsv", "json", "toml", "yaml", "yml", "xml", "html",
    "css", "js", "ts", "py", "rs", "go", "java", "c", "h", "cpp", "sh", "sql", "ini", "cfg",
];

impl ExtractionStage {
    pub fn new(transcripts: Arc<dyn TranscriptStore>, assets: Arc<dyn AssetStore>) -> Self {
        Self {
            transcripts,
            assets,
        }
    }
}

#[async_trait]
impl PipelineStage for ExtractionStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    async fn run(&self, ctx: &mut PipelineContext<'_>) -> StageResult {
        let len = ctx.messages.len();
        let force_depth = ctx.input.model.force_transcribe_depth;
        let mut inlined = 0usize;
        let mut transcribed = 0usize;

        for i in 0..len {
            let depth = (len - 1 - i) as u32;
            let assets: Vec<AssetRef> = ctx.messages[i].attachments().cloned().collect();
            if assets.is_empty() {
                continue;
            }

            for asset in assets {
                if is_textual_candidate(&asset) {
                    match self.assets.read_bytes(&asset.id).await {
                        Some(bytes) if looks_like_text(&bytes) => {
                            let content = String::from_utf8_lossy(&bytes);
                            let block =
                                format!("[file: {}]\n```\n{}\n```\n", asset.name, content.trim_end());
                            let message = &mut ctx.messages[i];
                            message.append_text(&block);
                            remove_attachment(message, &asset);
                            inlined += 1;
                            continue;
                        }
                        Some(_) => {
                            // Extension lied; fall through to media handling.
                        }
                        None => {
                            ctx.warn(STAGE, format!("bytes unavailable for '{}'", asset.name));
                            continue;
                        }
                    }
                }

                let needs_transcript = !ctx.input.model.supports(asset.kind)
                    || force_depth.is_some_and(|limit| depth >= limit);
                if !needs_transcript {
                    continue;
                }

                match self.transcripts.get_transcript(&asset).await {
                    Some(text) => {
                        let message = &mut ctx.messages[i];
                        message.append_text(&format!("[transcript: {}]\n{}\n", asset.name, text));
                        remove_attachment(message, &asset);
                        transcribed += 1;
                    }
                    None => {
                        warn!(asset = %asset.name, "transcript unavailable, keeping raw media");
                        ctx.warn(
                            STAGE,
                            format!("transcript unavailable for '{}'", asset.name),
                        );
                        self.transcripts.request_transcript(&asset);
                    }
                }
            }
        }

        ctx.trace.push(
            STAGE,
            format!("{inlined} files inlined, {transcribed} transcripts applied"),
        );
        Ok(())
    }
}

fn remove_attachment(message: &mut crate::context::DraftMessage, asset: &AssetRef) {
    message
        .parts
        .retain(|part| !matches!(part, MessagePart::Attachment { asset: a } if a.id == asset.id));
}

fn is_textual_candidate(asset: &AssetRef) -> bool {
    if asset.kind == AssetKind::Text {
        return true;
    }
    asset
        .name
        .rsplit_once('.')
        .is_some_and(|(_, ext)| TEXT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Magic-number sniff: real text has no NUL bytes in its head.
fn looks_like_text(bytes: &[u8]) -> bool {
    !bytes.iter().take(512).any(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DraftMessage, MessageSource, PipelineContext, PipelineInput, SourceKind};
    use crate::model::ModelProfile;
    use std::collections::HashMap;
    use trellis_core::{
        AgentDefinition, AssetId, FormatConfig, Role, Session,
    };

    struct FixtureAssets(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl AssetStore for FixtureAssets {
        async fn read_bytes(&self, id: &AssetId) -> Option<Vec<u8>> {
            self.0.get(id.as_str()).cloned()
        }
    }

    struct FixtureTranscripts(HashMap<String, String>);

    #[async_trait]
    impl TranscriptStore for FixtureTranscripts {
        async fn get_transcript(&self, asset: &AssetRef) -> Option<String> {
            self.0.get(asset.id.as_str()).cloned()
        }
    }

    fn message_with(asset: AssetRef) -> DraftMessage {
        let mut msg = DraftMessage::text_message(
            Role::User,
            "see attached",
            MessageSource::new(SourceKind::SessionHistory, None, 0),
        );
        msg.parts.push(MessagePart::Attachment { asset });
        msg
    }

    async fn run_stage(
        model: ModelProfile,
        messages: Vec<DraftMessage>,
        assets: FixtureAssets,
        transcripts: FixtureTranscripts,
    ) -> (Vec<DraftMessage>, Vec<String>) {
        let session = Session::new("sys");
        let agent = AgentDefinition::named("a", "Agent", "m");
        let format = FormatConfig::default();
        let input = PipelineInput {
            session: &session,
            agent: &agent,
            user_profile: None,
            global_regex: &[],
            model: &model,
            exclude: None,
            format: &format,
        };
        let mut ctx = PipelineContext::new(input);
        ctx.messages = messages;
        let stage = ExtractionStage::new(Arc::new(transcripts), Arc::new(assets));
        stage.run(&mut ctx).await.unwrap();
        (ctx.messages, ctx.warnings)
    }

    #[tokio::test]
    async fn text_file_is_inlined_and_dropped() {
        let mut asset = AssetRef::new("notes.txt", AssetKind::Text);
        asset.id = AssetId::from("a1");
        let assets = FixtureAssets(HashMap::from([(
            "a1".to_string(),
            b"line one\nline two".to_vec(),
        )]));
        let (out, warnings) = run_stage(
            ModelProfile::text_only(),
            vec![message_with(asset)],
            assets,
            FixtureTranscripts(HashMap::new()),
        )
        .await;
        assert!(warnings.is_empty());
        assert!(out[0].text().contains("[file: notes.txt]"));
        assert!(out[0].text().contains("line one\nline two"));
        assert_eq!(out[0].attachments().count(), 0);
    }

    #[tokio::test]
    async fn unsupported_media_uses_transcript() {
        let mut asset = AssetRef::new("clip.mp3", AssetKind::Audio);
        asset.id = AssetId::from("a2");
        let transcripts = FixtureTranscripts(HashMap::from([(
            "a2".to_string(),
            "spoken words".to_string(),
        )]));
        let (out, _) = run_stage(
            ModelProfile::text_only(),
            vec![message_with(asset)],
            FixtureAssets(HashMap::new()),
            transcripts,
        )
        .await;
        assert!(out[0].text().contains("[transcript: clip.mp3]"));
        assert!(out[0].text().contains("spoken words"));
        assert_eq!(out[0].attachments().count(), 0);
    }

    #[tokio::test]
    async fn supported_media_stays_raw() {
        let mut asset = AssetRef::new("photo.png", AssetKind::Image);
        asset.id = AssetId::from("a3");
        let (out, warnings) = run_stage(
            ModelProfile::multimodal(),
            vec![message_with(asset)],
            FixtureAssets(HashMap::new()),
            FixtureTranscripts(HashMap::new()),
        )
        .await;
        assert!(warnings.is_empty());
        assert_eq!(out[0].attachments().count(), 1);
        assert_eq!(out[0].text(), "see attached");
    }

    #[tokio::test]
    async fn missing_transcript_keeps_media_and_warns() {
        let mut asset = AssetRef::new("clip.wav", AssetKind::Audio);
        asset.id = AssetId::from("a4");
        let (out, warnings) = run_stage(
            ModelProfile::text_only(),
            vec![message_with(asset)],
            FixtureAssets(HashMap::new()),
            FixtureTranscripts(HashMap::new()),
        )
        .await;
        assert_eq!(out[0].attachments().count(), 1);
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn force_transcribe_depth_overrides_support() {
        let mut old_asset = AssetRef::new("old.png", AssetKind::Image);
        old_asset.id = AssetId::from("a5");
        let mut new_asset = AssetRef::new("new.png", AssetKind::Image);
        new_asset.id = AssetId::from("a6");

        let mut model = ModelProfile::multimodal();
        model.force_transcribe_depth = Some(1);
        let transcripts = FixtureTranscripts(HashMap::from([
            ("a5".to_string(), "an old photo".to_string()),
            ("a6".to_string(), "a new photo".to_string()),
        ]));
        let (out, _) = run_stage(
            model,
            vec![message_with(old_asset), message_with(new_asset)],
            FixtureAssets(HashMap::new()),
            transcripts,
        )
        .await;
        // Depth 1 (older) is transcribed; depth 0 (newest) keeps its image.
        assert_eq!(out[0].attachments().count(), 0);
        assert!(out[0].text().contains("an old photo"));
        assert_eq!(out[1].attachments().count(), 1);
    }

    #[test]
    fn binary_sniff_rejects_nul_bytes() {
        assert!(looks_like_text(b"plain text"));
        assert!(!looks_like_text(b"\x89PNG\x00\x01"));
    }
}
