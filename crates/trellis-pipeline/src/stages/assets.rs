//! Stage 8 (terminal): resolve remaining attachment handles into the
//! canonical request form — inline Base64 data or provider file URIs,
//! depending on the provider's preference.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use trellis_core::{AssetKind, AssetRef};

use crate::context::{MessagePart, PipelineContext};
use crate::error::StageResult;
use crate::model::DocumentFormat;
use crate::sources::AssetStore;
use crate::stage::PipelineStage;

pub struct AssetResolver {
    assets: Arc<dyn AssetStore>,
}

const STAGE: &str = "asset_resolver";

impl AssetResolver {
    pub fn new(assets: Arc<dyn AssetStore>) -> Self {
        Self { assets }
    }
}

#[async_trait]
impl PipelineStage for AssetResolver {
    fn name(&self) -> &'static str {
        STAGE
    }

    async fn run(&self, ctx: &mut PipelineContext<'_>) -> StageResult {
        let document_format = ctx.input.model.document_format;
        let mut resolved = 0usize;
        let mut dropped = 0usize;

        for i in 0..ctx.messages.len() {
            let mut parts = std::mem::take(&mut ctx.messages[i].parts);
            let mut out = Vec::with_capacity(parts.len());
            for part in parts.drain(..) {
                let MessagePart::Attachment { asset } = part else {
                    out.push(part);
                    continue;
                };

                if asset.kind == AssetKind::Document && document_format == DocumentFormat::ProviderFile
                {
                    out.push(MessagePart::FileUri {
                        media_type: media_type(&asset),
                        uri: format!("asset://{}", asset.id),
                    });
                    resolved += 1;
                    continue;
                }

                match self.assets.read_bytes(&asset.id).await {
                    Some(bytes) => {
                        let data = BASE64.encode(&bytes);
                        let media_type = media_type(&asset);
                        out.push(match asset.kind {
                            AssetKind::Image => MessagePart::Image { media_type, data },
                            AssetKind::Audio => MessagePart::Audio { media_type, data },
                            AssetKind::Video => MessagePart::Video { media_type, data },
                            _ => MessagePart::Document { media_type, data },
                        });
                        resolved += 1;
                    }
                    None => {
                        ctx.warnings
                            .push(format!("asset '{}' unresolvable, dropped", asset.name));
                        dropped += 1;
                    }
                }
            }
            ctx.messages[i].parts = out;
        }

        ctx.trace.push(
            STAGE,
            format!("{resolved} assets resolved, {dropped} dropped"),
        );
        Ok(())
    }
}

fn media_type(asset: &AssetRef) -> String {
    if let Some(mime) = &asset.mime {
        return mime.clone();
    }
    match asset.kind {
        AssetKind::Image => "image/png",
        AssetKind::Audio => "audio/mpeg",
        AssetKind::Video => "video/mp4",
        AssetKind::Document => "application/pdf",
        AssetKind::Text => "text/plain",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DraftMessage, MessageSource, PipelineInput, SourceKind};
    use crate::model::ModelProfile;
    use std::collections::HashMap;
    use trellis_core::{AgentDefinition, AssetId, FormatConfig, Role, Session};

    struct FixtureAssets(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl AssetStore for FixtureAssets {
        async fn read_bytes(&self, id: &AssetId) -> Option<Vec<u8>> {
            self.0.get(id.as_str()).cloned()
        }
    }

    fn message_with(asset: AssetRef) -> DraftMessage {
        let mut msg = DraftMessage::text_message(
            Role::User,
            "look",
            MessageSource::new(SourceKind::SessionHistory, None, 0),
        );
        msg.parts.push(MessagePart::Attachment { asset });
        msg
    }

    async fn resolve(
        model: ModelProfile,
        messages: Vec<DraftMessage>,
        assets: FixtureAssets,
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
        AssetResolver::new(Arc::new(assets))
            .run(&mut ctx)
            .await
            .unwrap();
        (ctx.messages, ctx.warnings)
    }

    #[tokio::test]
    async fn image_becomes_base64_part() {
        let mut asset = AssetRef::new("pic.png", AssetKind::Image);
        asset.id = AssetId::from("a1");
        asset.mime = Some("image/png".to_string());
        let assets = FixtureAssets(HashMap::from([("a1".to_string(), vec![1, 2, 3])]));
        let (out, warnings) = resolve(ModelProfile::multimodal(), vec![message_with(asset)], assets).await;
        assert!(warnings.is_empty());
        match &out[0].parts[1] {
            MessagePart::Image { media_type, data } => {
                assert_eq!(media_type, "image/png");
                assert_eq!(data, &BASE64.encode([1u8, 2, 3]));
            }
            other => panic!("expected image part, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn provider_file_preference_emits_uri() {
        let mut model = ModelProfile::multimodal();
        model.document_format = DocumentFormat::ProviderFile;
        let mut asset = AssetRef::new("paper.pdf", AssetKind::Document);
        asset.id = AssetId::from("d1");
        let (out, _) = resolve(model, vec![message_with(asset)], FixtureAssets(HashMap::new())).await;
        match &out[0].parts[1] {
            MessagePart::FileUri { uri, media_type } => {
                assert_eq!(uri, "asset://d1");
                assert_eq!(media_type, "application/pdf");
            }
            other => panic!("expected file uri, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unresolvable_asset_is_dropped_with_warning() {
        let mut asset = AssetRef::new("gone.png", AssetKind::Image);
        asset.id = AssetId::from("missing");
        let (out, warnings) =
            resolve(ModelProfile::multimodal(), vec![message_with(asset)], FixtureAssets(HashMap::new()))
                .await;
        assert_eq!(out[0].parts.len(), 1);
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn no_attachments_is_noop() {
        let msg = DraftMessage::text_message(
            Role::User,
            "plain",
            MessageSource::new(SourceKind::SessionHistory, None, 0),
        );
        let before = vec![msg];
        let (out, _) = resolve(
            ModelProfile::text_only(),
            before.clone(),
            FixtureAssets(HashMap::new()),
        )
        .await;
        assert_eq!(out, before);
    }
}
