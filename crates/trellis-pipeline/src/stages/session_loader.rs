//! Stage 1: linearize the active branch into the initial message list.

use async_trait::async_trait;
use regex::Regex;

use trellis_core::{NodeStatus, Role, ThinkRule};
use trellis_tree::active_path;

use crate::context::{DraftMessage, MessagePart, MessageSource, PipelineContext, SourceKind};
use crate::error::StageResult;
use crate::stage::PipelineStage;

pub struct SessionLoader;

const STAGE: &str = "session_loader";

#[async_trait]
impl PipelineStage for SessionLoader {
    fn name(&self) -> &'static str {
        STAGE
    }

    async fn run(&self, ctx: &mut PipelineContext<'_>) -> StageResult {
        let session = ctx.input.session;
        let think_rules = &ctx.input.agent.think_rules;
        let binding_is_message_bound = matches!(
            session.regex_binding,
            trellis_core::RuleBinding::MessageBound
        );

        let mut index = 0usize;
        for node in active_path(session) {
            if Some(&node.id) == ctx.input.exclude {
                continue;
            }
            if !node.enabled
                || node.status != NodeStatus::Complete
                || !matches!(node.role, Role::User | Role::Assistant)
            {
                continue;
            }

            let content = if node.role == Role::Assistant {
                strip_reasoning(&node.content, think_rules)
            } else {
                node.content.clone()
            };

            let mut parts = vec![MessagePart::text(content)];
            for asset in &node.attachments {
                parts.push(MessagePart::Attachment {
                    asset: asset.clone(),
                });
            }

            ctx.messages.push(DraftMessage {
                role: node.role,
                parts,
                source: MessageSource::new(
                    SourceKind::SessionHistory,
                    Some(node.id.to_string()),
                    index,
                ),
                order: 0,
                truncated: false,
                bound_rules: if binding_is_message_bound {
                    node.metadata.rule_snapshot.clone()
                } else {
                    None
                },
            });
            index += 1;
        }

        ctx.trace
            .push(STAGE, format!("loaded {} history messages", index));
        Ok(())
    }
}

/// Remove reasoning blocks from assistant text before it is re-sent to a
/// provider. Unparseable patterns are skipped.
fn strip_reasoning(content: &str, rules: &[ThinkRule]) -> String {
    let mut out = content.to_string();
    for rule in rules.iter().filter(|r| r.enabled) {
        if let Ok(re) = Regex::new(&rule.pattern) {
            out = re.replace_all(&out, "").into_owned();
        }
    }
    out
}
