//! Stage 7: normalize the message list for vendor constraints.
//!
//! Four rules, each individually configurable: coalesce system messages to
//! the head, fold consecutive same-role messages, pad strict-alternation
//! vendors with empty turns, and demote non-head system messages to user.

use async_trait::async_trait;

use trellis_core::Role;

use crate::context::{DraftMessage, MessagePart, MessageSource, PipelineContext, SourceKind};
use crate::error::StageResult;
use crate::stage::PipelineStage;

pub struct FormatStage;

const STAGE: &str = "format";

#[async_trait]
impl PipelineStage for FormatStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    async fn run(&self, ctx: &mut PipelineContext<'_>) -> StageResult {
        let config = ctx.input.format.clone();
        let mut messages = std::mem::take(&mut ctx.messages);

        if config.merge_system_to_head {
            messages = merge_system_to_head(messages, &config.separator);
        }
        if config.merge_consecutive_roles {
            messages = merge_consecutive_roles(messages, &config.separator);
        }
        if config.convert_system_to_user {
            messages = convert_system_to_user(messages);
        }
        if config.ensure_alternating_roles {
            messages = ensure_alternating_roles(messages);
        }

        ctx.messages = messages;
        ctx.trace
            .push(STAGE, format!("{} messages after formatting", ctx.messages.len()));
        Ok(())
    }
}

/// Fold message `b` into `a`, joining text with the separator and keeping
/// non-text parts in order.
fn merge_into(a: &mut DraftMessage, b: DraftMessage, separator: &str) {
    let b_text = b.text();
    if !b_text.is_empty() {
        if a.text().is_empty() {
            a.set_text(b_text);
        } else {
            a.append_text(separator);
            a.append_text(&b_text);
        }
    }
    a.parts.extend(
        b.parts
            .into_iter()
            .filter(|part| !matches!(part, MessagePart::Text { .. })),
    );
}

/// Coalesce every system message into a single message at position 0.
pub fn merge_system_to_head(messages: Vec<DraftMessage>, separator: &str) -> Vec<DraftMessage> {
    let mut head: Option<DraftMessage> = None;
    let mut rest = Vec::with_capacity(messages.len());
    for message in messages {
        if message.role == Role::System {
            match &mut head {
                None => head = Some(message),
                Some(existing) => merge_into(existing, message, separator),
            }
        } else {
            rest.push(message);
        }
    }
    match head {
        Some(head) => {
            let mut out = Vec::with_capacity(rest.len() + 1);
            out.push(head);
            out.extend(rest);
            out
        }
        None => rest,
    }
}

/// Fold adjacent same-role messages into one. Idempotent: a second pass
/// finds no adjacent pair.
pub fn merge_consecutive_roles(messages: Vec<DraftMessage>, separator: &str) -> Vec<DraftMessage> {
    let mut out: Vec<DraftMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        match out.last_mut() {
            Some(last) if last.role == message.role => merge_into(last, message, separator),
            _ => out.push(message),
        }
    }
    out
}

/// Rewrite system → user everywhere past the head message.
pub fn convert_system_to_user(mut messages: Vec<DraftMessage>) -> Vec<DraftMessage> {
    for message in messages.iter_mut().skip(1) {
        if message.role == Role::System {
            message.role = Role::User;
        }
    }
    messages
}

/// Insert empty opposite-role messages so user/assistant turns strictly
/// alternate (the head system message, if any, is left alone).
pub fn ensure_alternating_roles(messages: Vec<DraftMessage>) -> Vec<DraftMessage> {
    let mut out: Vec<DraftMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        if message.role != Role::System {
            if let Some(last) = out.last() {
                if last.role == message.role {
                    let filler_role = match message.role {
                        Role::User => Role::Assistant,
                        _ => Role::User,
                    };
                    out.push(DraftMessage::text_message(
                        filler_role,
                        "",
                        MessageSource::new(SourceKind::Synthetic, None, 0),
                    ));
                }
            }
        }
        out.push(message);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, text: &str) -> DraftMessage {
        DraftMessage::text_message(
            role,
            text,
            MessageSource::new(SourceKind::SessionHistory, None, 0),
        )
    }

    fn texts(messages: &[DraftMessage]) -> Vec<(Role, String)> {
        messages.iter().map(|m| (m.role, m.text())).collect()
    }

    #[test]
    fn system_messages_collapse_to_head() {
        let out = merge_system_to_head(
            vec![
                msg(Role::System, "a"),
                msg(Role::User, "u"),
                msg(Role::System, "b"),
            ],
            "\n---\n",
        );
        assert_eq!(
            texts(&out),
            vec![
                (Role::System, "a\n---\nb".to_string()),
                (Role::User, "u".to_string())
            ]
        );
    }

    #[test]
    fn merge_consecutive_is_idempotent() {
        let input = vec![
            msg(Role::User, "a"),
            msg(Role::User, "b"),
            msg(Role::Assistant, "c"),
            msg(Role::Assistant, "d"),
            msg(Role::User, "e"),
        ];
        let once = merge_consecutive_roles(input, "|");
        let twice = merge_consecutive_roles(once.clone(), "|");
        assert_eq!(once, twice);
        assert_eq!(
            texts(&once),
            vec![
                (Role::User, "a|b".to_string()),
                (Role::Assistant, "c|d".to_string()),
                (Role::User, "e".to_string())
            ]
        );
    }

    #[test]
    fn convert_system_past_head() {
        let out = convert_system_to_user(vec![
            msg(Role::System, "keep"),
            msg(Role::System, "demote"),
            msg(Role::User, "u"),
        ]);
        assert_eq!(
            out.iter().map(|m| m.role).collect::<Vec<_>>(),
            vec![Role::System, Role::User, Role::User]
        );
    }

    #[test]
    fn alternation_padding_inserts_empty_turns() {
        let out = ensure_alternating_roles(vec![
            msg(Role::System, "s"),
            msg(Role::User, "u1"),
            msg(Role::User, "u2"),
        ]);
        assert_eq!(out.len(), 4);
        assert_eq!(out[2].role, Role::Assistant);
        assert_eq!(out[2].text(), "");
        assert_eq!(out[2].source.kind, SourceKind::Synthetic);
    }

    #[test]
    fn alternation_leaves_alternating_input_alone() {
        let input = vec![
            msg(Role::User, "u"),
            msg(Role::Assistant, "a"),
            msg(Role::User, "u2"),
        ];
        let out = ensure_alternating_roles(input.clone());
        assert_eq!(out, input);
    }

    #[test]
    fn merge_preserves_non_text_parts() {
        let mut with_attachment = msg(Role::User, "a");
        with_attachment.parts.push(MessagePart::Attachment {
            asset: trellis_core::AssetRef::new("f.png", trellis_core::AssetKind::Image),
        });
        let out = merge_consecutive_roles(vec![with_attachment, msg(Role::User, "b")], "|");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text(), "a|b");
        assert_eq!(out[0].parts.len(), 2);
    }
}
