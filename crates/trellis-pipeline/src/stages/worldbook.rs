//! Stage 5: splice worldbook entries triggered by keyword scan.
//!
//! Runs only when a worldbook source is configured. Entries use the same
//! injection vocabulary as stage 3, resolved against the post-assembly list:
//! the chat-history anchor maps to the history block's boundaries, the
//! user-profile anchor to the profile message.

use std::sync::Arc;

use async_trait::async_trait;

use trellis_core::{AnchorPosition, AnchorTarget, InjectionStrategy, NodeStatus, Role};
use trellis_tree::active_path;

use crate::context::{DraftMessage, MessageSource, PipelineContext, SourceKind};
use crate::error::StageResult;
use crate::stage::PipelineStage;
use crate::worldbook::{ActivationMode, WorldbookEntry, WorldbookSource};

pub struct WorldbookStage {
    source: Option<Arc<dyn WorldbookSource>>,
}

const STAGE: &str = "worldbook";

impl WorldbookStage {
    pub fn new(source: Option<Arc<dyn WorldbookSource>>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl PipelineStage for WorldbookStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn enabled(&self, _ctx: &PipelineContext<'_>) -> bool {
        self.source.is_some()
    }

    async fn run(&self, ctx: &mut PipelineContext<'_>) -> StageResult {
        let Some(source) = &self.source else {
            return Ok(());
        };

        let haystack: String = ctx
            .messages
            .iter()
            .map(|m| m.text())
            .collect::<Vec<_>>()
            .join("\n");
        let turns = completed_turns(ctx);

        let mut active: Vec<WorldbookEntry> = Vec::new();
        for entry in source.entries() {
            if !entry.enabled {
                continue;
            }
            let fires = match entry.mode {
                ActivationMode::Always | ActivationMode::Static => true,
                ActivationMode::Gate => entry.matches(&haystack),
                ActivationMode::Turn { every } => {
                    every > 0 && turns > 0 && turns % every == 0 && entry.matches(&haystack)
                }
            };
            if fires {
                active.push(entry);
            }
        }

        if active.is_empty() {
            ctx.trace.push(STAGE, "no entries activated");
            return Ok(());
        }

        let count = active.len();
        // Group by insertion point, splice back-to-front; ties break by
        // (order, entry position) like stage 3.
        let mut items: Vec<(usize, i32, usize, DraftMessage)> = Vec::new();
        for (index, entry) in active.into_iter().enumerate() {
            let point = resolve_point(&ctx.messages, &entry.strategy);
            let draft = DraftMessage::text_message(
                Role::System,
                entry.content.clone(),
                MessageSource::new(SourceKind::Worldbook, Some(entry.id.clone()), index),
            );
            items.push((point, entry.order, index, draft));
        }
        items.sort_by_key(|(point, order, index, _)| (*point, *order, *index));
        while let Some(&(point, ..)) = items.last() {
            let start = items
                .iter()
                .position(|(p, ..)| *p == point)
                .unwrap_or(items.len() - 1);
            let group = items.split_off(start);
            let at = point.min(ctx.messages.len());
            ctx.messages
                .splice(at..at, group.into_iter().map(|(_, _, _, msg)| msg));
        }

        ctx.trace.push(STAGE, format!("{count} entries spliced"));
        Ok(())
    }
}

/// Completed user→assistant exchanges along the active path. Regenerated
/// siblings off the path are invisible here by construction.
fn completed_turns(ctx: &PipelineContext<'_>) -> u32 {
    let mut turns = 0u32;
    let mut previous_was_user = false;
    for node in active_path(ctx.input.session) {
        match node.role {
            Role::User => previous_was_user = true,
            Role::Assistant => {
                if previous_was_user && node.status == NodeStatus::Complete {
                    turns += 1;
                }
                previous_was_user = false;
            }
            Role::System => {}
        }
    }
    turns
}

fn resolve_point(messages: &[DraftMessage], strategy: &InjectionStrategy) -> usize {
    let history_start = messages
        .iter()
        .position(|m| m.source.kind == SourceKind::SessionHistory);
    let history_end = messages
        .iter()
        .rposition(|m| m.source.kind == SourceKind::SessionHistory)
        .map(|i| i + 1);

    match strategy {
        // Default worldbook placement: before the history block.
        InjectionStrategy::Default => history_start.unwrap_or(messages.len()),
        InjectionStrategy::Depth { depth } => messages.len().saturating_sub(*depth as usize),
        InjectionStrategy::AdvancedDepth { spec } => {
            // Worldbook entries use a single point; take the first depth.
            let depth = spec
                .split('~')
                .next()
                .and_then(|part| part.trim().parse::<u32>().ok())
                .unwrap_or(0);
            messages.len().saturating_sub(depth as usize)
        }
        InjectionStrategy::Anchor {
            target, position, ..
        } => match (target, position) {
            (AnchorTarget::ChatHistory, AnchorPosition::Before) => {
                history_start.unwrap_or(messages.len())
            }
            (AnchorTarget::ChatHistory, AnchorPosition::After) => {
                history_end.unwrap_or(messages.len())
            }
            (AnchorTarget::UserProfile, position) => messages
                .iter()
                .position(|m| m.source.kind == SourceKind::UserProfile)
                .map(|i| match position {
                    AnchorPosition::Before => i,
                    AnchorPosition::After => i + 1,
                })
                .unwrap_or(0),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{PipelineInput};
    use crate::model::ModelProfile;
    use trellis_core::{AgentDefinition, FormatConfig, NodeDraft, Session};
    use trellis_tree::create_child;

    struct Fixture(Vec<WorldbookEntry>);

    impl WorldbookSource for Fixture {
        fn entries(&self) -> Vec<WorldbookEntry> {
            self.0.clone()
        }
    }

    fn entry(id: &str, keys: &[&str], mode: ActivationMode, order: i32) -> WorldbookEntry {
        WorldbookEntry {
            id: id.to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            content: format!("lore:{id}"),
            mode,
            strategy: InjectionStrategy::Default,
            order,
            case_sensitive: false,
            enabled: true,
        }
    }

    fn history(text: &str, index: usize) -> DraftMessage {
        DraftMessage::text_message(
            Role::User,
            text,
            MessageSource::new(SourceKind::SessionHistory, None, index),
        )
    }

    fn preset(text: &str) -> DraftMessage {
        DraftMessage::text_message(
            Role::System,
            text,
            MessageSource::new(SourceKind::AgentPreset, None, 0),
        )
    }

    async fn run(
        entries: Vec<WorldbookEntry>,
        messages: Vec<DraftMessage>,
        session: &Session,
    ) -> Vec<DraftMessage> {
        let agent = AgentDefinition::named("a", "Agent", "m");
        let model = ModelProfile::text_only();
        let format = FormatConfig::default();
        let input = PipelineInput {
            session,
            agent: &agent,
            user_profile: None,
            global_regex: &[],
            model: &model,
            exclude: None,
            format: &format,
        };
        let mut ctx = PipelineContext::new(input);
        ctx.messages = messages;
        WorldbookStage::new(Some(Arc::new(Fixture(entries))))
            .run(&mut ctx)
            .await
            .unwrap();
        ctx.messages
    }

    #[tokio::test]
    async fn gate_entry_requires_keyword_match() {
        let session = Session::new("sys");
        let entries = vec![
            entry("hit", &["dragon"], ActivationMode::Gate, 0),
            entry("miss", &["kraken"], ActivationMode::Gate, 0),
        ];
        let out = run(
            entries,
            vec![preset("p"), history("the dragon roars", 0)],
            &session,
        )
        .await;
        let texts: Vec<String> = out.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["p", "lore:hit", "the dragon roars"]);
    }

    #[tokio::test]
    async fn always_entry_fires_without_keys() {
        let session = Session::new("sys");
        let out = run(
            vec![entry("bg", &[], ActivationMode::Always, 0)],
            vec![history("hello", 0)],
            &session,
        )
        .await;
        assert_eq!(out[0].text(), "lore:bg");
        assert_eq!(out[0].source.kind, SourceKind::Worldbook);
    }

    #[tokio::test]
    async fn same_point_orders_ascending() {
        let session = Session::new("sys");
        let out = run(
            vec![
                entry("b", &[], ActivationMode::Always, 10),
                entry("a", &[], ActivationMode::Always, 5),
            ],
            vec![history("hello", 0)],
            &session,
        )
        .await;
        let texts: Vec<String> = out.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["lore:a", "lore:b", "hello"]);
    }

    #[tokio::test]
    async fn turn_mode_counts_completed_exchanges() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let u1 = create_child(&mut session, &root, NodeDraft::new(Role::User, "q1 dragon"))
            .unwrap()
            .id;
        let a1 = create_child(&mut session, &u1, NodeDraft::new(Role::Assistant, "a1"))
            .unwrap()
            .id;
        let u2 = create_child(&mut session, &a1, NodeDraft::new(Role::User, "q2 dragon"))
            .unwrap()
            .id;
        let a2 = create_child(&mut session, &u2, NodeDraft::new(Role::Assistant, "a2"))
            .unwrap()
            .id;
        session.active_leaf_id = a2;

        // Two completed exchanges; every-2 fires, every-3 does not.
        let out = run(
            vec![
                entry("two", &["dragon"], ActivationMode::Turn { every: 2 }, 0),
                entry("three", &["dragon"], ActivationMode::Turn { every: 3 }, 0),
            ],
            vec![history("dragon", 0)],
            &session,
        )
        .await;
        let texts: Vec<String> = out.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["lore:two", "dragon"]);
    }

    #[tokio::test]
    async fn disabled_without_source() {
        let session = Session::new("sys");
        let agent = AgentDefinition::named("a", "Agent", "m");
        let model = ModelProfile::text_only();
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
        let ctx = PipelineContext::new(input);
        assert!(!WorldbookStage::new(None).enabled(&ctx));
    }
}
