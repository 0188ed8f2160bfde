//! Stage 3: merge agent preset messages and the user profile into the
//! message list.
//!
//! Anchors are in-band sentinel nodes inside the preset list: the
//! chat-history anchor decides where the session history block lands, the
//! user-profile anchor decides where the profile text lands. Explicit
//! strategies (depth, advanced depth, anchor-relative) are resolved against
//! the assembled list, with ties broken by `order` then original preset
//! index.

use async_trait::async_trait;

use trellis_core::{
    AnchorPosition, AnchorTarget, InjectionStrategy, NodeKind, PresetMessage, Role, UserProfile,
};

use crate::context::{DraftMessage, MessagePart, MessageSource, PipelineContext, SourceKind};
use crate::error::StageResult;
use crate::stage::PipelineStage;

pub struct InjectionAssembler;

const STAGE: &str = "injection";

/// Working representation during assembly: real messages plus markers for
/// the history block boundaries. Markers are stripped at the end.
enum Slot {
    Msg(DraftMessage),
    HistoryStart,
    HistoryEnd,
}

#[async_trait]
impl PipelineStage for InjectionAssembler {
    fn name(&self) -> &'static str {
        STAGE
    }

    async fn run(&self, ctx: &mut PipelineContext<'_>) -> StageResult {
        let agent = ctx.input.agent;
        let mut history = Some(std::mem::take(&mut ctx.messages));
        let mut profile_pending = build_profile_message(ctx.input.user_profile);

        let mut slots: Vec<Slot> = Vec::new();
        let mut deferred: Vec<(usize, &PresetMessage)> = Vec::new();

        // First pass: default-strategy presets and anchors, in preset order.
        for (index, preset) in agent.preset_messages.iter().enumerate() {
            match preset.node.kind {
                NodeKind::ChatHistoryAnchor => {
                    if let Some(history) = history.take() {
                        splice_history(&mut slots, history);
                    }
                }
                NodeKind::UserProfileAnchor => {
                    if let Some(profile) = profile_pending.take() {
                        slots.push(Slot::Msg(profile));
                    }
                }
                NodeKind::Message => match preset.strategy {
                    InjectionStrategy::Default => {
                        slots.push(Slot::Msg(preset_draft(
                            preset,
                            index,
                            SourceKind::AgentPreset,
                            0,
                        )));
                    }
                    _ => deferred.push((index, preset)),
                },
            }
        }

        // No chat-history anchor: all default presets prepend, history goes
        // to the tail (anchor-at-end equivalence).
        if let Some(history) = history.take() {
            splice_history(&mut slots, history);
        }

        // Unanchored profile lands immediately before the history block.
        if let Some(profile) = profile_pending.take() {
            let at = slots
                .iter()
                .position(|slot| matches!(slot, Slot::HistoryStart))
                .unwrap_or(0);
            slots.insert(at, Slot::Msg(profile));
        }

        // Second pass: depth-based strategies against the assembled list.
        let message_count = count_messages(&slots);
        let mut depth_items: Vec<(usize, i32, usize, DraftMessage)> = Vec::new();
        for (index, preset) in &deferred {
            match &preset.strategy {
                InjectionStrategy::Depth { depth } => {
                    let point = message_count.saturating_sub(*depth as usize);
                    depth_items.push((
                        point,
                        0,
                        *index,
                        preset_draft(preset, *index, SourceKind::DepthInjection, 0),
                    ));
                }
                InjectionStrategy::AdvancedDepth { spec } => {
                    match parse_advanced_depth(spec, message_count) {
                        Some(depths) => {
                            for depth in depths {
                                let point = message_count.saturating_sub(depth as usize);
                                depth_items.push((
                                    point,
                                    0,
                                    *index,
                                    preset_draft(preset, *index, SourceKind::DepthInjection, 0),
                                ));
                            }
                        }
                        None => {
                            ctx.trace.push(
                                STAGE,
                                format!("unparseable depth spec '{spec}', preset {index} skipped"),
                            );
                        }
                    }
                }
                _ => {}
            }
        }
        insert_grouped(&mut slots, depth_items, true);

        // Third pass: anchor-relative strategies, resolved after depth
        // insertion so their reference points are final.
        let mut anchor_items: Vec<(usize, i32, usize, DraftMessage)> = Vec::new();
        for (index, preset) in &deferred {
            if let InjectionStrategy::Anchor {
                target,
                position,
                order,
            } = &preset.strategy
            {
                match resolve_anchor(&slots, *target, *position) {
                    Some(point) => {
                        anchor_items.push((
                            point,
                            *order,
                            *index,
                            preset_draft(preset, *index, SourceKind::AnchorInjection, *order),
                        ));
                    }
                    None => {
                        ctx.trace.push(
                            STAGE,
                            format!("anchor target missing for preset {index}, inserted at head"),
                        );
                        anchor_items.push((
                            0,
                            *order,
                            *index,
                            preset_draft(preset, *index, SourceKind::AnchorInjection, *order),
                        ));
                    }
                }
            }
        }
        insert_grouped(&mut slots, anchor_items, false);

        ctx.messages = slots
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Msg(msg) => Some(msg),
                _ => None,
            })
            .collect();

        ctx.trace.push(
            STAGE,
            format!(
                "{} presets merged, {} messages total",
                agent.preset_messages.len(),
                ctx.messages.len()
            ),
        );
        Ok(())
    }
}

fn splice_history(slots: &mut Vec<Slot>, history: Vec<DraftMessage>) {
    slots.push(Slot::HistoryStart);
    slots.extend(history.into_iter().map(Slot::Msg));
    slots.push(Slot::HistoryEnd);
}

fn count_messages(slots: &[Slot]) -> usize {
    slots.iter().filter(|s| matches!(s, Slot::Msg(_))).count()
}

fn preset_draft(
    preset: &PresetMessage,
    index: usize,
    kind: SourceKind,
    order: i32,
) -> DraftMessage {
    let node = &preset.node;
    let mut parts = vec![MessagePart::text(node.content.clone())];
    for asset in &node.attachments {
        parts.push(MessagePart::Attachment {
            asset: asset.clone(),
        });
    }
    DraftMessage {
        role: node.role,
        parts,
        source: MessageSource::new(kind, Some(node.id.to_string()), index),
        order,
        truncated: false,
        bound_rules: None,
    }
}

fn build_profile_message(profile: Option<&UserProfile>) -> Option<DraftMessage> {
    let profile = profile?;
    if profile.content.is_empty() {
        return None;
    }
    Some(DraftMessage::text_message(
        Role::System,
        profile.content.clone(),
        MessageSource::new(SourceKind::UserProfile, Some(profile.id.clone()), 0),
    ))
}

/// Parse an advanced depth spec.
///
/// `"10~5"` inserts at depth 10 and again at depth 5; `"cycle:4"` inserts at
/// every 4th message counted from the tail.
fn parse_advanced_depth(spec: &str, message_count: usize) -> Option<Vec<u32>> {
    if let Some(rest) = spec.strip_prefix("cycle:") {
        let every: u32 = rest.trim().parse().ok()?;
        if every == 0 {
            return None;
        }
        let mut depths = Vec::new();
        let mut depth = every;
        while (depth as usize) <= message_count {
            depths.push(depth);
            depth += every;
        }
        return Some(depths);
    }
    let depths: Result<Vec<u32>, _> = spec.split('~').map(|part| part.trim().parse()).collect();
    depths.ok().filter(|v: &Vec<u32>| !v.is_empty())
}

/// Map "insert after the `position`-th message" to a slot index. Position 0
/// is the very front; `count_messages(slots)` is the very end.
fn slot_index_for_position(slots: &[Slot], position: usize) -> usize {
    if position == 0 {
        return 0;
    }
    let mut seen = 0usize;
    for (i, slot) in slots.iter().enumerate() {
        if matches!(slot, Slot::Msg(_)) {
            seen += 1;
            if seen == position {
                return i + 1;
            }
        }
    }
    slots.len()
}

fn resolve_anchor(slots: &[Slot], target: AnchorTarget, position: AnchorPosition) -> Option<usize> {
    match target {
        AnchorTarget::ChatHistory => match position {
            AnchorPosition::Before => slots
                .iter()
                .position(|slot| matches!(slot, Slot::HistoryStart)),
            AnchorPosition::After => slots
                .iter()
                .position(|slot| matches!(slot, Slot::HistoryEnd))
                .map(|i| i + 1),
        },
        AnchorTarget::UserProfile => {
            let at = slots.iter().position(|slot| {
                matches!(slot, Slot::Msg(msg) if msg.source.kind == SourceKind::UserProfile)
            })?;
            Some(match position {
                AnchorPosition::Before => at,
                AnchorPosition::After => at + 1,
            })
        }
    }
}

/// Insert items grouped by insertion point. Within a group the order is
/// (`order`, preset index) ascending; groups are applied back-to-front so
/// earlier points are unaffected by later splices.
///
/// `points_are_positions` selects between message-position points (depth
/// strategies) and raw slot indices (anchor strategies).
fn insert_grouped(
    slots: &mut Vec<Slot>,
    mut items: Vec<(usize, i32, usize, DraftMessage)>,
    points_are_positions: bool,
) {
    if items.is_empty() {
        return;
    }
    items.sort_by_key(|(point, order, index, _)| (*point, *order, *index));
    while let Some(&(point, ..)) = items.last() {
        let start = items
            .iter()
            .position(|(p, ..)| *p == point)
            .unwrap_or(items.len() - 1);
        let group: Vec<(usize, i32, usize, DraftMessage)> = items.split_off(start);
        let at = if points_are_positions {
            slot_index_for_position(slots, point)
        } else {
            point.min(slots.len())
        };
        slots.splice(at..at, group.into_iter().map(|(_, _, _, msg)| Slot::Msg(msg)));
    }
}
