//! Reversible edit history for one session.
//!
//! Every committed tree mutation is recorded as either a full snapshot of the
//! node map or a list of reversible deltas. Replay restores any recorded
//! state: jumps find the nearest snapshot at or before the target and apply
//! deltas forward from there, with a fast path that walks delta entries
//! backward when the target is behind the cursor.
//!
//! The log is engine-side state — it is never persisted, and it is erased at
//! breakpoints (send, regenerate).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use trellis_core::{HistoryTuning, Node, NodeId, Session};

use crate::navigate::ensure_valid_active_leaf;
use crate::store::{NodeChange, RelationChange};

/// Action tag for the anchor snapshot written by `clear`.
pub const INITIAL_STATE: &str = "initial_state";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    /// No snapshot found at or before the jump target. The log has been
    /// reset; the session's nodes remain valid.
    #[error("history is corrupt: no anchor snapshot before index {index}")]
    Corrupt { index: usize },

    #[error("history index {index} out of bounds (len {len})")]
    OutOfBounds { index: usize, len: usize },
}

impl HistoryError {
    pub fn code(&self) -> &'static str {
        match self {
            HistoryError::Corrupt { .. } => "HISTORY_CORRUPT",
            HistoryError::OutOfBounds { .. } => "HISTORY_OUT_OF_BOUNDS",
        }
    }
}

pub type Result<T> = std::result::Result<T, HistoryError>;

/// One reversible recording of a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeDelta {
    Create {
        node: Node,
        relation: RelationChange,
    },
    Delete {
        node: Node,
        relation: RelationChange,
    },
    Update {
        node_id: NodeId,
        before: Node,
        after: Node,
    },
    Relation {
        changes: Vec<RelationChange>,
    },
}

impl From<NodeChange> for NodeDelta {
    fn from(change: NodeChange) -> Self {
        NodeDelta::Update {
            node_id: change.node_id,
            before: change.before,
            after: change.after,
        }
    }
}

impl NodeDelta {
    /// Collect every node id this delta touches (for snapshot promotion).
    fn collect_touched(&self, out: &mut HashSet<NodeId>) {
        match self {
            NodeDelta::Create { node, relation } | NodeDelta::Delete { node, relation } => {
                out.insert(node.id.clone());
                relation_touched(relation, out);
            }
            NodeDelta::Update { node_id, .. } => {
                out.insert(node_id.clone());
            }
            NodeDelta::Relation { changes } => {
                for change in changes {
                    relation_touched(change, out);
                }
            }
        }
    }
}

fn relation_touched(change: &RelationChange, out: &mut HashSet<NodeId>) {
    out.insert(change.node_id.clone());
    for parent_id in change.affected_parents.keys() {
        out.insert(parent_id.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryPayload {
    Snapshot { nodes: HashMap<NodeId, Node> },
    Deltas { deltas: Vec<NodeDelta> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// What the user did, e.g. "edit_content", "delete_subtree".
    pub action: String,
    pub timestamp: String,
    #[serde(default)]
    pub context: Option<String>,
    pub payload: HistoryPayload,
}

impl HistoryEntry {
    pub fn is_snapshot(&self) -> bool {
        matches!(self.payload, HistoryPayload::Snapshot { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyDirection {
    Forward,
    Backward,
}

/// The undo/redo log for one session. `entries[0]` is always a snapshot.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    entries: Vec<HistoryEntry>,
    index: usize,
    tuning: HistoryTuning,
}

impl HistoryLog {
    /// Seed the log with an anchor snapshot of the current nodes.
    pub fn new(tuning: HistoryTuning, nodes: &HashMap<NodeId, Node>) -> Self {
        Self {
            entries: vec![snapshot_entry(INITIAL_STATE, None, nodes)],
            index: 0,
            tuning,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn can_undo(&self) -> bool {
        self.index > 0
    }

    pub fn can_redo(&self) -> bool {
        self.index + 1 < self.entries.len()
    }

    /// Record a committed mutation.
    ///
    /// Undone future entries are dropped first (forking the timeline). The
    /// entry is promoted to a full snapshot when the deltas since the last
    /// snapshot have grown too numerous or touch too many distinct nodes.
    pub fn record(
        &mut self,
        action: &str,
        deltas: Vec<NodeDelta>,
        context: Option<String>,
        nodes: &HashMap<NodeId, Node>,
    ) {
        if self.index + 1 < self.entries.len() {
            self.entries.truncate(self.index + 1);
        }

        let (affected, deltas_since) = self.since_last_snapshot(&deltas);
        let force_snapshot = self.entries.is_empty()
            || affected > self.tuning.complexity_threshold
            || deltas_since >= self.tuning.snapshot_interval;

        let entry = if force_snapshot {
            debug!(action, affected, deltas_since, "history: writing snapshot");
            snapshot_entry(action, context, nodes)
        } else {
            HistoryEntry {
                action: action.to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                context,
                payload: HistoryPayload::Deltas { deltas },
            }
        };

        self.entries.push(entry);
        self.index = self.entries.len() - 1;
        self.trim();
    }

    /// Distinct nodes touched and delta-entry count since the nearest
    /// snapshot, including the candidate deltas.
    fn since_last_snapshot(&self, pending: &[NodeDelta]) -> (usize, usize) {
        let mut touched = HashSet::new();
        for delta in pending {
            delta.collect_touched(&mut touched);
        }
        let mut delta_entries = 1usize; // the pending entry itself
        for entry in self.entries.iter().rev() {
            match &entry.payload {
                HistoryPayload::Snapshot { .. } => break,
                HistoryPayload::Deltas { deltas } => {
                    delta_entries += 1;
                    for delta in deltas {
                        delta.collect_touched(&mut touched);
                    }
                }
            }
        }
        (touched.len(), delta_entries)
    }

    /// Drop the oldest entries past `max_entries`.
    ///
    /// Trimming removes whole replay segments: the leading snapshot together
    /// with the deltas that depend on it, up to the next snapshot (which
    /// becomes the new head). Dropping individual deltas would leave the
    /// remaining ones replaying against a state they were not recorded from.
    /// When no second snapshot exists, stop and accept a temporarily larger
    /// log rather than orphan the leading deltas.
    fn trim(&mut self) {
        while self.entries.len() > self.tuning.max_entries {
            let next_snapshot = self
                .entries
                .iter()
                .skip(1)
                .position(|entry| entry.is_snapshot())
                .map(|p| p + 1);
            let Some(next_snapshot) = next_snapshot else {
                break;
            };
            self.entries.drain(0..next_snapshot);
            self.index = self.index.saturating_sub(next_snapshot);
        }
    }

    /// Restore the session's nodes to the state recorded at `target`.
    pub fn jump_to(&mut self, session: &mut Session, target: usize) -> Result<()> {
        if target >= self.entries.len() {
            return Err(HistoryError::OutOfBounds {
                index: target,
                len: self.entries.len(),
            });
        }

        if target < self.index && self.backward_fast_path(session, target) {
            self.index = target;
            ensure_valid_active_leaf(session);
            return Ok(());
        }

        // Find the nearest snapshot at or before the target.
        let anchor = (0..=target)
            .rev()
            .find(|i| self.entries[*i].is_snapshot());
        let Some(anchor) = anchor else {
            warn!(target, "history: no anchor snapshot, clearing");
            self.clear(&session.nodes);
            return Err(HistoryError::Corrupt { index: target });
        };

        if let HistoryPayload::Snapshot { nodes } = &self.entries[anchor].payload {
            session.nodes = nodes.clone();
        }
        for i in anchor + 1..=target {
            match &self.entries[i].payload {
                HistoryPayload::Snapshot { nodes } => {
                    session.nodes = nodes.clone();
                }
                HistoryPayload::Deltas { deltas } => {
                    for delta in deltas {
                        apply_delta(&mut session.nodes, delta, ApplyDirection::Forward);
                    }
                }
            }
        }

        self.index = target;
        ensure_valid_active_leaf(session);
        Ok(())
    }

    /// Walk delta entries backward from the cursor to the target. Only valid
    /// when every entry in `(target, index]` is a delta entry; returns false
    /// to request the snapshot-replay path otherwise.
    fn backward_fast_path(&self, session: &mut Session, target: usize) -> bool {
        if self.entries[target + 1..=self.index]
            .iter()
            .any(|entry| entry.is_snapshot())
        {
            return false;
        }
        for entry in self.entries[target + 1..=self.index].iter().rev() {
            if let HistoryPayload::Deltas { deltas } = &entry.payload {
                for delta in deltas.iter().rev() {
                    apply_delta(&mut session.nodes, delta, ApplyDirection::Backward);
                }
            }
        }
        true
    }

    /// Step one entry back. Returns false when already at the anchor.
    pub fn undo(&mut self, session: &mut Session) -> Result<bool> {
        if !self.can_undo() {
            return Ok(false);
        }
        self.jump_to(session, self.index - 1)?;
        Ok(true)
    }

    /// Step one entry forward. Returns false when already at the tail.
    pub fn redo(&mut self, session: &mut Session) -> Result<bool> {
        if !self.can_redo() {
            return Ok(false);
        }
        self.jump_to(session, self.index + 1)?;
        Ok(true)
    }

    /// Erase the log, leaving a single anchor snapshot of the given nodes.
    /// Invoked at history breakpoints (send, regenerate).
    pub fn clear(&mut self, nodes: &HashMap<NodeId, Node>) {
        self.entries = vec![snapshot_entry(INITIAL_STATE, None, nodes)];
        self.index = 0;
    }
}

fn snapshot_entry(
    action: &str,
    context: Option<String>,
    nodes: &HashMap<NodeId, Node>,
) -> HistoryEntry {
    HistoryEntry {
        action: action.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        context,
        payload: HistoryPayload::Snapshot {
            nodes: nodes.clone(),
        },
    }
}

fn apply_delta(nodes: &mut HashMap<NodeId, Node>, delta: &NodeDelta, direction: ApplyDirection) {
    match (delta, direction) {
        (NodeDelta::Create { node, relation }, ApplyDirection::Forward)
        | (NodeDelta::Delete { node, relation }, ApplyDirection::Backward) => {
            nodes.insert(node.id.clone(), node.clone());
            apply_relation(nodes, relation, direction);
        }
        (NodeDelta::Create { node, relation }, ApplyDirection::Backward)
        | (NodeDelta::Delete { node, relation }, ApplyDirection::Forward) => {
            nodes.remove(&node.id);
            apply_relation(nodes, relation, direction);
        }
        (NodeDelta::Update { node_id, after, .. }, ApplyDirection::Forward) => {
            nodes.insert(node_id.clone(), after.clone());
        }
        (NodeDelta::Update { node_id, before, .. }, ApplyDirection::Backward) => {
            nodes.insert(node_id.clone(), before.clone());
        }
        (NodeDelta::Relation { changes }, ApplyDirection::Forward) => {
            for change in changes {
                apply_relation(nodes, change, direction);
            }
        }
        (NodeDelta::Relation { changes }, ApplyDirection::Backward) => {
            for change in changes.iter().rev() {
                apply_relation(nodes, change, direction);
            }
        }
    }
}

/// Apply one relation change. Missing nodes are skipped silently — they may
/// be restored by a later delta in the same entry.
fn apply_relation(
    nodes: &mut HashMap<NodeId, Node>,
    change: &RelationChange,
    direction: ApplyDirection,
) {
    let parent_value = match direction {
        ApplyDirection::Forward => change.new_parent_id.clone(),
        ApplyDirection::Backward => change.old_parent_id.clone(),
    };
    if let Some(node) = nodes.get_mut(&change.node_id) {
        node.parent_id = parent_value;
    }
    for (parent_id, lists) in &change.affected_parents {
        if let Some(parent) = nodes.get_mut(parent_id) {
            parent.children_ids = match direction {
                ApplyDirection::Forward => lists.new_children.clone(),
                ApplyDirection::Backward => lists.old_children.clone(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{create_child, delete_subtree, set_enabled, update_node};
    use trellis_core::{NodeDraft, NodeUpdate, Role};

    fn tuning() -> HistoryTuning {
        HistoryTuning::default()
    }

    fn record_create(log: &mut HistoryLog, session: &Session, action: &str, created: crate::store::CreatedChild) {
        log.record(
            action,
            vec![NodeDelta::Create {
                node: created.node,
                relation: created.relation,
            }],
            None,
            &session.nodes,
        );
    }

    #[test]
    fn log_starts_with_anchor_snapshot() {
        let session = Session::new("sys");
        let log = HistoryLog::new(tuning(), &session.nodes);
        assert_eq!(log.len(), 1);
        assert!(log.entries()[0].is_snapshot());
        assert_eq!(log.entries()[0].action, INITIAL_STATE);
    }

    #[test]
    fn undo_redo_round_trip_create() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let mut log = HistoryLog::new(tuning(), &session.nodes);

        let created = create_child(&mut session, &root, NodeDraft::new(Role::User, "hi")).unwrap();
        let id = created.id.clone();
        record_create(&mut log, &session, "send", created);
        let after = session.nodes.clone();

        assert!(log.undo(&mut session).unwrap());
        assert!(!session.contains(&id));
        assert!(session.validate().is_ok());

        assert!(log.redo(&mut session).unwrap());
        assert_eq!(session.nodes, after);
    }

    #[test]
    fn undo_redo_round_trip_update() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let mut log = HistoryLog::new(tuning(), &session.nodes);

        let created = create_child(&mut session, &root, NodeDraft::new(Role::User, "hi")).unwrap();
        let id = created.id.clone();
        record_create(&mut log, &session, "send", created);

        let change = update_node(&mut session, &id, NodeUpdate::content("edited")).unwrap();
        log.record("edit_content", vec![change.into()], None, &session.nodes);

        log.undo(&mut session).unwrap();
        assert_eq!(session.node(&id).unwrap().content, "hi");
        log.redo(&mut session).unwrap();
        assert_eq!(session.node(&id).unwrap().content, "edited");
    }

    #[test]
    fn undo_restores_deleted_subtree() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let mut log = HistoryLog::new(tuning(), &session.nodes);

        let a = create_child(&mut session, &root, NodeDraft::new(Role::User, "a")).unwrap();
        let a_id = a.id.clone();
        record_create(&mut log, &session, "send", a);
        let b = create_child(&mut session, &a_id, NodeDraft::new(Role::Assistant, "b")).unwrap();
        let b_id = b.id.clone();
        record_create(&mut log, &session, "send", b);
        let full = session.nodes.clone();

        let deleted = delete_subtree(&mut session, &a_id).unwrap();
        let relation = deleted.relation.clone();
        let deltas: Vec<NodeDelta> = deleted
            .nodes
            .into_iter()
            .enumerate()
            .map(|(i, node)| {
                let relation = if i == 0 {
                    relation.clone()
                } else {
                    RelationChange::identity(&node)
                };
                NodeDelta::Delete { node, relation }
            })
            .collect();
        log.record("delete_subtree", deltas, None, &session.nodes);

        assert!(!session.contains(&a_id));
        log.undo(&mut session).unwrap();
        assert_eq!(session.nodes, full);
        assert!(session.contains(&b_id));
        assert!(session.validate().is_ok());
    }

    #[test]
    fn new_record_truncates_future() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let mut log = HistoryLog::new(tuning(), &session.nodes);

        let a = create_child(&mut session, &root, NodeDraft::new(Role::User, "a")).unwrap();
        record_create(&mut log, &session, "send", a);
        let b = create_child(&mut session, &root, NodeDraft::new(Role::User, "b")).unwrap();
        let b_id = b.id.clone();
        record_create(&mut log, &session, "send", b);

        log.undo(&mut session).unwrap();
        assert!(log.can_redo());

        // A fresh edit forks the timeline; redo becomes a no-op.
        let change = set_enabled(&mut session, &root, false).unwrap();
        log.record("toggle_enabled", vec![change.into()], None, &session.nodes);
        assert!(!log.can_redo());
        assert!(!log.redo(&mut session).unwrap());
        assert!(!session.contains(&b_id));
    }

    #[test]
    fn snapshot_forced_after_interval() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let tuning = HistoryTuning {
            max_entries: 200,
            snapshot_interval: 5,
            complexity_threshold: 1000,
        };
        let mut log = HistoryLog::new(tuning, &session.nodes);

        for i in 0..12 {
            let created =
                create_child(&mut session, &root, NodeDraft::new(Role::User, format!("m{i}")))
                    .unwrap();
            record_create(&mut log, &session, "send", created);
        }
        let snapshots = log.entries().iter().filter(|e| e.is_snapshot()).count();
        assert!(snapshots >= 3, "expected periodic snapshots, got {snapshots}");
    }

    #[test]
    fn trim_keeps_leading_snapshot() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let tuning = HistoryTuning {
            max_entries: 8,
            snapshot_interval: 3,
            complexity_threshold: 1000,
        };
        let mut log = HistoryLog::new(tuning, &session.nodes);

        for i in 0..30 {
            let created =
                create_child(&mut session, &root, NodeDraft::new(Role::User, format!("m{i}")))
                    .unwrap();
            record_create(&mut log, &session, "send", created);
        }
        assert!(log.len() <= tuning.max_entries, "len {}", log.len());
        assert!(log.entries()[0].is_snapshot());
        // The cursor still points at the tail.
        assert_eq!(log.index(), log.len() - 1);

        // The whole remaining range replays cleanly.
        log.jump_to(&mut session, 0).unwrap();
        log.jump_to(&mut session, log.len() - 1).unwrap();
        assert!(session.validate().is_ok());
    }

    #[test]
    fn jump_to_arbitrary_index_round_trips() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let mut log = HistoryLog::new(tuning(), &session.nodes);

        let mut states = vec![session.nodes.clone()];
        for i in 0..6 {
            let created =
                create_child(&mut session, &root, NodeDraft::new(Role::User, format!("m{i}")))
                    .unwrap();
            record_create(&mut log, &session, "send", created);
            states.push(session.nodes.clone());
        }

        for (i, expected) in states.iter().enumerate() {
            log.jump_to(&mut session, i).unwrap();
            assert_eq!(&session.nodes, expected, "state {i} mismatch");
        }
        // And back to the tail.
        log.jump_to(&mut session, states.len() - 1).unwrap();
        assert_eq!(&session.nodes, states.last().unwrap());
    }

    #[test]
    fn jump_repairs_active_leaf() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let mut log = HistoryLog::new(tuning(), &session.nodes);

        let created = create_child(&mut session, &root, NodeDraft::new(Role::User, "a")).unwrap();
        let id = created.id.clone();
        session.active_leaf_id = id.clone();
        record_create(&mut log, &session, "send", created);

        // Undo removes the node the active leaf points to.
        log.undo(&mut session).unwrap();
        assert!(session.contains(&session.active_leaf_id));
        assert_eq!(session.active_leaf_id, root);
        let _ = id;
    }

    #[test]
    fn clear_leaves_single_anchor() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let mut log = HistoryLog::new(tuning(), &session.nodes);
        let created = create_child(&mut session, &root, NodeDraft::new(Role::User, "a")).unwrap();
        record_create(&mut log, &session, "send", created);

        log.clear(&session.nodes);
        assert_eq!(log.len(), 1);
        assert_eq!(log.index(), 0);
        assert!(!log.can_undo());
        assert!(!log.can_redo());
    }

    #[test]
    fn out_of_bounds_jump_is_error() {
        let mut session = Session::new("sys");
        let mut log = HistoryLog::new(tuning(), &session.nodes);
        let err = log.jump_to(&mut session, 5).unwrap_err();
        assert_eq!(err.code(), "HISTORY_OUT_OF_BOUNDS");
    }
}
