//! Branch navigation: which linear path is active, and how the active-leaf
//! pointer moves.
//!
//! When a subtree has several branches, returning to it restores the
//! last-viewed path via `last_selected_child_id` rather than an arbitrary
//! "leftmost child", so user exploration is respected.

use trellis_core::{Node, NodeId, Session};

use crate::error::{Result, TreeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Prev,
    Next,
}

/// The root-to-leaf path selected by `active_leaf_id`, root first.
pub fn active_path(session: &Session) -> Vec<&Node> {
    let mut path = Vec::new();
    let mut cursor = Some(session.active_leaf_id.clone());
    let mut steps = 0usize;
    while let Some(id) = cursor {
        let Some(node) = session.node(&id) else { break };
        path.push(node);
        steps += 1;
        if steps > session.nodes.len() {
            break;
        }
        cursor = node.parent_id.clone();
    }
    path.reverse();
    path
}

pub fn active_path_ids(session: &Session) -> Vec<NodeId> {
    active_path(session).iter().map(|n| n.id.clone()).collect()
}

/// All children of `node_id`'s parent, in chronological order. The root has
/// no siblings and returns just itself.
pub fn siblings<'a>(session: &'a Session, node_id: &NodeId) -> Result<Vec<&'a Node>> {
    let node = session.node(node_id).ok_or_else(|| TreeError::NodeNotFound {
        id: node_id.clone(),
    })?;
    match &node.parent_id {
        None => Ok(vec![node]),
        Some(parent_id) => {
            let parent = session
                .node(parent_id)
                .ok_or_else(|| TreeError::NodeNotFound {
                    id: parent_id.clone(),
                })?;
            Ok(parent
                .children_ids
                .iter()
                .filter_map(|id| session.node(id))
                .collect())
        }
    }
}

/// Make `node_id`'s branch the active one.
///
/// Ancestors remember the path (branch memory), then the walk continues
/// downward from `node_id` — preferring each node's remembered child, falling
/// back to the last child — until a leaf becomes the new active leaf.
pub fn switch_to(session: &mut Session, node_id: &NodeId) -> Result<NodeId> {
    if !session.contains(node_id) {
        return Err(TreeError::NodeNotFound {
            id: node_id.clone(),
        });
    }

    // Stamp branch memory on every ancestor along the way up.
    let mut child = node_id.clone();
    loop {
        let Some(parent_id) = session.node(&child).and_then(|n| n.parent_id.clone()) else {
            break;
        };
        if let Some(parent) = session.node_mut(&parent_id) {
            parent.last_selected_child_id = Some(child.clone());
        }
        child = parent_id;
    }

    let leaf = descend(session, node_id);
    session.active_leaf_id = leaf.clone();
    Ok(leaf)
}

/// Walk down from `start` following branch memory, stopping at a leaf.
fn descend(session: &Session, start: &NodeId) -> NodeId {
    let mut cursor = start.clone();
    let mut steps = 0usize;
    loop {
        let Some(node) = session.node(&cursor) else {
            return cursor;
        };
        if node.children_ids.is_empty() {
            return cursor;
        }
        steps += 1;
        if steps > session.nodes.len() {
            return cursor;
        }
        let preferred = node
            .last_selected_child_id
            .as_ref()
            .filter(|id| node.children_ids.contains(id))
            .cloned();
        cursor = match preferred {
            Some(id) => id,
            // children_ids is non-empty here.
            None => node.children_ids[node.children_ids.len() - 1].clone(),
        };
    }
}

/// Move to the previous/next sibling of `node_id`, saturating at the ends
/// (no wrap), then switch the active branch to it.
pub fn switch_sibling(session: &mut Session, node_id: &NodeId, direction: Direction) -> Result<NodeId> {
    let node = session.node(node_id).ok_or_else(|| TreeError::NodeNotFound {
        id: node_id.clone(),
    })?;
    let parent_id = node
        .parent_id
        .clone()
        .ok_or_else(|| TreeError::InvalidMutation("root has no siblings".to_string()))?;
    let parent = session
        .node(&parent_id)
        .ok_or_else(|| TreeError::NodeNotFound {
            id: parent_id.clone(),
        })?;

    let index = parent
        .children_ids
        .iter()
        .position(|id| id == node_id)
        .ok_or_else(|| {
            TreeError::InvalidMutation(format!("node {} missing from parent child list", node_id))
        })?;
    let target_index = match direction {
        Direction::Prev => index.saturating_sub(1),
        Direction::Next => (index + 1).min(parent.children_ids.len() - 1),
    };
    let target = parent.children_ids[target_index].clone();
    switch_to(session, &target)
}

/// Repair `active_leaf_id` if it no longer names an existing node: fall back
/// to the deepest descendant of the root reachable through branch memory.
pub fn ensure_valid_active_leaf(session: &mut Session) {
    if session.contains(&session.active_leaf_id) {
        return;
    }
    let root = session.root_node_id.clone();
    session.active_leaf_id = descend(session, &root);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{create_child, delete_subtree};
    use trellis_core::{NodeDraft, Role};

    fn add(session: &mut Session, parent: &NodeId, text: &str) -> NodeId {
        create_child(session, parent, NodeDraft::new(Role::User, text))
            .unwrap()
            .id
    }

    #[test]
    fn active_path_runs_root_to_leaf() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let a = add(&mut session, &root, "a");
        let b = add(&mut session, &a, "b");
        session.active_leaf_id = b.clone();
        let path = active_path_ids(&session);
        assert_eq!(path, vec![root, a, b]);
    }

    #[test]
    fn switch_to_lands_on_leaf_through_memory() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let a = add(&mut session, &root, "a");
        let b1 = add(&mut session, &a, "b1");
        let b2 = add(&mut session, &a, "b2");
        let c1 = add(&mut session, &b1, "c1");

        // View the b1 branch, then jump back to the subtree root: memory
        // should restore the b1 path, not the last child b2.
        switch_to(&mut session, &c1).unwrap();
        assert_eq!(session.active_leaf_id, c1);
        switch_to(&mut session, &a).unwrap();
        assert_eq!(session.active_leaf_id, c1);

        // Without memory the walk prefers the last child.
        session.node_mut(&a).unwrap().last_selected_child_id = None;
        switch_to(&mut session, &a).unwrap();
        assert_eq!(session.active_leaf_id, b2);
        let _ = b2;
    }

    #[test]
    fn switch_to_path_contains_target() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let a = add(&mut session, &root, "a");
        let b = add(&mut session, &a, "b");
        switch_to(&mut session, &a).unwrap();
        assert!(active_path_ids(&session).contains(&a));
        let _ = b;
    }

    #[test]
    fn switch_sibling_saturates() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let a = add(&mut session, &root, "a");
        let b = add(&mut session, &root, "b");
        let c = add(&mut session, &root, "c");

        switch_sibling(&mut session, &a, Direction::Prev).unwrap();
        assert_eq!(session.active_leaf_id, a);
        switch_sibling(&mut session, &a, Direction::Next).unwrap();
        assert_eq!(session.active_leaf_id, b);
        switch_sibling(&mut session, &c, Direction::Next).unwrap();
        assert_eq!(session.active_leaf_id, c);
    }

    #[test]
    fn switch_sibling_round_trip_for_middle_child() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let _a = add(&mut session, &root, "a");
        let b = add(&mut session, &root, "b");
        let _c = add(&mut session, &root, "c");

        let prev = switch_sibling(&mut session, &b, Direction::Prev).unwrap();
        let back = switch_sibling(&mut session, &prev, Direction::Next).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn switch_sibling_on_root_fails() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        assert!(switch_sibling(&mut session, &root, Direction::Next).is_err());
    }

    #[test]
    fn ensure_valid_active_leaf_repairs_after_delete() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let a = add(&mut session, &root, "a");
        let b = add(&mut session, &a, "b");
        session.active_leaf_id = b.clone();

        delete_subtree(&mut session, &a).unwrap();
        assert!(!session.contains(&session.active_leaf_id));
        ensure_valid_active_leaf(&mut session);
        assert_eq!(session.active_leaf_id, root);
    }
}
