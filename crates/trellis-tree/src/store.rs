//! Atomic, invariant-preserving mutations on a session's node tree.
//!
//! Every operation validates its inputs before touching the session, so a
//! returned error means nothing changed. Successful structural operations
//! return the [`RelationChange`]s they produced; the history log records
//! these to make the mutation reversible.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use trellis_core::{Node, NodeDraft, NodeId, NodeUpdate, Session};

use crate::error::{Result, TreeError};

/// Before/after view of one parent's child list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildListChange {
    pub old_children: Vec<NodeId>,
    pub new_children: Vec<NodeId>,
}

/// Precise record of a parent/child structure change, sufficient to restore
/// the tree under any move, graft, delete, or create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationChange {
    pub node_id: NodeId,
    pub old_parent_id: Option<NodeId>,
    pub new_parent_id: Option<NodeId>,
    /// Every parent whose child list changed, keyed by parent id.
    pub affected_parents: HashMap<NodeId, ChildListChange>,
}

impl RelationChange {
    /// A relation that re-asserts the node's existing edges. Used for
    /// descendants inside a deleted subtree: their parent/child links live on
    /// the node records themselves, only the top edge actually changed.
    pub fn identity(node: &Node) -> Self {
        Self {
            node_id: node.id.clone(),
            old_parent_id: node.parent_id.clone(),
            new_parent_id: node.parent_id.clone(),
            affected_parents: HashMap::new(),
        }
    }
}

/// Result of [`create_child`].
#[derive(Debug, Clone)]
pub struct CreatedChild {
    pub id: NodeId,
    pub node: Node,
    pub relation: RelationChange,
}

/// Before/after node states from a field-level mutation.
#[derive(Debug, Clone)]
pub struct NodeChange {
    pub node_id: NodeId,
    pub before: Node,
    pub after: Node,
}

/// Result of [`delete_subtree`]: the removed nodes in pre-order plus the
/// relation change for the top edge.
#[derive(Debug, Clone)]
pub struct DeletedSubtree {
    pub nodes: Vec<Node>,
    pub relation: RelationChange,
}

/// Append a new node as the rightmost child of `parent_id`.
pub fn create_child(session: &mut Session, parent_id: &NodeId, draft: NodeDraft) -> Result<CreatedChild> {
    let role = draft
        .role
        .ok_or_else(|| TreeError::InvalidMutation("node draft missing role".to_string()))?;
    let parent = session
        .node(parent_id)
        .ok_or_else(|| TreeError::NodeNotFound {
            id: parent_id.clone(),
        })?;
    let old_children = parent.children_ids.clone();

    let mut node = Node::new(role, draft.content);
    node.parent_id = Some(parent_id.clone());
    node.attachments = draft.attachments;
    node.status = draft.status;
    node.enabled = draft.enabled;
    node.metadata = draft.metadata;
    let id = node.id.clone();

    let mut new_children = old_children.clone();
    new_children.push(id.clone());

    let relation = RelationChange {
        node_id: id.clone(),
        old_parent_id: None,
        new_parent_id: Some(parent_id.clone()),
        affected_parents: HashMap::from([(
            parent_id.clone(),
            ChildListChange {
                old_children,
                new_children: new_children.clone(),
            },
        )]),
    };

    session.nodes.insert(id.clone(), node.clone());
    if let Some(parent) = session.node_mut(parent_id) {
        parent.children_ids = new_children;
    }
    session.touch();

    Ok(CreatedChild { id, node, relation })
}

/// Replace the mutable fields of a node atomically. Role, parent, and id are
/// not reachable through [`NodeUpdate`].
pub fn update_node(session: &mut Session, node_id: &NodeId, update: NodeUpdate) -> Result<NodeChange> {
    let node = session.node(node_id).ok_or_else(|| TreeError::NodeNotFound {
        id: node_id.clone(),
    })?;
    let before = node.clone();

    let mut after = before.clone();
    if let Some(content) = update.content {
        after.content = content;
    }
    if let Some(attachments) = update.attachments {
        after.attachments = attachments;
    }
    if let Some(status) = update.status {
        after.status = status;
    }
    if let Some(enabled) = update.enabled {
        after.enabled = enabled;
    }
    if let Some(metadata) = update.metadata {
        after.metadata = metadata;
    }

    session.nodes.insert(node_id.clone(), after.clone());
    session.touch();

    Ok(NodeChange {
        node_id: node_id.clone(),
        before,
        after,
    })
}

/// Remove a node from its parent's child list, leaving it parentless.
///
/// A detached node is an intermediate state: callers pair this with
/// [`attach`] inside one committed operation (move/graft).
pub fn detach(session: &mut Session, node_id: &NodeId) -> Result<RelationChange> {
    if *node_id == session.root_node_id {
        return Err(TreeError::RootImmutable);
    }
    let node = session.node(node_id).ok_or_else(|| TreeError::NodeNotFound {
        id: node_id.clone(),
    })?;
    let parent_id = node
        .parent_id
        .clone()
        .ok_or_else(|| TreeError::InvalidMutation(format!("node {} already detached", node_id)))?;
    let parent = session
        .node(&parent_id)
        .ok_or_else(|| TreeError::NodeNotFound {
            id: parent_id.clone(),
        })?;

    let old_children = parent.children_ids.clone();
    let new_children: Vec<NodeId> = old_children
        .iter()
        .filter(|child| **child != *node_id)
        .cloned()
        .collect();

    let relation = RelationChange {
        node_id: node_id.clone(),
        old_parent_id: Some(parent_id.clone()),
        new_parent_id: None,
        affected_parents: HashMap::from([(
            parent_id.clone(),
            ChildListChange {
                old_children,
                new_children: new_children.clone(),
            },
        )]),
    };

    if let Some(parent) = session.node_mut(&parent_id) {
        parent.children_ids = new_children;
        if parent.last_selected_child_id.as_ref() == Some(node_id) {
            parent.last_selected_child_id = None;
        }
    }
    if let Some(node) = session.node_mut(node_id) {
        node.parent_id = None;
    }
    session.touch();

    Ok(relation)
}

/// Insert a detached node into `new_parent_id`'s children at `index`
/// (clamped; default end). Rejects anything that would create a cycle.
pub fn attach(
    session: &mut Session,
    node_id: &NodeId,
    new_parent_id: &NodeId,
    index: Option<usize>,
) -> Result<RelationChange> {
    let node = session.node(node_id).ok_or_else(|| TreeError::NodeNotFound {
        id: node_id.clone(),
    })?;
    if node.parent_id.is_some() {
        return Err(TreeError::InvalidMutation(format!(
            "node {} is not detached",
            node_id
        )));
    }
    let parent = session
        .node(new_parent_id)
        .ok_or_else(|| TreeError::NodeNotFound {
            id: new_parent_id.clone(),
        })?;

    // Cycle check: the parent chain from the new parent must not pass through
    // the node being attached.
    let mut cursor = Some(new_parent_id.clone());
    let mut steps = 0usize;
    while let Some(current) = cursor {
        if current == *node_id {
            return Err(TreeError::CycleWouldBeCreated {
                node: node_id.clone(),
                parent: new_parent_id.clone(),
            });
        }
        steps += 1;
        if steps > session.nodes.len() {
            return Err(TreeError::InvalidMutation(
                "parent chain does not terminate".to_string(),
            ));
        }
        cursor = session.node(&current).and_then(|n| n.parent_id.clone());
    }

    let old_children = parent.children_ids.clone();
    let mut new_children = old_children.clone();
    let at = index.unwrap_or(new_children.len()).min(new_children.len());
    new_children.insert(at, node_id.clone());

    let relation = RelationChange {
        node_id: node_id.clone(),
        old_parent_id: None,
        new_parent_id: Some(new_parent_id.clone()),
        affected_parents: HashMap::from([(
            new_parent_id.clone(),
            ChildListChange {
                old_children,
                new_children: new_children.clone(),
            },
        )]),
    };

    if let Some(parent) = session.node_mut(new_parent_id) {
        parent.children_ids = new_children;
    }
    if let Some(node) = session.node_mut(node_id) {
        node.parent_id = Some(new_parent_id.clone());
    }
    session.touch();

    Ok(relation)
}

/// Remove a node and all its descendants from the session.
///
/// Returns the deleted nodes in pre-order (the node itself first, then each
/// subtree in child order) so the history log can restore them exactly.
pub fn delete_subtree(session: &mut Session, node_id: &NodeId) -> Result<DeletedSubtree> {
    if *node_id == session.root_node_id {
        return Err(TreeError::RootImmutable);
    }
    let node = session.node(node_id).ok_or_else(|| TreeError::NodeNotFound {
        id: node_id.clone(),
    })?;
    let parent_id = node
        .parent_id
        .clone()
        .ok_or_else(|| TreeError::InvalidMutation(format!("node {} has no parent", node_id)))?;

    // Pre-order walk over ids; children in stored (chronological) order.
    let mut order: Vec<NodeId> = Vec::new();
    let mut stack = vec![node_id.clone()];
    while let Some(current) = stack.pop() {
        order.push(current.clone());
        if let Some(n) = session.node(&current) {
            // Reverse so the leftmost child is popped first.
            for child in n.children_ids.iter().rev() {
                stack.push(child.clone());
            }
        }
    }

    let parent = session
        .node(&parent_id)
        .ok_or_else(|| TreeError::NodeNotFound {
            id: parent_id.clone(),
        })?;
    let old_children = parent.children_ids.clone();
    let new_children: Vec<NodeId> = old_children
        .iter()
        .filter(|child| **child != *node_id)
        .cloned()
        .collect();

    let relation = RelationChange {
        node_id: node_id.clone(),
        old_parent_id: Some(parent_id.clone()),
        new_parent_id: None,
        affected_parents: HashMap::from([(
            parent_id.clone(),
            ChildListChange {
                old_children,
                new_children: new_children.clone(),
            },
        )]),
    };

    if let Some(parent) = session.node_mut(&parent_id) {
        parent.children_ids = new_children;
        if parent.last_selected_child_id.as_ref() == Some(node_id) {
            parent.last_selected_child_id = None;
        }
    }
    let mut nodes = Vec::with_capacity(order.len());
    for id in &order {
        if let Some(node) = session.nodes.remove(id) {
            nodes.push(node);
        }
    }
    session.touch();

    Ok(DeletedSubtree { nodes, relation })
}

/// Toggle a node's participation in context assembly. The node stays in the
/// tree either way.
pub fn set_enabled(session: &mut Session, node_id: &NodeId, value: bool) -> Result<NodeChange> {
    let node = session.node(node_id).ok_or_else(|| TreeError::NodeNotFound {
        id: node_id.clone(),
    })?;
    let before = node.clone();
    let mut after = before.clone();
    after.enabled = value;
    session.nodes.insert(node_id.clone(), after.clone());
    session.touch();
    Ok(NodeChange {
        node_id: node_id.clone(),
        before,
        after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{NodeStatus, Role};

    fn session_with_chain() -> (Session, NodeId, NodeId) {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let user = create_child(&mut session, &root, NodeDraft::new(Role::User, "hi"))
            .unwrap()
            .id;
        let assistant = create_child(&mut session, &user, NodeDraft::new(Role::Assistant, "hello"))
            .unwrap()
            .id;
        (session, user, assistant)
    }

    #[test]
    fn create_child_appends_rightmost() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let a = create_child(&mut session, &root, NodeDraft::new(Role::User, "a"))
            .unwrap()
            .id;
        let b = create_child(&mut session, &root, NodeDraft::new(Role::User, "b"))
            .unwrap()
            .id;
        assert_eq!(session.node(&root).unwrap().children_ids, vec![a, b]);
        assert!(session.validate().is_ok());
    }

    #[test]
    fn create_child_missing_parent_fails() {
        let mut session = Session::new("sys");
        let err = create_child(
            &mut session,
            &NodeId::from("ghost"),
            NodeDraft::new(Role::User, "a"),
        )
        .unwrap_err();
        assert_eq!(err.code(), "NODE_NOT_FOUND");
        assert_eq!(session.nodes.len(), 1);
    }

    #[test]
    fn update_replaces_only_requested_fields() {
        let (mut session, user, _) = session_with_chain();
        let change = update_node(
            &mut session,
            &user,
            NodeUpdate {
                content: Some("edited".to_string()),
                status: Some(NodeStatus::Complete),
                ..NodeUpdate::default()
            },
        )
        .unwrap();
        assert_eq!(change.before.content, "hi");
        assert_eq!(change.after.content, "edited");
        assert_eq!(session.node(&user).unwrap().content, "edited");
        assert_eq!(change.after.role, Role::User);
    }

    #[test]
    fn detach_root_is_rejected() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        assert_eq!(detach(&mut session, &root).unwrap_err(), TreeError::RootImmutable);
    }

    #[test]
    fn attach_rejects_cycle() {
        let (mut session, user, assistant) = session_with_chain();
        detach(&mut session, &user).unwrap();
        let err = attach(&mut session, &user, &assistant, None).unwrap_err();
        assert!(matches!(err, TreeError::CycleWouldBeCreated { .. }));
        // Recover: reattach under root keeps the session valid.
        let root = session.root_node_id.clone();
        attach(&mut session, &user, &root, None).unwrap();
        assert!(session.validate().is_ok());
    }

    #[test]
    fn attach_inserts_at_index() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let a = create_child(&mut session, &root, NodeDraft::new(Role::User, "a"))
            .unwrap()
            .id;
        let b = create_child(&mut session, &root, NodeDraft::new(Role::User, "b"))
            .unwrap()
            .id;
        detach(&mut session, &a).unwrap();
        attach(&mut session, &a, &root, Some(0)).unwrap();
        assert_eq!(session.node(&root).unwrap().children_ids, vec![a, b]);
    }

    #[test]
    fn delete_subtree_returns_preorder() {
        let (mut session, user, assistant) = session_with_chain();
        let grandchild = create_child(&mut session, &assistant, NodeDraft::new(Role::User, "more"))
            .unwrap()
            .id;
        let deleted = delete_subtree(&mut session, &user).unwrap();
        let ids: Vec<NodeId> = deleted.nodes.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec![user, assistant, grandchild]);
        assert_eq!(session.nodes.len(), 1);
        assert!(session
            .node(&session.root_node_id)
            .unwrap()
            .children_ids
            .is_empty());
    }

    #[test]
    fn delete_root_is_rejected() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        assert_eq!(
            delete_subtree(&mut session, &root).unwrap_err(),
            TreeError::RootImmutable
        );
    }

    #[test]
    fn set_enabled_toggles() {
        let (mut session, user, _) = session_with_chain();
        set_enabled(&mut session, &user, false).unwrap();
        assert!(!session.node(&user).unwrap().enabled);
        set_enabled(&mut session, &user, true).unwrap();
        assert!(session.node(&user).unwrap().enabled);
    }
}
