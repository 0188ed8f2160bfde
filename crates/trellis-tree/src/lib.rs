//! Tree mutations, branch navigation, and the undo/redo history log for one
//! session.

pub mod error;
pub mod history;
pub mod navigate;
pub mod store;

pub use error::{Result, TreeError};
pub use history::{
    HistoryEntry, HistoryError, HistoryLog, HistoryPayload, NodeDelta, INITIAL_STATE,
};
pub use navigate::{
    active_path, active_path_ids, ensure_valid_active_leaf, siblings, switch_sibling, switch_to,
    Direction,
};
pub use store::{
    attach, create_child, delete_subtree, detach, set_enabled, update_node, ChildListChange,
    CreatedChild, DeletedSubtree, NodeChange, RelationChange,
};
