use thiserror::Error;
use trellis_core::NodeId;

/// Structural errors from the node store and navigator. Every failing
/// operation leaves the session untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("node not found: {id}")]
    NodeNotFound { id: NodeId },

    #[error("attaching {node} under {parent} would create a cycle")]
    CycleWouldBeCreated { node: NodeId, parent: NodeId },

    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("operation not allowed on the root node")]
    RootImmutable,
}

impl TreeError {
    /// Short stable code string for client surfacing.
    pub fn code(&self) -> &'static str {
        match self {
            TreeError::NodeNotFound { .. } => "NODE_NOT_FOUND",
            TreeError::CycleWouldBeCreated { .. } => "CYCLE_WOULD_BE_CREATED",
            TreeError::InvalidMutation(_) => "INVALID_MUTATION",
            TreeError::RootImmutable => "ROOT_IMMUTABLE",
        }
    }
}

pub type Result<T> = std::result::Result<T, TreeError>;
