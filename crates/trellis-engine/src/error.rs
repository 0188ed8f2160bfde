use thiserror::Error;

use trellis_core::{AgentId, NodeId, SessionId};
use trellis_pipeline::PipelineError;
use trellis_tree::{HistoryError, TreeError};

use crate::client::LlmError;
use crate::persistence::PersistenceError;

/// Top-level engine error. Structural errors refuse the mutation and leave
/// state intact; streaming errors live on the affected node and are not
/// returned through this type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("session not found: {id}")]
    SessionNotFound { id: SessionId },

    #[error("agent not found: {id}")]
    AgentNotFound { id: AgentId },

    #[error("node not found: {id}")]
    NodeNotFound { id: NodeId },
}

impl EngineError {
    /// Short stable code string for client surfacing.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Tree(err) => err.code(),
            EngineError::History(err) => err.code(),
            EngineError::Pipeline(err) => err.code(),
            EngineError::Llm(_) => "LLM_STREAM_ERROR",
            EngineError::Persistence(_) => "PERSISTENCE_FAILURE",
            EngineError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            EngineError::AgentNotFound { .. } => "AGENT_NOT_FOUND",
            EngineError::NodeNotFound { .. } => "NODE_NOT_FOUND",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
