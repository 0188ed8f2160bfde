use trellis_core::{NodeId, SessionId};

/// Engine-to-observer notifications. The UI subscribes through
/// `ChatExecutor::subscribe`; the core never renders anything itself.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    NodeCreated {
        session_id: SessionId,
        node_id: NodeId,
    },
    /// Content or metadata changed — streaming flushes coalesce into these.
    NodeUpdated {
        session_id: SessionId,
        node_id: NodeId,
    },
    TurnCompleted {
        session_id: SessionId,
        node_id: NodeId,
    },
    TurnFailed {
        session_id: SessionId,
        node_id: NodeId,
        error: String,
    },
    /// Undo/redo or a recorded edit changed the tree shape.
    HistoryChanged { session_id: SessionId },
}
