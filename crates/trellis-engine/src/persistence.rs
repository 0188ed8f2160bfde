//! Opaque persistence seam. Sessions, agents, and user profiles are stored
//! as independent records keyed by id; the engine never sees the storage
//! format. `MemoryPersistence` backs tests and throwaway embedding.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use trellis_core::{AgentDefinition, AgentId, Session, SessionId, SessionMeta, UserProfile};

#[derive(Debug, Error)]
#[error("persistence failure: {0}")]
pub struct PersistenceError(pub String);

pub type Result<T> = std::result::Result<T, PersistenceError>;

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn load_session_index(&self) -> Result<Vec<SessionMeta>>;

    async fn load_session(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Idempotent and atomic on its own; called after every committed
    /// mutation.
    async fn save_session(&self, session: &Session) -> Result<()>;

    /// Moves the record to a recycle bin rather than destroying it.
    async fn delete_session(&self, id: &SessionId) -> Result<()>;

    async fn load_agent(&self, id: &AgentId) -> Result<Option<AgentDefinition>>;

    async fn save_agent(&self, agent: &AgentDefinition) -> Result<()>;

    async fn delete_agent(&self, id: &AgentId) -> Result<()>;

    async fn load_profile(&self, id: &str) -> Result<Option<UserProfile>>;

    async fn save_profile(&self, profile: &UserProfile) -> Result<()>;
}

/// In-memory adapter: a map per record type plus a recycle bin for deleted
/// sessions.
#[derive(Default)]
pub struct MemoryPersistence {
    sessions: DashMap<SessionId, Session>,
    recycled: DashMap<SessionId, Session>,
    agents: DashMap<AgentId, AgentDefinition>,
    profiles: DashMap<String, UserProfile>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: how many sessions sit in the recycle bin.
    pub fn recycled_count(&self) -> usize {
        self.recycled.len()
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryPersistence {
    async fn load_session_index(&self) -> Result<Vec<SessionMeta>> {
        let mut index: Vec<SessionMeta> = self
            .sessions
            .iter()
            .map(|entry| SessionMeta::from(entry.value()))
            .collect();
        index.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(index)
    }

    async fn load_session(&self, id: &SessionId) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).map(|entry| entry.value().clone()))
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> Result<()> {
        if let Some((id, session)) = self.sessions.remove(id) {
            self.recycled.insert(id, session);
        }
        Ok(())
    }

    async fn load_agent(&self, id: &AgentId) -> Result<Option<AgentDefinition>> {
        Ok(self.agents.get(id).map(|entry| entry.value().clone()))
    }

    async fn save_agent(&self, agent: &AgentDefinition) -> Result<()> {
        self.agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn delete_agent(&self, id: &AgentId) -> Result<()> {
        self.agents.remove(id);
        Ok(())
    }

    async fn load_profile(&self, id: &str) -> Result<Option<UserProfile>> {
        Ok(self.profiles.get(id).map(|entry| entry.value().clone()))
    }

    async fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        self.profiles.insert(profile.id.clone(), profile.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_load_round_trip() {
        let store = MemoryPersistence::new();
        let session = Session::new("sys");
        store.save_session(&session).await.unwrap();
        let loaded = store.load_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded, session);
    }

    #[tokio::test]
    async fn delete_moves_to_recycle_bin() {
        let store = MemoryPersistence::new();
        let session = Session::new("sys");
        store.save_session(&session).await.unwrap();
        store.delete_session(&session.id).await.unwrap();
        assert!(store.load_session(&session.id).await.unwrap().is_none());
        assert_eq!(store.recycled_count(), 1);
    }

    #[tokio::test]
    async fn index_lists_saved_sessions() {
        let store = MemoryPersistence::new();
        store.save_session(&Session::new("a")).await.unwrap();
        store.save_session(&Session::new("b")).await.unwrap();
        assert_eq!(store.load_session_index().await.unwrap().len(), 2);
    }
}
