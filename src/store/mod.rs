//! Durable session storage seam
//!
//! The store is the source of truth for session documents. The in-memory room
//! tracking in the registry is derived state only and must always be
//! reconstructable from here.

use crate::session::{SessionId, SessionStatus, StudySession, UserId};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persistent record store for study sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a newly created session
    async fn insert(&self, session: StudySession) -> Result<()>;

    /// Fetch a session by id
    async fn get(&self, id: SessionId) -> Result<Option<StudySession>>;

    /// Persist an updated session document
    async fn put(&self, session: StudySession) -> Result<()>;

    /// All sessions currently in the given status
    async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<StudySession>>;

    /// All sessions the user created or participates in, ordered by start time
    async fn list_for_user(&self, user: &UserId) -> Result<Vec<StudySession>>;
}

/// Process-local store backed by a map
///
/// Stands in for the external document database in tests and single-node
/// deployments.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionId, StudySession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert(&self, session: StudySession) -> Result<()> {
        self.sessions.write().await.insert(session.id, session);
        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<Option<StudySession>> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn put(&self, session: StudySession) -> Result<()> {
        self.sessions.write().await.insert(session.id, session);
        Ok(())
    }

    async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<StudySession>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn list_for_user(&self, user: &UserId) -> Result<Vec<StudySession>> {
        let mut sessions: Vec<StudySession> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| &s.creator == user || s.participant(user).is_some())
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.start_at);
        Ok(sessions)
    }
}
