//! Session storage. The in-memory store keeps the whole map behind one
//! `RwLock`; writers take the lock exclusively, which is what gives each
//! session its single-logical-writer guarantee.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::{Session, SessionError, SessionId};

pub type SessionMutator = Box<dyn FnOnce(&mut Session) + Send>;

/// Backing store for session records. Reads hand out snapshots; writes go
/// through [`SessionStore::modify`] so the record is never observable
/// half-mutated. A session swept mid-use surfaces as `NotFound`, which
/// callers treat as soft.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: Session);

    /// Snapshot of a live session. Closed or unknown ids read as absent.
    async fn get(&self, id: &str) -> Option<Session>;

    /// Apply one mutation under the write lock and return the updated
    /// snapshot. Closed sessions accept no writes.
    async fn modify(&self, id: &str, mutate: SessionMutator) -> Result<Session, SessionError>;

    /// Soft-close a session.
    async fn close(&self, id: &str) -> Result<(), SessionError>;

    /// Close every session idle longer than `max_idle`; returns how many
    /// were swept.
    async fn sweep_expired(&self, max_idle: Duration) -> usize;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: tokio::sync::RwLock<HashMap<SessionId, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }

    async fn get(&self, id: &str) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions.get(id).filter(|s| !s.is_closed()).cloned()
    }

    async fn modify(&self, id: &str, mutate: SessionMutator) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if session.is_closed() {
            return Err(SessionError::Closed(id.to_string()));
        }
        mutate(session);
        session.touch();
        Ok(session.clone())
    }

    async fn close(&self, id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.close();
        Ok(())
    }

    async fn sweep_expired(&self, max_idle: Duration) -> usize {
        let deadline = Utc::now() - max_idle;
        let mut sessions = self.sessions.write().await;
        let mut swept = 0;
        for session in sessions.values_mut() {
            if !session.is_closed() && session.updated_at < deadline {
                tracing::debug!(session_id = %session.id, "sweeping expired session");
                session.close();
                swept += 1;
            }
        }
        swept
    }
}
