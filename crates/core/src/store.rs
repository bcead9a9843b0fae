//! Persistence capability.
//!
//! The engine appends every message to the configured [`SessionStore`]
//! right after adding it to the session, and never waits for durability
//! before going on with a turn.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::conversation::Message;
use crate::session::{SessionId, SessionRecord, SessionSummary};

/// Error of a [`SessionStore`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Nothing is stored for the session.
    #[error("session `{0}` not found")]
    NotFound(SessionId),
    /// The backend failed.
    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// Storage of sessions between turns.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Appends a message to a session, creating the session if needed.
    async fn append_message(
        &self,
        session: &SessionId,
        message: &Message,
    ) -> Result<(), StoreError>;

    /// Loads a session.
    async fn load_session(
        &self,
        session: &SessionId,
    ) -> Result<SessionRecord, StoreError>;

    /// Records the compaction metadata of a session.
    async fn update_summary(
        &self,
        session: &SessionId,
        summary: SessionSummary,
    ) -> Result<(), StoreError> {
        let _ = (session, summary);
        Ok(())
    }
}

/// A store keeping everything in memory.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl MemoryStore {
    /// Returns the number of stored sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionRecord>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn append_message(
        &self,
        session: &SessionId,
        message: &Message,
    ) -> Result<(), StoreError> {
        self.lock()
            .entry(session.clone())
            .or_insert_with(|| SessionRecord {
                id: session.clone(),
                messages: vec![],
                summary: SessionSummary::default(),
            })
            .messages
            .push(message.clone());
        Ok(())
    }

    async fn load_session(
        &self,
        session: &SessionId,
    ) -> Result<SessionRecord, StoreError> {
        self.lock()
            .get(session)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(session.clone()))
    }

    async fn update_summary(
        &self,
        session: &SessionId,
        summary: SessionSummary,
    ) -> Result<(), StoreError> {
        match self.lock().get_mut(session) {
            Some(record) => {
                record.summary = summary;
                Ok(())
            }
            None => Err(StoreError::NotFound(session.clone())),
        }
    }
}
