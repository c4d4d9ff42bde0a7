//! Registry of open scan sessions.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::domain::authorization::SupervisorAuthorization;
use crate::domain::session::{ScanSession, SessionId};
use crate::error::{Result, ScanError};

/// Shared, lockable session. Holding the lock serializes scans on one terminal.
pub type SessionHandle = Arc<Mutex<ScanSession>>;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: ScanSession) -> SessionHandle {
        let id = session.id;
        let handle = Arc::new(Mutex::new(session));
        self.sessions.insert(id, handle.clone());
        handle
    }

    pub fn get(&self, id: SessionId) -> Result<SessionHandle> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(ScanError::SessionNotFound(id))
    }

    pub fn remove(&self, id: SessionId) -> Result<SessionHandle> {
        self.sessions
            .remove(&id)
            .map(|(_, handle)| handle)
            .ok_or(ScanError::SessionNotFound(id))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions idle for longer than `idle_timeout`.
    ///
    /// Sessions busy with a scan are skipped. Returns the unconsumed grants held by
    /// the purged sessions so the caller can revoke them.
    pub fn purge_idle(
        &self,
        now: DateTime<Utc>,
        idle_timeout: Duration,
    ) -> Vec<SupervisorAuthorization> {
        let handles: Vec<(SessionId, SessionHandle)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut grants = Vec::new();
        for (id, handle) in handles {
            let Ok(mut session) = handle.try_lock() else {
                continue;
            };
            if session.is_idle(now, idle_timeout) {
                self.sessions.remove(&id);
                if let Some(grant) = session.cancel_gate() {
                    grants.push(grant);
                }
                tracing::info!(
                    session_id = %id,
                    terminal_id = %session.terminal_id,
                    "Purged idle scan session"
                );
            }
        }
        grants
    }
}
