//! # Call Registry
//!
//! Process-wide table of live relay sessions, keyed by session id.
//!
//! ## Resource Management:
//! - Enforces the maximum number of concurrent calls
//! - Rejects duplicate session ids
//! - Periodically closes and removes finished or overlong calls
//!
//! Sessions never share state through the registry; it only hands out
//! handles and counts them.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::RelayError;
use crate::relay::session::RelaySession;

/// Summary of the registry for the health and metrics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub active_calls: usize,
    pub max_calls: usize,
    pub state_counts: HashMap<String, usize>,
    pub frames_in: u64,
    pub turns_dispatched: u64,
}

pub struct CallRegistry {
    sessions: RwLock<HashMap<String, RelaySession>>,
    max_concurrent_calls: AtomicUsize,
}

impl CallRegistry {
    pub fn new(max_concurrent_calls: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_calls: AtomicUsize::new(max_concurrent_calls),
        }
    }

    /// Add a session.
    ///
    /// ## Returns:
    /// - **Err(CapacityReached)**: the concurrent call limit is already in use
    /// - **Err(DuplicateSession)**: a session with this id is registered
    pub fn register(&self, session: RelaySession) -> Result<(), RelayError> {
        let mut sessions = self.sessions.write();
        let max = self.max_concurrent_calls.load(Ordering::Relaxed);

        if sessions.len() >= max {
            warn!(session_id = %session.id(), max, "Rejecting call, registry is full");
            return Err(RelayError::CapacityReached(max));
        }

        if sessions.contains_key(session.id()) {
            return Err(RelayError::DuplicateSession(session.id().to_string()));
        }

        sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<RelaySession> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<RelaySession> {
        self.sessions.write().remove(session_id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent_calls.load(Ordering::Relaxed)
    }

    /// Change the limit for future registrations. Live calls are kept.
    pub fn set_max_concurrent_calls(&self, max: usize) {
        self.max_concurrent_calls.store(max, Ordering::Relaxed);
    }

    /// Close and remove sessions that are closed or older than `max_age`.
    ///
    /// Returns the number of sessions removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let removed: Vec<RelaySession> = {
            let mut sessions = self.sessions.write();
            let stale: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.state().is_closed() || session.age() >= max_age)
                .map(|(id, _)| id.clone())
                .collect();

            stale.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &removed {
            if session.close() {
                warn!(session_id = %session.id(), "Closed overlong call during cleanup");
            }
        }

        if !removed.is_empty() {
            info!(removed = removed.len(), "Registry cleanup");
        }
        removed.len()
    }

    /// Close every session, used on shutdown.
    pub fn close_all(&self) -> usize {
        let sessions: Vec<RelaySession> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.close();
        }
        sessions.len()
    }

    pub fn summary(&self) -> RegistrySummary {
        let sessions = self.sessions.read();

        let mut state_counts = HashMap::new();
        let mut frames_in = 0;
        let mut turns_dispatched = 0;

        for session in sessions.values() {
            *state_counts
                .entry(session.state().as_str().to_string())
                .or_insert(0) += 1;

            let stats = session.stats();
            frames_in += stats.frames_in;
            turns_dispatched += stats.turns_dispatched;
        }

        RegistrySummary {
            active_calls: sessions.len(),
            max_calls: self.max_concurrent_calls(),
            state_counts,
            frames_in,
            turns_dispatched,
        }
    }
}
