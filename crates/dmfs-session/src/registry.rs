//! The ordered collection of all sessions.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::error::{DmError, Result};
use crate::session::{Session, SessionId};

#[derive(Debug)]
struct RegistryState {
    /// Ascending by id; new sessions are appended at the tail only, so
    /// an ascending-id scan taken while the lock is dropped and
    /// re-taken can never miss a session that existed throughout.
    sessions: Vec<Arc<Session>>,
    next_id: u64,
}

/// Owner of every session. Constructed once per engine and passed by
/// handle; the registry lock protects only the list and the id counter.
#[derive(Debug)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    max_info_len: usize,
}

impl SessionRegistry {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                sessions: Vec::new(),
                next_id: 1,
            }),
            max_info_len: config.max_session_info_len,
        }
    }

    /// Creates a session with a strictly increasing id.
    pub fn create(&self, info: &str) -> Result<SessionId> {
        if info.len() > self.max_info_len {
            return Err(DmError::invalid(format!(
                "session info exceeds {} bytes",
                self.max_info_len
            )));
        }
        let mut state = self.state.lock();
        let id = SessionId(state.next_id);
        state.next_id += 1;
        state.sessions.push(Arc::new(Session::new(id, info.to_string())));
        tracing::debug!("created session {} ({:?})", id, info);
        Ok(id)
    }

    /// Removes a session. Fails `Busy` while events are queued or a
    /// reader or writer is blocked on it.
    pub fn destroy(&self, id: SessionId) -> Result<()> {
        let mut state = self.state.lock();
        let pos = state
            .sessions
            .iter()
            .position(|s| s.id() == id)
            .ok_or(DmError::NotFound)?;
        if !state.sessions[pos].is_idle() {
            return Err(DmError::Busy);
        }
        state.sessions.remove(pos);
        tracing::debug!("destroyed session {}", id);
        Ok(())
    }

    /// Linear scan under the registry lock. Sessions are few and
    /// long-lived.
    pub fn find(&self, id: SessionId) -> Result<Arc<Session>> {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or(DmError::NotFound)
    }

    /// All live session ids, ascending.
    pub fn list(&self) -> Vec<SessionId> {
        self.state.lock().sessions.iter().map(|s| s.id()).collect()
    }

    /// The lowest-id mount-interested session with id greater than
    /// `after`. Re-reads the live list each call, so a broadcast scan
    /// observes sessions created or destroyed mid-scan.
    pub(crate) fn next_mount_interested_after(&self, after: u64) -> Option<Arc<Session>> {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|s| s.id().as_u64() > after && s.wants_mount())
            .cloned()
    }

    /// Every live session, ascending, for flush sweeps.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Session>> {
        self.state.lock().sessions.clone()
    }
}
