//! Session: one subscriber endpoint and its queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::event::{DedupKey, Event, Token};
use crate::queue::EventQueue;

/// Session identifier. Monotonic; never reused within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Returns the underlying u64 value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State guarded by the session lock: the three queues, the duplicate
/// index, and the wait counters. Moving an event between queues always
/// happens under this lock.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    /// Events awaiting a consumer, in submission order.
    pub(crate) pending: EventQueue,
    /// Synchronous events a consumer has read, reachable by token.
    pub(crate) delivered: EventQueue,
    /// Events whose producers are blocked on a full pending queue.
    pub(crate) writerq: EventQueue,
    /// In-flight data events keyed by (kind, target, range).
    pub(crate) dedup: HashMap<DedupKey, Arc<Event>>,
    /// Consumers blocked in `get_events`.
    pub(crate) readers_waiting: u32,
    /// Producers blocked on backpressure.
    pub(crate) writers_waiting: u32,
}

impl SessionState {
    /// Registers `event` in the duplicate index if its kind and target
    /// qualify, marking it indexed.
    pub(crate) fn index_event(&mut self, event: &Arc<Event>) {
        if let Some(key) = event.dedup_key {
            self.dedup.insert(key, Arc::clone(event));
            event.state.lock().indexed = true;
        }
    }

    /// Drops `event` from the duplicate index if it is indexed.
    pub(crate) fn unindex_event(&mut self, event: &Arc<Event>) {
        let mut state = event.state.lock();
        if !state.indexed {
            return;
        }
        state.indexed = false;
        drop(state);
        if let Some(key) = event.dedup_key {
            if let Some(current) = self.dedup.get(&key) {
                if Arc::ptr_eq(current, event) {
                    self.dedup.remove(&key);
                }
            }
        }
    }

    /// Finds the delivered entry holding `token`.
    pub(crate) fn find_delivered(&self, token: Token) -> Option<Arc<Event>> {
        self.delivered.find_token(token)
    }
}

/// A long-lived subscriber endpoint representing one data-management
/// application. Owned by the registry, shared by reference with every
/// producer and consumer touching it.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    info: String,
    /// Participates in mount broadcasts.
    want_mount: AtomicBool,
    pub(crate) state: Mutex<SessionState>,
    /// Wakes consumers blocked on an empty pending queue.
    pub(crate) reader_cv: Condvar,
    /// Wakes producers blocked on a full pending queue.
    pub(crate) writer_cv: Condvar,
}

impl Session {
    pub(crate) fn new(id: SessionId, info: String) -> Self {
        Self {
            id,
            info,
            want_mount: AtomicBool::new(false),
            state: Mutex::new(SessionState::default()),
            reader_cv: Condvar::new(),
            writer_cv: Condvar::new(),
        }
    }

    /// This session's id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The descriptive info string supplied at creation.
    pub fn info(&self) -> &str {
        &self.info
    }

    /// Whether this session receives mount broadcasts.
    pub fn wants_mount(&self) -> bool {
        self.want_mount.load(Ordering::Acquire)
    }

    pub(crate) fn set_mount_interest(&self, interested: bool) {
        self.want_mount.store(interested, Ordering::Release);
    }

    /// True when the session holds no queued events and nobody is
    /// blocked on it; only then may it be destroyed.
    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty()
            && state.delivered.is_empty()
            && state.writerq.is_empty()
            && state.readers_waiting == 0
            && state.writers_waiting == 0
    }
}
