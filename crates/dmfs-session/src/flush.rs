//! Lifecycle flush: forced termination of events referencing an object
//! or filesystem being torn down.

use std::sync::Arc;

use crate::event::{Event, EventRecord, FsId, ObjectRef, Reply};
use crate::registry::SessionRegistry;
use crate::session::SessionState;
use crate::stats::EngineStats;

/// What is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTarget {
    /// Every event on the filesystem.
    Filesystem(FsId),
    /// Events on one object.
    Object(ObjectRef),
}

impl FlushTarget {
    fn matches(&self, event: &Event) -> bool {
        match *self {
            FlushTarget::Filesystem(fsid) => event.object.fsid == fsid,
            FlushTarget::Object(obj) => {
                event.object.fsid == obj.fsid && event.object.ino == obj.ino
            }
        }
    }
}

/// Sweeps every session's writer-wait, pending, and delivered queues
/// for events referencing `target`, terminating each with
/// `Reply::Abort(errno)` and flush semantics: blocked waiters wake and
/// see the operation fail, waiter-less events are finalized and
/// unlinked on the spot.
///
/// Returns the records of the waiter-less events, so the caller can
/// feed any follow-on events through the normal dispatch path.
pub(crate) fn flush(
    sessions: &SessionRegistry,
    stats: &EngineStats,
    target: FlushTarget,
    errno: i32,
) -> Vec<EventRecord> {
    let mut finalized = Vec::new();
    for session in sessions.snapshot() {
        let mut state = session.state.lock();
        let parked: Vec<Arc<Event>> = state
            .writerq
            .iter()
            .filter(|e| target.matches(e))
            .cloned()
            .collect();
        let queued: Vec<Arc<Event>> = state
            .pending
            .iter()
            .chain(state.delivered.iter())
            .filter(|e| target.matches(e))
            .cloned()
            .collect();

        let mut terminated = 0u64;
        for event in &parked {
            state.writerq.remove(event);
            // The producer is parked on the writer condvar by
            // construction; never report these as waiter-less.
            terminate(&mut state, event, errno);
            terminated += 1;
        }
        for event in &queued {
            state.pending.remove(event);
            state.delivered.remove(event);
            if terminate(&mut state, event, errno) {
                finalized.push(event.record());
            }
            terminated += 1;
        }
        if terminated > 0 {
            // Queue space was freed and parked writers must observe
            // their flushed events.
            session.writer_cv.notify_all();
            tracing::debug!(
                "flushed {} event(s) on session {} for {:?} (errno {})",
                terminated,
                session.id(),
                target,
                errno
            );
            for _ in 0..terminated {
                EngineStats::bump(&stats.events_flushed);
            }
        }
    }
    finalized
}

/// Marks one event flush-terminated and wakes anyone blocked on it.
/// Returns true when no waiter was attached.
fn terminate(state: &mut SessionState, event: &Arc<Event>, errno: i32) -> bool {
    state.unindex_event(event);
    let mut event_state = event.state.lock();
    if event_state.completed {
        return false;
    }
    event_state.reply = Some(Reply::Abort(errno));
    event_state.completed = true;
    event_state.flushed = true;
    let waiterless = !event_state.producer_waiting && event_state.extra_waiters == 0;
    drop(event_state);
    event.reply_cv.notify_all();
    waiterless
}
