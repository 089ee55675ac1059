//! Engine-wide counters, sampled lock-free.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters covering the life of one engine instance.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub(crate) sessions_created: AtomicU64,
    pub(crate) sessions_destroyed: AtomicU64,
    pub(crate) events_submitted: AtomicU64,
    pub(crate) events_delivered: AtomicU64,
    pub(crate) events_replied: AtomicU64,
    pub(crate) events_coalesced: AtomicU64,
    pub(crate) duplicates_rejected: AtomicU64,
    pub(crate) events_flushed: AtomicU64,
    pub(crate) writer_waits: AtomicU64,
    pub(crate) reader_waits: AtomicU64,
}

impl EngineStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Acquire),
            sessions_destroyed: self.sessions_destroyed.load(Ordering::Acquire),
            events_submitted: self.events_submitted.load(Ordering::Acquire),
            events_delivered: self.events_delivered.load(Ordering::Acquire),
            events_replied: self.events_replied.load(Ordering::Acquire),
            events_coalesced: self.events_coalesced.load(Ordering::Acquire),
            duplicates_rejected: self.duplicates_rejected.load(Ordering::Acquire),
            events_flushed: self.events_flushed.load(Ordering::Acquire),
            writer_waits: self.writer_waits.load(Ordering::Acquire),
            reader_waits: self.reader_waits.load(Ordering::Acquire),
        }
    }
}

/// Snapshot of [`EngineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    /// Sessions created since engine start.
    pub sessions_created: u64,
    /// Sessions destroyed since engine start.
    pub sessions_destroyed: u64,
    /// Events accepted by the dispatcher.
    pub events_submitted: u64,
    /// Events handed to consumers via `get_events`.
    pub events_delivered: u64,
    /// Replies applied via `respond_event`.
    pub events_replied: u64,
    /// Producers attached to an in-flight event instead of queuing.
    pub events_coalesced: u64,
    /// Non-blocking submits rejected as duplicates.
    pub duplicates_rejected: u64,
    /// Events force-terminated by a lifecycle flush.
    pub events_flushed: u64,
    /// Times a producer slept on a full pending queue.
    pub writer_waits: u64,
    /// Times a consumer slept on an empty pending queue.
    pub reader_waits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_starts_zero() {
        let stats = EngineStats::default();
        assert_eq!(stats.snapshot(), EngineStatsSnapshot::default());
    }

    #[test]
    fn test_bump_visible_in_snapshot() {
        let stats = EngineStats::default();
        EngineStats::bump(&stats.events_submitted);
        EngineStats::bump(&stats.events_submitted);
        EngineStats::bump(&stats.events_flushed);
        let snap = stats.snapshot();
        assert_eq!(snap.events_submitted, 2);
        assert_eq!(snap.events_flushed, 1);
        assert_eq!(snap.events_delivered, 0);
    }
}
