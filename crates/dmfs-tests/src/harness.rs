//! Test harness: a ready-to-use engine with helper shorthands.

use std::sync::{Arc, Once};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dmfs_session::{
    Disposition, DmEngine, EngineConfig, EventKind, EventRecord, EventSpec, FsId, ObjectRef,
    SessionId, WaitOptions,
};

static INIT_LOGGING: Once = Once::new();

/// Installs the fmt subscriber once per process. Run tests with
/// `RUST_LOG=dmfs_session=debug` to see engine internals.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(EnvFilter::from_default_env())
            .init();
    });
}

/// An engine plus the shorthands every scenario needs.
#[derive(Debug)]
pub struct TestEngine {
    pub engine: Arc<DmEngine>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_queue_limit(limit: usize) -> Self {
        Self::with_config(EngineConfig {
            max_pending_per_session: limit,
            ..EngineConfig::default()
        })
    }

    pub fn with_config(config: EngineConfig) -> Self {
        init_logging();
        Self {
            engine: Arc::new(DmEngine::new(config)),
        }
    }

    pub fn session(&self, info: &str) -> SessionId {
        self.engine.create_session(info).expect("create_session")
    }

    /// A synchronous WRITE spec on a regular file.
    pub fn write_spec(fsid: u64, ino: u64, offset: u64, length: u64) -> EventSpec {
        EventSpec::data(
            EventKind::Write,
            ObjectRef::regular(FsId(fsid), ino),
            offset,
            length,
        )
    }

    /// An asynchronous attribute-change spec.
    pub fn attr_spec(fsid: u64, ino: u64) -> EventSpec {
        EventSpec::plain(EventKind::Attribute, ObjectRef::regular(FsId(fsid), ino))
    }

    /// Non-blocking read of at most `max` events.
    pub fn poll_events(&self, sid: SessionId, max: usize) -> Vec<EventRecord> {
        let opts = WaitOptions {
            non_blocking: true,
            ..WaitOptions::default()
        };
        match self.engine.get_events(sid, max, 1 << 20, &opts) {
            Ok(events) => events,
            Err(dmfs_session::DmError::WouldBlock) => Vec::new(),
            Err(e) => panic!("get_events failed: {e}"),
        }
    }

    /// Blocking read of exactly one event.
    pub fn next_event(&self, sid: SessionId) -> EventRecord {
        self.engine
            .get_events(sid, 1, 1 << 20, &WaitOptions::default())
            .expect("get_events")
            .remove(0)
    }

    /// Replies Continue to the given token.
    pub fn reply_continue(&self, sid: SessionId, record: &EventRecord) {
        self.engine
            .respond_event(sid, record.token, Disposition::Continue, 0)
            .expect("respond_event");
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
