use std::time::Duration;

/// Configuration for the session/event engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum events queued on a session's pending queue before
    /// producers block (default 64).
    pub max_pending_per_session: usize,
    /// Maximum length of a session's descriptive info string (default 256).
    pub max_session_info_len: usize,
    /// Granularity at which blocking waits recheck their interrupt
    /// token (default 10ms).
    pub interrupt_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_pending_per_session: 64,
            max_session_info_len: 256,
            interrupt_poll: Duration::from_millis(10),
        }
    }
}
