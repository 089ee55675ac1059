use thiserror::Error;

use crate::event::EventKind;

/// Errors surfaced by the session/event-delivery engine.
///
/// Every error is returned synchronously at the point of detection; the
/// engine never retries in the background.
#[derive(Debug, Error)]
pub enum DmError {
    /// Unknown session id or token.
    #[error("no such session or token")]
    NotFound,

    /// Malformed argument, e.g. a bad disposition/kind pairing.
    #[error("invalid argument: {reason}")]
    Invalid { reason: String },

    /// Session destroy attempted while work is outstanding.
    #[error("session busy: queued events or blocked readers remain")]
    Busy,

    /// A non-blocking submit matched an identical in-flight event.
    #[error("duplicate in-flight event")]
    Duplicate,

    /// A non-blocking call would have had to sleep.
    #[error("operation would block")]
    WouldBlock,

    /// A blocking wait was interrupted by an external signal.
    #[error("wait interrupted")]
    Interrupted,

    /// The output buffer cannot hold even one event message.
    #[error("event message too big: need {needed} bytes, buffer holds {capacity}")]
    TooBig { needed: usize, capacity: usize },

    /// An event kind the dispatcher does not handle. Always surfaced,
    /// never silently dropped.
    #[error("unsupported event kind: {kind:?}")]
    Unsupported { kind: EventKind },
}

impl DmError {
    /// Shorthand for an `Invalid` error with the given reason.
    pub fn invalid(reason: impl Into<String>) -> Self {
        DmError::Invalid {
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DmError>;
