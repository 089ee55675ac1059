//! External-signal interruption for blocking waits.
//!
//! Producers and consumers sleep inside the engine (backpressure, reply
//! waits, empty-queue reads). An `InterruptToken` models the external
//! signal that breaks such a sleep: the holder raises it, and every
//! blocking wait that was given a clone returns `DmError::Interrupted`
//! on its next predicate recheck.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A lightweight, cloneable interruption token.
///
/// Cloning is cheap; all clones observe the same raised state.
#[derive(Clone, Debug, Default)]
pub struct InterruptToken {
    raised: Arc<AtomicBool>,
}

impl InterruptToken {
    /// Creates a token in the un-raised state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the token. Idempotent.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    /// Returns true once `raise` has been called on any clone.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}
