//! DMFS session subsystem: the broker between filesystem operations and
//! data-management applications.
//!
//! Applications subscribe through long-lived sessions; filesystem code
//! submits events into bounded per-session FIFO queues; synchronous
//! event kinds block the triggering operation until the application
//! replies with a disposition. The engine guarantees at-most-once
//! delivery, coalesces duplicate in-flight data requests, applies
//! bounded-queue backpressure to producers, arbitrates mount broadcasts
//! across sessions in id order, and force-terminates outstanding events
//! when their filesystem or object is torn down.
//!
//! Locking is strictly ordered: registry lock, then one session's lock,
//! then one event's lock. All state is in memory; nothing survives a
//! restart.

pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod flush;
pub mod fsreg;
pub mod interrupt;
pub mod registry;
pub mod session;
pub mod stats;

mod mount;
mod queue;
mod token;

pub use config::EngineConfig;
pub use delivery::WaitOptions;
pub use engine::DmEngine;
pub use error::{DmError, Result};
pub use event::{
    ByteRange, Disposition, EventKind, EventRecord, EventSpec, FsId, ObjectRef, ObjectType, Reply,
    Token,
};
pub use flush::FlushTarget;
pub use fsreg::FsState;
pub use interrupt::InterruptToken;
pub use session::SessionId;
pub use stats::EngineStatsSnapshot;
