//! DMFS test & validation infrastructure.
//!
//! End-to-end scenarios and multi-threaded stress tests for the session
//! subsystem: producer/consumer handshakes, coalescing, backpressure,
//! mount arbitration, and flush teardown.

pub mod harness;


pub use harness::{init_logging, TestEngine};
