//! Shared test utilities for broadcaster integration tests.
//!
//! - `MockTransport`, a scripted in-memory transport that records every call
//! - `MockClock`, wall-clock time that follows tokio's (pausable) clock
//! - `TestBroadcaster`, a started broadcaster wired to both

pub mod harness;
pub mod transport;

pub use harness::{channels, MockClock, TestBroadcaster, START_MS};
pub use transport::{MockTransport, SubscribeBehavior};
