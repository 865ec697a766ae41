//! Streaming core for Wheelhouse.
//!
//! One [`service::StreamService`] instance owns all per-session in-memory
//! state: sequence counters, the recent-event ring, and the live connection
//! registry. Turns are executed by [`runner::TurnRunner`], which spawns the
//! assistant subprocess, translates its line protocol into typed events, and
//! drives the event log and the registry. Reconnecting clients recover missed
//! events through the buffer's ring-or-durable-fallback read path.

pub mod activity;
pub mod buffer;
pub mod connections;
pub mod error;
pub mod permission;
pub mod runner;
pub mod sequencer;
pub mod service;
pub mod session;
pub mod store;

pub use error::{Error, Result};
pub use service::{StreamService, StreamServiceConfig};
