//! Wire protocol for the Wheelhouse streaming backend.
//!
//! Everything a transport layer needs to speak to browser clients lives
//! here: the typed event stream, the envelope that carries sequence numbers,
//! client-to-server messages, and the connect-time server frames. The crate
//! is deliberately free of runtime machinery so it can be consumed by thin
//! frontends.

pub mod activity;
pub mod event;
pub mod message;
pub mod types;

pub use activity::Activity;
pub use event::{EventEnvelope, SessionMode, SessionStatus, StreamEvent, TokenUsage, TurnResult};
pub use message::{
    ClientMessage, PermissionBehavior, ServerFrame, SessionSnapshot, StoredMessage,
};
pub use types::{ConnectionId, SessionId};
