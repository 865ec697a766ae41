use thiserror::Error;

use crate::connections::ConnectionError;
use crate::session::SessionStoreError;
use crate::store::EventStoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
    #[error(transparent)]
    SessionStore(#[from] SessionStoreError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("A turn is already running for session {0}")]
    TurnAlreadyActive(wheelhouse_protocol::SessionId),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}
