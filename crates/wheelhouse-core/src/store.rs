//! Durable event storage.
//!
//! The store is the eventually-consistent copy of every stream event: the
//! in-memory ring serves recently-connected clients, and anything the ring
//! can no longer prove contiguous falls back here. Writes arrive in small
//! batches from the buffer's background flusher and are best-effort.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Row,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
    },
};
use thiserror::Error;

use wheelhouse_protocol::{EventEnvelope, SessionId, StreamEvent};

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Migration error: {message}")]
    Migration { message: String },

    #[error("In-memory store lock poisoned: {message}")]
    LockPoisoned { message: String },
}

impl EventStoreError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn lock_poisoned(message: impl Into<String>) -> Self {
        Self::LockPoisoned {
            message: message.into(),
        }
    }
}

/// Durable, append-only event storage keyed by `(session_id, seq)`.
///
/// Sequence numbers are assigned upstream by the [`crate::sequencer::Sequencer`];
/// the store records what it is given and never renumbers.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Write a batch of stamped events in a single transaction.
    async fn append_batch(
        &self,
        batch: &[(SessionId, EventEnvelope)],
    ) -> Result<(), EventStoreError>;

    /// All events for a session with `seq > after_seq`, in sequence order.
    async fn events_after(
        &self,
        session_id: SessionId,
        after_seq: u64,
    ) -> Result<Vec<EventEnvelope>, EventStoreError>;

    /// All events after the most recent `user_message` event for a session.
    async fn current_turn_events(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<EventEnvelope>, EventStoreError>;

    /// Max recorded sequence per session, used to restore counters at startup.
    async fn latest_sequences(&self) -> Result<HashMap<SessionId, u64>, EventStoreError>;

    async fn delete_session(&self, session_id: SessionId) -> Result<(), EventStoreError>;

    /// Retention sweep: delete events older than the cutoff. Returns the
    /// number of rows removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, EventStoreError>;
}

pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    pub async fn new(path: &Path) -> Result<Self, EventStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EventStoreError::connection(format!("Failed to create directory: {e}"))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| EventStoreError::connection(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                EventStoreError::connection(format!("Failed to connect to SQLite: {e}"))
            })?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    pub async fn new_in_memory() -> Result<Self, EventStoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| EventStoreError::connection(format!("Invalid SQLite path: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                EventStoreError::connection(format!("Failed to connect to SQLite: {e}"))
            })?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stream_events (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::Migration {
            message: format!("Failed to create stream_events table: {e}"),
        })?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_stream_events_created_at
            ON stream_events(created_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::Migration {
            message: format!("Failed to create index: {e}"),
        })?;

        Ok(())
    }

    fn row_to_envelope(row: &sqlx::sqlite::SqliteRow) -> Result<EventEnvelope, EventStoreError> {
        let seq: i64 = row.get("seq");
        let ts: DateTime<Utc> = row.get("created_at");
        let payload: String = row.get("payload");
        let event: StreamEvent = serde_json::from_str(&payload)
            .map_err(|e| EventStoreError::serialization(format!("Invalid event payload: {e}")))?;
        Ok(EventEnvelope {
            seq: seq as u64,
            ts,
            event,
        })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append_batch(
        &self,
        batch: &[(SessionId, EventEnvelope)],
    ) -> Result<(), EventStoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EventStoreError::database(format!("Failed to begin transaction: {e}")))?;

        for (session_id, envelope) in batch {
            let payload = serde_json::to_string(&envelope.event).map_err(|e| {
                EventStoreError::serialization(format!("Failed to serialize event: {e}"))
            })?;

            sqlx::query(
                r#"
                INSERT INTO stream_events (session_id, seq, event_type, payload, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(session_id.to_string())
            .bind(envelope.seq as i64)
            .bind(envelope.event.event_type())
            .bind(&payload)
            .bind(envelope.ts)
            .execute(&mut *tx)
            .await
            .map_err(|e| EventStoreError::database(format!("Failed to append event: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| EventStoreError::database(format!("Failed to commit batch: {e}")))?;

        Ok(())
    }

    async fn events_after(
        &self,
        session_id: SessionId,
        after_seq: u64,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT seq, payload, created_at
            FROM stream_events
            WHERE session_id = ?1 AND seq > ?2
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id.to_string())
        .bind(after_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EventStoreError::database(format!("Failed to load events: {e}")))?;

        rows.iter().map(Self::row_to_envelope).collect()
    }

    async fn current_turn_events(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT seq, payload, created_at
            FROM stream_events
            WHERE session_id = ?1
              AND seq > COALESCE(
                (SELECT MAX(seq) FROM stream_events
                 WHERE session_id = ?1 AND event_type = 'user_message'),
                0
              )
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EventStoreError::database(format!("Failed to load turn events: {e}")))?;

        rows.iter().map(Self::row_to_envelope).collect()
    }

    async fn latest_sequences(&self) -> Result<HashMap<SessionId, u64>, EventStoreError> {
        let rows =
            sqlx::query("SELECT session_id, MAX(seq) AS max_seq FROM stream_events GROUP BY session_id")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    EventStoreError::database(format!("Failed to load latest sequences: {e}"))
                })?;

        let mut result = HashMap::with_capacity(rows.len());
        for row in rows {
            let id_str: String = row.get("session_id");
            let max_seq: i64 = row.get("max_seq");
            let session_id = id_str
                .parse::<SessionId>()
                .map_err(|e| EventStoreError::serialization(format!("Invalid session ID: {e}")))?;
            result.insert(session_id, max_seq as u64);
        }

        Ok(result)
    }

    async fn delete_session(&self, session_id: SessionId) -> Result<(), EventStoreError> {
        sqlx::query("DELETE FROM stream_events WHERE session_id = ?1")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| EventStoreError::database(format!("Failed to delete events: {e}")))?;

        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, EventStoreError> {
        let result = sqlx::query("DELETE FROM stream_events WHERE created_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| EventStoreError::database(format!("Failed to sweep events: {e}")))?;

        Ok(result.rows_affected())
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: std::sync::RwLock<HashMap<SessionId, Vec<EventEnvelope>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_batch(
        &self,
        batch: &[(SessionId, EventEnvelope)],
    ) -> Result<(), EventStoreError> {
        let mut events = self
            .events
            .write()
            .map_err(|_| EventStoreError::lock_poisoned("events"))?;
        for (session_id, envelope) in batch {
            events.entry(*session_id).or_default().push(envelope.clone());
        }
        Ok(())
    }

    async fn events_after(
        &self,
        session_id: SessionId,
        after_seq: u64,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let events = self
            .events
            .read()
            .map_err(|_| EventStoreError::lock_poisoned("events"))?;
        Ok(events
            .get(&session_id)
            .map(|e| {
                e.iter()
                    .filter(|envelope| envelope.seq > after_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn current_turn_events(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let events = self
            .events
            .read()
            .map_err(|_| EventStoreError::lock_poisoned("events"))?;
        let Some(session_events) = events.get(&session_id) else {
            return Ok(Vec::new());
        };

        let boundary = session_events
            .iter()
            .rev()
            .find(|envelope| matches!(envelope.event, StreamEvent::UserMessage { .. }))
            .map_or(0, |envelope| envelope.seq);

        Ok(session_events
            .iter()
            .filter(|envelope| envelope.seq > boundary)
            .cloned()
            .collect())
    }

    async fn latest_sequences(&self) -> Result<HashMap<SessionId, u64>, EventStoreError> {
        let events = self
            .events
            .read()
            .map_err(|_| EventStoreError::lock_poisoned("events"))?;
        Ok(events
            .iter()
            .filter_map(|(id, e)| e.iter().map(|envelope| envelope.seq).max().map(|s| (*id, s)))
            .collect())
    }

    async fn delete_session(&self, session_id: SessionId) -> Result<(), EventStoreError> {
        let mut events = self
            .events
            .write()
            .map_err(|_| EventStoreError::lock_poisoned("events"))?;
        events.remove(&session_id);
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, EventStoreError> {
        let mut events = self
            .events
            .write()
            .map_err(|_| EventStoreError::lock_poisoned("events"))?;
        let mut removed = 0;
        for session_events in events.values_mut() {
            let before = session_events.len();
            session_events.retain(|envelope| envelope.ts >= cutoff);
            removed += (before - session_events.len()) as u64;
        }
        Ok(removed)
    }
}
