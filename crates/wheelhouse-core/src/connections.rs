//! Live client connection tracking and fan-out.
//!
//! The registry holds non-owning handles to whatever transport the server
//! layer uses (WebSockets in practice). Delivery is concurrent per
//! connection with a bounded timeout; anything that fails to accept a send
//! or a liveness probe is evicted without disturbing its peers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use wheelhouse_protocol::{ConnectionId, SessionId};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Transport not ready")]
    NotReady,

    #[error("Connection closed")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Send timed out")]
    Timeout,
}

/// A live transport handle. Implemented by the (out-of-scope) WS layer;
/// tests provide fakes.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Whether the transport is in a state that can accept a send at all.
    fn is_ready(&self) -> bool;

    async fn send(&self, message: &str) -> Result<(), ConnectionError>;

    /// Lightweight liveness probe.
    async fn ping(&self) -> Result<(), ConnectionError>;
}

/// Tracks which connections belong to which session and fans messages out.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<SessionId, Vec<Arc<dyn ClientConnection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: SessionId, conn: Arc<dyn ClientConnection>) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.entry(session_id).or_default().push(conn);
    }

    /// Removing a connection that is already gone is a no-op.
    pub fn unregister(&self, session_id: SessionId, conn_id: ConnectionId) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = connections.get_mut(&session_id) {
            list.retain(|conn| conn.id() != conn_id);
            if list.is_empty() {
                connections.remove(&session_id);
            }
        }
    }

    pub fn has_connections(&self, session_id: SessionId) -> bool {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections
            .get(&session_id)
            .is_some_and(|list| !list.is_empty())
    }

    pub fn connection_count(&self, session_id: SessionId) -> usize {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.get(&session_id).map_or(0, Vec::len)
    }

    fn snapshot(&self, session_id: SessionId) -> Vec<Arc<dyn ClientConnection>> {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.get(&session_id).cloned().unwrap_or_default()
    }

    fn evict(&self, session_id: SessionId, dead: &[ConnectionId]) {
        if dead.is_empty() {
            return;
        }
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = connections.get_mut(&session_id) {
            list.retain(|conn| !dead.contains(&conn.id()));
            if list.is_empty() {
                connections.remove(&session_id);
            }
        }
    }

    /// Deliver an already-serialized message to every connection for a
    /// session. Returns the number of successful deliveries; failures are
    /// evicted, not reported.
    pub async fn broadcast(&self, session_id: SessionId, message: &str) -> usize {
        let targets = self.snapshot(session_id);
        if targets.is_empty() {
            return 0;
        }

        let sends = targets.iter().map(|conn| async move {
            if !conn.is_ready() {
                return (conn.id(), Err(ConnectionError::NotReady));
            }
            match tokio::time::timeout(SEND_TIMEOUT, conn.send(message)).await {
                Ok(result) => (conn.id(), result),
                Err(_) => (conn.id(), Err(ConnectionError::Timeout)),
            }
        });

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (conn_id, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(
                        session_id = %session_id,
                        connection_id = %conn_id,
                        error = %e,
                        "Evicting dead connection"
                    );
                    dead.push(conn_id);
                }
            }
        }

        self.evict(session_id, &dead);
        delivered
    }

    /// One liveness pass over every registered connection.
    pub async fn probe_all(&self) {
        let sessions: Vec<SessionId> = {
            let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.keys().copied().collect()
        };

        for session_id in sessions {
            let targets = self.snapshot(session_id);
            let probes = targets.iter().map(|conn| async move {
                if !conn.is_ready() {
                    return (conn.id(), Err(ConnectionError::NotReady));
                }
                match tokio::time::timeout(SEND_TIMEOUT, conn.ping()).await {
                    Ok(result) => (conn.id(), result),
                    Err(_) => (conn.id(), Err(ConnectionError::Timeout)),
                }
            });

            let dead: Vec<ConnectionId> = join_all(probes)
                .await
                .into_iter()
                .filter_map(|(conn_id, result)| result.is_err().then_some(conn_id))
                .collect();

            if !dead.is_empty() {
                tracing::debug!(
                    session_id = %session_id,
                    evicted = dead.len(),
                    "Heartbeat evicted unresponsive connections"
                );
                self.evict(session_id, &dead);
            }
        }
    }

    /// Spawn the periodic liveness loop. Runs until the token is cancelled.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => registry.probe_all().await,
                }
            }
        })
    }
}
