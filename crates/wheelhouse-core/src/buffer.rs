//! Per-session event buffering: a bounded in-memory ring for fast reconnect
//! service, plus a best-effort durable copy flushed in batches off the hot
//! path.
//!
//! The ring is authoritative for recent events. The durable store may lag by
//! one flush interval but eventually holds everything; a write failure drops
//! the batch with a log line and is never surfaced to callers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use wheelhouse_protocol::{EventEnvelope, SessionId, StreamEvent};

use crate::sequencer::Sequencer;
use crate::store::EventStore;

/// Tuning knobs for the event log.
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Most recent events kept in memory per session.
    pub ring_capacity: usize,

    /// How often the background task drains the pending-write queue.
    pub flush_interval: Duration,

    /// Bound on the pending-write queue. When full, new durable writes are
    /// dropped (the ring still holds the event).
    pub write_queue_capacity: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1000,
            flush_interval: Duration::from_millis(500),
            write_queue_capacity: 4096,
        }
    }
}

enum FlushCmd {
    Write(SessionId, EventEnvelope),
    Flush(oneshot::Sender<()>),
}

/// Owns the per-session rings and the durable-write pipeline.
pub struct EventLog {
    rings: Mutex<HashMap<SessionId, VecDeque<EventEnvelope>>>,
    sequencer: Arc<Sequencer>,
    store: Arc<dyn EventStore>,
    write_tx: mpsc::Sender<FlushCmd>,
    ring_capacity: usize,
}

impl EventLog {
    /// Create the log and spawn its background flusher task. The task exits
    /// once the log is dropped, after a final drain.
    pub fn new(
        sequencer: Arc<Sequencer>,
        store: Arc<dyn EventStore>,
        config: EventLogConfig,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::channel(config.write_queue_capacity);

        tokio::spawn(flusher_loop(
            Arc::clone(&store),
            write_rx,
            config.flush_interval,
        ));

        Self {
            rings: Mutex::new(HashMap::new()),
            sequencer,
            store,
            write_tx,
            ring_capacity: config.ring_capacity,
        }
    }

    /// Stamp an event with the next sequence number, insert it into the ring,
    /// and enqueue its durable write. Never blocks on I/O.
    pub fn append(&self, session_id: SessionId, event: StreamEvent) -> EventEnvelope {
        let seq = self.sequencer.next(session_id);
        let envelope = EventEnvelope::new(seq, event);

        {
            let mut rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
            let ring = rings.entry(session_id).or_default();
            if ring.len() >= self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(envelope.clone());
        }

        if let Err(mpsc::error::TrySendError::Full(_)) = self
            .write_tx
            .try_send(FlushCmd::Write(session_id, envelope.clone()))
        {
            tracing::warn!(
                session_id = %session_id,
                seq = envelope.seq,
                "Durable write queue full, dropping event from durable log"
            );
        }

        envelope
    }

    /// Force an immediate drain of the pending-write queue. Must be called
    /// before [`EventLog::clear`] so no event is lost with the ring.
    pub async fn flush_now(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.write_tx.send(FlushCmd::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// All buffered events with `seq > after_seq`. Falls back to durable
    /// storage when the ring cannot prove the range contiguous.
    pub async fn events_after(
        &self,
        session_id: SessionId,
        after_seq: u64,
    ) -> Result<Vec<EventEnvelope>, crate::store::EventStoreError> {
        {
            let rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(ring) = rings.get(&session_id)
                && let Some(oldest) = ring.front()
                && oldest.seq <= after_seq + 1
            {
                return Ok(ring
                    .iter()
                    .filter(|envelope| envelope.seq > after_seq)
                    .cloned()
                    .collect());
            }
        }

        self.store.events_after(session_id, after_seq).await
    }

    /// All buffered events after the most recent `user_message`, with the
    /// same durable fallback rule as [`EventLog::events_after`].
    pub async fn current_turn_events(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<EventEnvelope>, crate::store::EventStoreError> {
        {
            let rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(ring) = rings.get(&session_id)
                && !ring.is_empty()
            {
                let boundary = ring
                    .iter()
                    .rev()
                    .find(|envelope| matches!(envelope.event, StreamEvent::UserMessage { .. }))
                    .map(|envelope| envelope.seq);

                // Without a boundary in the ring, the ring is only
                // trustworthy if it still starts at the very first event.
                let oldest_seq = ring.front().map_or(0, |e| e.seq);
                if let Some(boundary) = boundary {
                    return Ok(ring
                        .iter()
                        .filter(|envelope| envelope.seq > boundary)
                        .cloned()
                        .collect());
                } else if oldest_seq <= 1 {
                    return Ok(ring.iter().cloned().collect());
                }
            }
        }

        self.store.current_turn_events(session_id).await
    }

    /// A snapshot of the ring, oldest first. Used by the activity deriver.
    pub fn buffered(&self, session_id: SessionId) -> Vec<EventEnvelope> {
        let rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        rings
            .get(&session_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the in-memory ring only; the durable copy is untouched.
    pub fn clear(&self, session_id: SessionId) {
        let mut rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        rings.remove(&session_id);
    }

    /// Durable retention sweep, independent of any in-memory state.
    pub async fn cleanup_older_than(
        &self,
        age: Duration,
    ) -> Result<u64, crate::store::EventStoreError> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::hours(24));
        self.store.delete_older_than(cutoff).await
    }
}

async fn flusher_loop(
    store: Arc<dyn EventStore>,
    mut write_rx: mpsc::Receiver<FlushCmd>,
    flush_interval: Duration,
) {
    let mut pending: Vec<(SessionId, EventEnvelope)> = Vec::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = write_rx.recv() => {
                match cmd {
                    Some(FlushCmd::Write(session_id, envelope)) => {
                        pending.push((session_id, envelope));
                    }
                    Some(FlushCmd::Flush(ack)) => {
                        drain(&store, &mut pending).await;
                        let _ = ack.send(());
                    }
                    None => {
                        drain(&store, &mut pending).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                drain(&store, &mut pending).await;
            }
        }
    }
}

async fn drain(store: &Arc<dyn EventStore>, pending: &mut Vec<(SessionId, EventEnvelope)>) {
    if pending.is_empty() {
        return;
    }

    let batch = std::mem::take(pending);
    if let Err(e) = store.append_batch(&batch).await {
        // Best-effort durability: the batch is dropped, the ring remains
        // the fast path for recently-connected clients.
        tracing::error!(
            batch_len = batch.len(),
            error = %e,
            "Failed to flush event batch to durable storage, dropping batch"
        );
    }
}
