//! Per-session sequence number issuance.
//!
//! Counters live in memory and are persisted implicitly through the events
//! already written to the durable store; [`Sequencer::restore`] seeds them at
//! startup so a restart never reuses a number.

use std::collections::HashMap;
use std::sync::Mutex;

use wheelhouse_protocol::SessionId;

/// Issues strictly increasing, session-scoped sequence numbers starting at 1.
///
/// Purely in-memory arithmetic; the mutex is never held across an await
/// point, so concurrent turns on different sessions do not contend in any
/// observable way.
#[derive(Debug, Default)]
pub struct Sequencer {
    counters: Mutex<HashMap<SessionId, u64>>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next sequence number for a session. The first-ever call for
    /// a session returns 1.
    pub fn next(&self, session_id: SessionId) -> u64 {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters.entry(session_id).or_insert(0);
        *counter += 1;
        *counter
    }

    /// The last-issued value for a session, 0 if none was ever issued.
    pub fn latest(&self, session_id: SessionId) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(&session_id).copied().unwrap_or(0)
    }

    /// Seed counters from the durable store's max sequence per session.
    ///
    /// Must run once at startup, before any event is broadcast. A counter
    /// already ahead of the durable value is left alone so a racing restore
    /// can never move issuance backwards.
    pub fn restore(&self, all_max_seq: HashMap<SessionId, u64>) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        for (session_id, max_seq) in all_max_seq {
            let counter = counters.entry(session_id).or_insert(0);
            if *counter < max_seq {
                *counter = max_seq;
            }
        }
    }

    /// Drop the counter for a deleted session.
    pub fn forget(&self, session_id: SessionId) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.remove(&session_id);
    }
}
