//! Lifecycle event stream: a bounded ring buffer plus a broadcast fan-out.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the in-memory event ring; oldest events are dropped first.
pub const EVENT_LOG_CAPACITY: usize = 1_000;

/// One emitted lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    RequestQueued {
        request_id: String,
        timestamp: u64,
    },
    PrefillStarted {
        request_id: String,
        worker_id: String,
        timestamp: u64,
    },
    PrefillCompleted {
        request_id: String,
        worker_id: String,
        latency_ms: u64,
        timestamp: u64,
    },
    TransferStarted {
        request_id: String,
        from: String,
        to: String,
        timestamp: u64,
    },
    TransferCompleted {
        request_id: String,
        duration_ms: u64,
        timestamp: u64,
    },
    DecodeStarted {
        request_id: String,
        worker_id: String,
        timestamp: u64,
    },
    DecodeCompleted {
        request_id: String,
        worker_id: String,
        latency_ms: u64,
        timestamp: u64,
    },
    RequestCompleted {
        request_id: String,
        total_latency_ms: u64,
        timestamp: u64,
    },
    RequestFailed {
        request_id: String,
        error: String,
        timestamp: u64,
    },
    WorkerOnline {
        worker_id: String,
        role: String,
        timestamp: u64,
    },
    WorkerOffline {
        worker_id: String,
        timestamp: u64,
    },
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Bounded ring of recently emitted events, with an optional broadcast tap
/// for observers that want to react as events happen rather than poll.
///
/// A lagging subscriber on the broadcast channel only misses old events —
/// it never blocks `emit`, which must stay on the hot path of every pipeline.
pub struct EventLog {
    ring: Mutex<VecDeque<Event>>,
    tx: broadcast::Sender<Event>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_LOG_CAPACITY);
        Self {
            ring: Mutex::new(VecDeque::with_capacity(EVENT_LOG_CAPACITY)),
            tx,
        }
    }

    /// Append to the ring (evicting the oldest entry past capacity) and
    /// notify any subscribers. Subscriber lag is not an error.
    pub fn emit(&self, event: Event) {
        let mut ring = self.ring.lock();
        if ring.len() == EVENT_LOG_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(event.clone());
        drop(ring);
        let _ = self.tx.send(event);
    }

    /// The newest `limit` events, most recent last.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let ring = self.ring.lock();
        ring.iter().rev().take(limit).rev().cloned().collect()
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let log = EventLog::new();
        for i in 0..(EVENT_LOG_CAPACITY + 10) {
            log.emit(Event::RequestQueued {
                request_id: i.to_string(),
                timestamp: i as u64,
            });
        }
        let recent = log.recent(EVENT_LOG_CAPACITY);
        assert_eq!(recent.len(), EVENT_LOG_CAPACITY);
        match &recent[0] {
            Event::RequestQueued { request_id, .. } => assert_eq!(request_id, "10"),
            _ => panic!("wrong event"),
        }
    }

    #[test]
    fn recent_returns_newest_last() {
        let log = EventLog::new();
        log.emit(Event::RequestQueued {
            request_id: "a".into(),
            timestamp: 0,
        });
        log.emit(Event::RequestQueued {
            request_id: "b".into(),
            timestamp: 1,
        });
        let recent = log.recent(50);
        match recent.last().unwrap() {
            Event::RequestQueued { request_id, .. } => assert_eq!(request_id, "b"),
            _ => panic!("wrong event"),
        }
    }
}
