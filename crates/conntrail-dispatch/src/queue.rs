//! Bounded drop-oldest queue feeding one sink worker.
//!
//! Pushing never blocks, so the ingestion thread can hand records over
//! without waiting on any sink. When full, the oldest buffered record is
//! discarded to make room.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use conntrail_common::record::EventRecord;
use tokio::sync::Notify;

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Buffered without loss.
    Queued,
    /// Buffered after discarding the oldest record.
    DroppedOldest,
    /// The queue is closed; the record was discarded.
    Closed,
}

#[derive(Debug, Default)]
struct State {
    items: VecDeque<Arc<EventRecord>>,
    closed: bool,
}

/// Single-consumer queue with a fixed capacity.
#[derive(Debug)]
pub struct SinkQueue {
    state: Mutex<State>,
    available: Notify,
    capacity: usize,
}

impl SinkQueue {
    /// Creates a queue holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffers a record without blocking.
    pub fn push(&self, record: Arc<EventRecord>) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            let outcome = if state.items.len() >= self.capacity {
                let _ = state.items.pop_front();
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            state.items.push_back(record);
            outcome
        };
        self.available.notify_one();
        outcome
    }

    /// Waits for the next record. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<Arc<EventRecord>> {
        loop {
            let notified = self.available.notified();
            {
                let mut state = self.lock();
                if let Some(record) = state.items.pop_front() {
                    return Some(record);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops accepting records. Buffered records can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_one();
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Returns whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered records.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Records for queue, worker, and sink tests.

    use chrono::{TimeZone, Utc};
    use conntrail_common::record::EventRecord;
    use conntrail_common::types::{ConnectionEvent, ConnectionTuple, CorrelationHash, Phase, Protocol};
    use uuid::Uuid;

    /// A TCP record with the given source port and phase.
    pub fn record(source_port: u16, phase: Phase) -> EventRecord {
        let event = ConnectionEvent {
            tuple: ConnectionTuple {
                protocol: Protocol::Tcp,
                source_address: "172.16.144.102".parse().unwrap(),
                source_port,
                destination_address: "104.197.3.80".parse().unwrap(),
                destination_port: 80,
            },
            phase,
            kernel_inode: None,
            correlation_hash: CorrelationHash::new(u64::from(source_port)),
            connection_id: Uuid::new_v4(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            observed_at: std::time::Instant::now(),
            attribution: None,
        };
        EventRecord::from_event(&event, Uuid::nil())
    }
}
