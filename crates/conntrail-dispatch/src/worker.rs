//! Per-sink delivery loop.
//!
//! A worker pops records from its [`SinkQueue`], wraps every attempt in the
//! delivery timeout, and retries transient failures with exponential backoff.
//! Once shutdown is signalled the worker still drains its queue, but a failed
//! attempt is no longer retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use conntrail_common::config::DispatchConfig;
use conntrail_common::record::EventRecord;
use serde::Serialize;
use tokio::sync::watch;

use crate::queue::SinkQueue;
use crate::rate_limit::WarnLimiter;
use crate::sink::{DeliveryOutcome, Sink};

/// Delivery counters for one sink.
#[derive(Debug, Default)]
pub struct SinkStats {
    delivered: AtomicU64,
    retried: AtomicU64,
    dropped_oldest: AtomicU64,
    dropped_permanent: AtomicU64,
}

/// Point-in-time copy of [`SinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStatsSnapshot {
    /// Records accepted by the sink.
    pub delivered: u64,
    /// Attempts repeated after a transient failure.
    pub retried: u64,
    /// Records evicted from a full queue.
    pub dropped_oldest: u64,
    /// Records given up on after rejection or exhausted retries.
    pub dropped_permanent: u64,
}

impl SinkStats {
    /// Counts a record evicted from a full queue.
    pub fn record_dropped_oldest(&self) {
        let _ = self.dropped_oldest.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current counters.
    pub fn snapshot(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped_oldest: self.dropped_oldest.load(Ordering::Relaxed),
            dropped_permanent: self.dropped_permanent.load(Ordering::Relaxed),
        }
    }
}

/// Drives one sink from its queue.
pub struct SinkWorker {
    sink: Box<dyn Sink>,
    queue: Arc<SinkQueue>,
    stats: Arc<SinkStats>,
    config: DispatchConfig,
    shutdown: watch::Receiver<bool>,
    warnings: WarnLimiter,
}

impl SinkWorker {
    /// Creates a worker.
    pub fn new(
        sink: Box<dyn Sink>,
        queue: Arc<SinkQueue>,
        stats: Arc<SinkStats>,
        config: DispatchConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let warnings = WarnLimiter::new(config.warn_interval());
        Self {
            sink,
            queue,
            stats,
            config,
            shutdown,
            warnings,
        }
    }

    /// Delivers records until the queue is closed and drained, then closes
    /// the sink.
    pub async fn run(mut self) {
        tracing::debug!(sink = self.sink.name(), "sink worker started");
        while let Some(record) = self.queue.pop().await {
            self.deliver(&record).await;
        }
        self.sink.close().await;
        tracing::debug!(sink = self.sink.name(), "sink worker stopped");
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn attempt(&mut self, record: &EventRecord) -> DeliveryOutcome {
        let timeout = self.config.delivery_timeout();
        tokio::time::timeout(timeout, self.sink.deliver(record))
            .await
            .unwrap_or(DeliveryOutcome::RetryLater)
    }

    async fn deliver(&mut self, record: &EventRecord) {
        let mut retries = 0;
        loop {
            match self.attempt(record).await {
                DeliveryOutcome::Delivered => {
                    let _ = self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                DeliveryOutcome::DropPermanent => {
                    self.give_up(record, "rejected by sink");
                    return;
                }
                DeliveryOutcome::RetryLater => {
                    if self.shutting_down() {
                        self.give_up(record, "not retried during shutdown");
                        return;
                    }
                    if retries >= self.config.max_retries {
                        self.give_up(record, "retries exhausted");
                        return;
                    }
                    let delay = self.config.backoff_for_attempt(retries);
                    retries += 1;
                    let _ = self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        sink = self.sink.name(),
                        attempt = retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "delivery failed, will retry after delay"
                    );
                    let interrupted = tokio::select! {
                        () = tokio::time::sleep(delay) => false,
                        _ = self.shutdown.wait_for(|stop| *stop) => true,
                    };
                    if interrupted {
                        self.give_up(record, "not retried during shutdown");
                        return;
                    }
                }
            }
        }
    }

    fn give_up(&mut self, record: &EventRecord, reason: &str) {
        let _ = self.stats.dropped_permanent.fetch_add(1, Ordering::Relaxed);
        if let Some(suppressed) = self.warnings.check(Instant::now()) {
            tracing::warn!(
                sink = self.sink.name(),
                reason,
                uuid = %record.uuid,
                suppressed,
                "dropping event"
            );
        }
    }
}
