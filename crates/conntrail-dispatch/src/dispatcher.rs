//! Fan-out supervisor.
//!
//! The [`Dispatcher`] spawns one [`SinkWorker`] per sink and hands out
//! [`DispatchHandle`]s that the ingestion thread uses to enqueue records.
//! Enqueueing never blocks and never waits on a sink.

use std::sync::Arc;

use conntrail_common::config::DispatchConfig;
use conntrail_common::record::EventRecord;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::queue::{PushOutcome, SinkQueue};
use crate::sink::Sink;
use crate::worker::{SinkStats, SinkStatsSnapshot, SinkWorker};

#[derive(Debug)]
struct Lane {
    name: String,
    queue: Arc<SinkQueue>,
    stats: Arc<SinkStats>,
}

/// Cloneable, thread-safe entry point for enqueueing records.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    lanes: Arc<[Lane]>,
}

impl DispatchHandle {
    /// Enqueues `record` for every sink. A full queue discards its own oldest
    /// record; other sinks are unaffected.
    pub fn dispatch(&self, record: EventRecord) {
        let record = Arc::new(record);
        for lane in self.lanes.iter() {
            match lane.queue.push(Arc::clone(&record)) {
                PushOutcome::Queued | PushOutcome::Closed => {}
                PushOutcome::DroppedOldest => {
                    lane.stats.record_dropped_oldest();
                    tracing::trace!(sink = %lane.name, "queue full, dropped oldest event");
                }
            }
        }
    }

    /// Number of sinks fed by this handle.
    pub fn sink_count(&self) -> usize {
        self.lanes.len()
    }
}

/// Final state of one sink after shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkReport {
    /// Sink name.
    pub name: String,
    /// Delivery counters.
    pub stats: SinkStatsSnapshot,
    /// Records still buffered when the worker stopped.
    pub abandoned: usize,
}

/// Supervisor owning the per-sink workers.
#[derive(Debug)]
pub struct Dispatcher {
    handle: DispatchHandle,
    workers: JoinSet<()>,
    shutdown: watch::Sender<bool>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Spawns one worker per sink on the current tokio runtime.
    pub fn spawn(sinks: Vec<Box<dyn Sink>>, config: &DispatchConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut workers = JoinSet::new();
        let mut lanes = Vec::with_capacity(sinks.len());
        for sink in sinks {
            let lane = Lane {
                name: sink.name().to_string(),
                queue: Arc::new(SinkQueue::new(config.queue_capacity)),
                stats: Arc::new(SinkStats::default()),
            };
            let worker = SinkWorker::new(
                sink,
                Arc::clone(&lane.queue),
                Arc::clone(&lane.stats),
                config.clone(),
                shutdown_rx.clone(),
            );
            let _ = workers.spawn(worker.run());
            tracing::info!(sink = %lane.name, capacity = lane.queue.capacity(), "sink worker spawned");
            lanes.push(lane);
        }
        Self {
            handle: DispatchHandle { lanes: lanes.into() },
            workers,
            shutdown,
            config: config.clone(),
        }
    }

    /// Returns a handle for enqueueing records.
    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Current counters for every sink.
    pub fn stats(&self) -> Vec<(String, SinkStatsSnapshot)> {
        self.handle
            .lanes
            .iter()
            .map(|lane| (lane.name.clone(), lane.stats.snapshot()))
            .collect()
    }

    /// Stops accepting records, lets workers drain for the grace period
    /// without retries, then aborts whatever is left.
    pub async fn shutdown(mut self) -> Vec<SinkReport> {
        let _ = self.shutdown.send(true);
        for lane in self.handle.lanes.iter() {
            lane.queue.close();
        }

        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while self.workers.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            tracing::warn!(
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "sink workers did not drain in time, aborting"
            );
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }

        self.handle
            .lanes
            .iter()
            .map(|lane| {
                let report = SinkReport {
                    name: lane.name.clone(),
                    stats: lane.stats.snapshot(),
                    abandoned: lane.queue.len(),
                };
                tracing::info!(
                    sink = %report.name,
                    delivered = report.stats.delivered,
                    retried = report.stats.retried,
                    dropped_oldest = report.stats.dropped_oldest,
                    dropped_permanent = report.stats.dropped_permanent,
                    abandoned = report.abandoned,
                    "sink stopped"
                );
                report
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use conntrail_common::types::Phase;

    use super::*;
    use crate::queue::fixtures::record;
    use crate::sink::DeliveryOutcome;
    use crate::worker::fixtures::{BlockedSink, ScriptedSink};

    fn config(queue_capacity: usize) -> DispatchConfig {
        DispatchConfig {
            queue_capacity,
            delivery_timeout_ms: 10_000,
            shutdown_grace_ms: 200,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            ..DispatchConfig::default()
        }
    }

    #[tokio::test]
    async fn blocked_sink_does_not_hold_back_healthy_sink() {
        let healthy = ScriptedSink::new("syslog-local", &[]);
        let delivered = Arc::clone(&healthy.delivered);
        let dispatcher = Dispatcher::spawn(vec![Box::new(BlockedSink), Box::new(healthy)], &config(4));
        let handle = dispatcher.handle();

        for port in 0..100 {
            handle.dispatch(record(port, Phase::Open));
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(delivered.lock().unwrap().len(), 100);

        let stats = dispatcher.stats();
        let blocked = &stats[0].1;
        // One record is in flight; the queue holds at most four more.
        assert_eq!(blocked.dropped_oldest, 100 - 1 - 4);
        assert_eq!(stats[1].1.dropped_oldest, 0);

        let reports = dispatcher.shutdown().await;
        assert_eq!(reports.len(), 2);
        assert!(reports[0].abandoned <= 4);
        assert_eq!(reports[1].stats.delivered, 100);
    }

    #[tokio::test]
    async fn shutdown_drains_buffered_records() {
        let sink = ScriptedSink::new("custom-endpoint", &[]);
        let delivered = Arc::clone(&sink.delivered);
        let closed = Arc::clone(&sink.closed);
        let dispatcher = Dispatcher::spawn(vec![Box::new(sink)], &config(16));
        let handle = dispatcher.handle();
        handle.dispatch(record(1, Phase::Open));
        handle.dispatch(record(1, Phase::Close));

        let reports = dispatcher.shutdown().await;
        assert_eq!(*delivered.lock().unwrap(), vec![1, 1]);
        assert_eq!(reports[0].stats.delivered, 2);
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test]
    async fn shutdown_aborts_stuck_workers_after_grace() {
        let dispatcher = Dispatcher::spawn(vec![Box::new(BlockedSink)], &config(16));
        let handle = dispatcher.handle();
        handle.dispatch(record(1, Phase::Open));
        handle.dispatch(record(2, Phase::Open));
        tokio::task::yield_now().await;

        let started = std::time::Instant::now();
        let reports = dispatcher.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(reports[0].stats.delivered, 0);
        assert_eq!(reports[0].abandoned, 1);

        // Dispatching after shutdown is a no-op.
        handle.dispatch(record(3, Phase::Open));
    }

    #[tokio::test]
    async fn rejected_records_stay_per_sink() {
        let strict = ScriptedSink::new("search-index", &[DeliveryOutcome::DropPermanent]);
        let lenient = ScriptedSink::new("syslog-udp", &[]);
        let lenient_delivered = Arc::clone(&lenient.delivered);
        let dispatcher = Dispatcher::spawn(vec![Box::new(strict), Box::new(lenient)], &config(16));
        dispatcher.handle().dispatch(record(9, Phase::Open));

        let reports = dispatcher.shutdown().await;
        assert_eq!(reports[0].stats.dropped_permanent, 1);
        assert_eq!(*lenient_delivered.lock().unwrap(), vec![9]);
    }
}
