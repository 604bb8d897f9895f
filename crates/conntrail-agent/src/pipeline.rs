//! Per-event processing on the ingestion thread.
//!
//! Source → resolver → correlator → filter → dispatch, all inline. Only the
//! final hand-off crosses a thread boundary, through non-blocking queues.

use std::time::Instant;

use chrono::Utc;
use conntrail_common::config::AgentConfig;
use conntrail_common::record::EventRecord;
use conntrail_common::types::Phase;
use conntrail_dispatch::DispatchHandle;
use conntrail_track::correlator::{Correlated, Correlator};
use conntrail_track::error::SourceError;
use conntrail_track::filter::{DropReason, FilterContext, FilterEngine, Verdict};
use conntrail_track::resolver::{ProcessResolver, Resolution};
use conntrail_track::source::RawConnection;
use serde::Serialize;
use uuid::Uuid;

/// What happened to the transitions the pipeline saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineCounters {
    /// Events handed to the dispatcher.
    pub emitted: u64,
    /// OPEN events emitted without an owning process.
    pub unattributed: u64,
    /// Repeated OPENs discarded.
    pub duplicates: u64,
    /// Events dropped by the non-process rule.
    pub dropped_non_process: u64,
    /// Events dropped by the DNS rule.
    pub dropped_dns: u64,
    /// Events dropped by the self-traffic rule.
    pub dropped_self: u64,
    /// CLOSEs suppressed because their OPEN was dropped.
    pub suppressed_closes: u64,
}

impl PipelineCounters {
    fn count_drop(&mut self, reason: DropReason) {
        match reason {
            DropReason::NonProcess => self.dropped_non_process += 1,
            DropReason::Dns => self.dropped_dns += 1,
            DropReason::SelfTraffic => self.dropped_self += 1,
        }
    }
}

/// Ingestion-thread state: resolver caches, the correlator map, and the filter.
#[derive(Debug)]
pub struct Pipeline {
    resolver: ProcessResolver,
    correlator: Correlator,
    filter: FilterEngine,
    agent: Uuid,
    counters: PipelineCounters,
}

impl Pipeline {
    /// Builds the pipeline for `config` with an injected filter context.
    pub fn new(config: &AgentConfig, context: FilterContext) -> Self {
        Self {
            resolver: ProcessResolver::new(config.resolver_proc_root(), config.resolver.clone()),
            correlator: Correlator::new(&config.correlator),
            filter: FilterEngine::new(config.filters, context),
            agent: config.agent.uuid,
            counters: PipelineCounters::default(),
        }
    }

    /// Turns one raw transition into a record, or `None` when it is a
    /// duplicate or filtered out.
    pub fn process(&mut self, raw: RawConnection) -> Option<EventRecord> {
        let resolution = match raw.phase {
            Phase::Open => self.resolver.resolve_tuple(&raw.tuple),
            Phase::Close => Resolution::unresolved(),
        };
        let (event, paired) = match self.correlator.correlate(raw, resolution, Utc::now(), Instant::now()) {
            Correlated::Event(event) => (event, false),
            Correlated::PairedClose(event) => (event, true),
            Correlated::DuplicateOpen(hash) => {
                self.counters.duplicates += 1;
                tracing::trace!(%hash, "duplicate open");
                return None;
            }
            Correlated::SuppressedClose(hash) => {
                self.counters.suppressed_closes += 1;
                tracing::trace!(%hash, "close of a filtered connection");
                return None;
            }
        };

        // A CLOSE whose OPEN went out is always kept.
        let verdict = if paired {
            Verdict::Keep
        } else {
            self.filter.evaluate(&event)
        };
        if let Verdict::Drop(reason) = verdict {
            if event.is_open() {
                self.correlator.mark_suppressed(event.correlation_hash);
            }
            self.counters.count_drop(reason);
            tracing::trace!(tuple = %event.tuple, %reason, phase = %event.phase, "event filtered");
            return None;
        }

        if event.is_open() && event.attribution.is_none() {
            self.counters.unattributed += 1;
        }
        self.counters.emitted += 1;
        tracing::debug!(
            tuple = %event.tuple,
            phase = %event.phase,
            hash = %event.correlation_hash,
            pid = event.attribution.as_ref().map(|a| a.pid),
            "connection event"
        );
        Some(EventRecord::from_event(&event, self.agent))
    }

    /// Drains `source` into `dispatch` until it ends.
    ///
    /// # Errors
    ///
    /// Returns the source's fatal error, if it ended with one.
    pub fn run<I>(mut self, source: I, dispatch: &DispatchHandle) -> Result<PipelineCounters, SourceError>
    where
        I: IntoIterator<Item = Result<RawConnection, SourceError>>,
    {
        for item in source {
            let raw = item?;
            if let Some(record) = self.process(raw) {
                dispatch.dispatch(record);
            }
        }
        Ok(self.counters)
    }

    /// Counters so far.
    pub const fn counters(&self) -> PipelineCounters {
        self.counters
    }
}
