//! One-shot dump of the live conntrack table with attribution.

use std::time::Instant;

use chrono::Utc;
use conntrail_common::config::AgentConfig;
use conntrail_common::record::EventRecord;
use conntrail_common::types::Phase;
use conntrail_track::correlator::{Correlated, Correlator};
use conntrail_track::resolver::ProcessResolver;
use conntrail_track::source::{self, RawConnection};

use crate::error::Result;

/// Samples the conntrack table once and resolves every live connection.
///
/// Filters are not applied; the output shows what the agent can see.
///
/// # Errors
///
/// Returns [`crate::AgentError::Source`] if the conntrack table cannot be read.
pub fn snapshot(config: &AgentConfig) -> Result<Vec<EventRecord>> {
    let entries = source::snapshot(&config.source.proc_root)?;
    let mut resolver = ProcessResolver::new(config.resolver_proc_root(), config.resolver.clone());
    let mut correlator = Correlator::new(&config.correlator);
    let timestamp = Utc::now();

    let mut records = Vec::with_capacity(entries.len());
    for entry in entries.into_iter().filter(|e| e.live) {
        let raw = RawConnection {
            tuple: entry.tuple,
            phase: Phase::Open,
        };
        let resolution = resolver.resolve_tuple(&raw.tuple);
        if let Correlated::Event(event) = correlator.correlate(raw, resolution, timestamp, Instant::now()) {
            records.push(EventRecord::from_event(&event, config.agent.uuid));
        }
    }
    tracing::debug!(connections = records.len(), "snapshot taken");
    Ok(records)
}
