//! The adapter contract every output destination implements.

use async_trait::async_trait;
use conntrail_common::record::EventRecord;

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The backend accepted the record.
    Delivered,
    /// A transient failure; the worker may try again after a backoff.
    RetryLater,
    /// The backend rejected the record; trying again cannot help.
    DropPermanent,
}

/// An output destination.
///
/// Implementations perform exactly one I/O attempt per call and never sleep
/// or retry on their own; the owning worker applies timeouts and backoff.
#[async_trait]
pub trait Sink: Send {
    /// Name used in logs and statistics.
    fn name(&self) -> &str;

    /// Attempts to deliver one record.
    async fn deliver(&mut self, record: &EventRecord) -> DeliveryOutcome;

    /// Releases connections and sockets. Called once, after the last delivery.
    async fn close(&mut self);
}
