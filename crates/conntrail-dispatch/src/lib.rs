//! # conntrail-dispatch
//!
//! Delivery half of the pipeline. A [`Dispatcher`] owns one bounded queue and
//! one worker task per sink, so a stalled sink only ever loses its own oldest
//! events.
//!
//! Retry, backoff, and timeouts live in the worker. Adapters in [`sinks`]
//! translate a record and perform a single I/O attempt.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod dispatcher;
pub mod error;
pub mod queue;
pub mod rate_limit;
pub mod sink;
pub mod sinks;
pub mod worker;

pub use dispatcher::{DispatchHandle, Dispatcher, SinkReport};
pub use sink::{DeliveryOutcome, Sink};
