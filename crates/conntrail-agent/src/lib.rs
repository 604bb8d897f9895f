//! # conntrail-agent
//!
//! Orchestrates a running agent. The [`Agent`] opens the conntrack source,
//! builds the configured sinks, and runs the [`Pipeline`] on a blocking thread
//! that feeds the dispatcher until shutdown.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod agent;
pub mod error;
pub mod pipeline;
pub mod snapshot;

pub use agent::{Agent, AgentReport};
pub use error::AgentError;
pub use pipeline::{Pipeline, PipelineCounters};
