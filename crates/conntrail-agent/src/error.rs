//! Errors that stop the agent.

use conntrail_common::error::ConntrailError;
use conntrail_track::error::SourceError;
use thiserror::Error;

/// Fatal agent failures.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The conntrack source failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// None of the configured sinks could be built.
    #[error("no usable sink: all {configured} configured sinks failed to start")]
    NoSinks {
        /// Number of sinks in the configuration.
        configured: usize,
    },

    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConntrailError),

    /// The ingestion thread stopped abnormally.
    #[error("ingestion thread failed: {message}")]
    Ingestion {
        /// Description of the failure.
        message: String,
    },
}

/// Convenience alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
