//! Errors raised by the conntrack source.
//!
//! Resolution and filtering never fail; only the source can end ingestion.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal conditions of the conntrack source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The conntrack table is missing or unreadable at startup.
    #[error(
        "connection tracking is unavailable at {path} (is nf_conntrack loaded and CAP_NET_ADMIN granted?): {source}"
    )]
    FacilityUnavailable {
        /// Path of the conntrack table.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Reads kept failing past the tolerated number of attempts.
    #[error("conntrack table {path} failed {failures} consecutive reads: {source}")]
    Sustained {
        /// Path of the conntrack table.
        path: PathBuf,
        /// Number of consecutive failures.
        failures: u32,
        /// Last I/O error.
        source: std::io::Error,
    },
}
