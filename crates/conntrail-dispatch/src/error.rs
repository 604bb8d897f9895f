//! Sink construction errors.
//!
//! Delivery failures are not errors: they surface as
//! [`DeliveryOutcome`](crate::DeliveryOutcome) values inside the worker.

use std::path::PathBuf;

use thiserror::Error;

/// A sink could not be constructed.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The local syslog socket is unreachable.
    #[error("cannot reach syslog socket {path}: {source}")]
    SyslogSocket {
        /// Path of the unix socket.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A network socket could not be prepared.
    #[error("cannot prepare socket for {sink}: {source}")]
    Socket {
        /// Sink name.
        sink: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A sink URL does not parse.
    #[error("invalid url {url}: {message}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Parser message.
        message: String,
    },

    /// The HTTP client could not be built.
    #[error("failed to build http client: {source}")]
    HttpClient {
        /// Underlying reqwest error.
        #[from]
        source: reqwest::Error,
    },
}

/// Convenience alias for sink construction.
pub type Result<T> = std::result::Result<T, SinkError>;
