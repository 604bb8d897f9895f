//! Configuration model for the conntrail agent.
//!
//! The configuration is loaded once at startup and is read-only afterwards.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::constants;
use crate::error::{ConntrailError, Result};

/// Root configuration for the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Agent identity.
    #[serde(default)]
    pub agent: AgentIdentity,
    /// Noise suppression rules.
    #[serde(default)]
    pub filters: FilterRuleSet,
    /// Ordered list of output destinations.
    #[serde(default)]
    pub sinks: Vec<SinkTarget>,
    /// Conntrack sampling settings.
    #[serde(default)]
    pub source: SourceConfig,
    /// Process attribution settings.
    #[serde(default)]
    pub resolver: ResolverConfig,
    /// Open/close pairing settings.
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    /// Fan-out and delivery settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Identity stamped on every emitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Agent uuid; generated when the file omits it.
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    /// Human-readable agent name.
    #[serde(default = "default_agent_name")]
    pub name: String,
}

impl Default for AgentIdentity {
    fn default() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: default_agent_name(),
        }
    }
}

fn default_agent_name() -> String {
    constants::APP_NAME.to_string()
}

/// Suppression rules applied before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRuleSet {
    /// Drop unattributed events whose destination is not a unicast peer.
    pub suppress_non_process_connections: bool,
    /// Drop events on the DNS ports.
    pub suppress_dns: bool,
    /// Drop the agent's own traffic.
    pub suppress_self_traffic: bool,
}

impl Default for FilterRuleSet {
    fn default() -> Self {
        Self {
            suppress_non_process_connections: false,
            suppress_dns: false,
            suppress_self_traffic: true,
        }
    }
}

/// Kinds of sink adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Local syslog daemon over its unix socket.
    SyslogLocal,
    /// Remote syslog over TCP.
    SyslogTcp,
    /// Remote syslog over UDP.
    SyslogUdp,
    /// Search/indexing backend over HTTP.
    SearchIndex,
    /// Custom collector over HTTP.
    CustomEndpoint,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SyslogLocal => "syslog-local",
            Self::SyslogTcp => "syslog-tcp",
            Self::SyslogUdp => "syslog-udp",
            Self::SearchIndex => "search-index",
            Self::CustomEndpoint => "custom-endpoint",
        };
        f.write_str(name)
    }
}

/// A configured output destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkTarget {
    /// Local syslog daemon.
    SyslogLocal {
        /// Path of the syslog unix socket.
        #[serde(default = "default_syslog_socket")]
        path: PathBuf,
    },
    /// Remote syslog over TCP.
    SyslogTcp {
        /// Collector address.
        address: SocketAddr,
    },
    /// Remote syslog over UDP.
    SyslogUdp {
        /// Collector address.
        address: SocketAddr,
    },
    /// Search/indexing backend.
    SearchIndex {
        /// Base URL of the backend.
        url: String,
        /// Index receiving the documents.
        index: String,
    },
    /// Custom collector endpoint.
    CustomEndpoint {
        /// Base URL of the collector.
        url: String,
    },
}

fn default_syslog_socket() -> PathBuf {
    PathBuf::from(constants::SYSLOG_SOCKET)
}

impl SinkTarget {
    /// Returns the adapter kind.
    pub const fn kind(&self) -> SinkKind {
        match self {
            Self::SyslogLocal { .. } => SinkKind::SyslogLocal,
            Self::SyslogTcp { .. } => SinkKind::SyslogTcp,
            Self::SyslogUdp { .. } => SinkKind::SyslogUdp,
            Self::SearchIndex { .. } => SinkKind::SearchIndex,
            Self::CustomEndpoint { .. } => SinkKind::CustomEndpoint,
        }
    }

    /// Human-readable name used in logs, e.g. `syslog-tcp(10.0.0.5:514)`.
    pub fn display_name(&self) -> String {
        match self {
            Self::SyslogLocal { path } => format!("{}({})", self.kind(), path.display()),
            Self::SyslogTcp { address } | Self::SyslogUdp { address } => {
                format!("{}({address})", self.kind())
            }
            Self::SearchIndex { url, index } => format!("{}({url}/{index})", self.kind()),
            Self::CustomEndpoint { url } => format!("{}({url})", self.kind()),
        }
    }

    /// Returns whether delivering to this sink generates network traffic
    /// that conntrack can observe.
    pub const fn is_network_bound(&self) -> bool {
        !matches!(self, Self::SyslogLocal { .. })
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::SearchIndex { url, index } => {
                validate_url(url)?;
                if index.is_empty() || index.contains('/') {
                    return Err(ConntrailError::config(format!(
                        "search index name {index:?} must be non-empty and contain no '/'"
                    )));
                }
                Ok(())
            }
            Self::CustomEndpoint { url } => validate_url(url),
            Self::SyslogTcp { address } | Self::SyslogUdp { address } if address.port() == 0 => {
                Err(ConntrailError::config(format!(
                    "{} needs a non-zero port",
                    self.display_name()
                )))
            }
            _ => Ok(()),
        }
    }
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url).map_err(|e| ConntrailError::config(format!("url {url:?} is invalid: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConntrailError::config(format!("url {url:?} must use http or https")));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ConntrailError::config(format!("url {url:?} has no host")));
    }
    Ok(())
}

/// Conntrack sampling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Mount point of the proc filesystem.
    pub proc_root: PathBuf,
    /// Interval between two samples.
    pub poll_interval_ms: u64,
    /// Consecutive read failures before the source is declared dead.
    pub max_consecutive_failures: u32,
    /// First retry delay after a failed read.
    pub initial_backoff_ms: u64,
    /// Upper bound of the retry delay.
    pub max_backoff_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from(constants::DEFAULT_PROC_ROOT),
            poll_interval_ms: constants::DEFAULT_POLL_INTERVAL_MS,
            max_consecutive_failures: constants::DEFAULT_MAX_CONSECUTIVE_FAILURES,
            initial_backoff_ms: constants::DEFAULT_SOURCE_BACKOFF_MS,
            max_backoff_ms: constants::DEFAULT_SOURCE_MAX_BACKOFF_MS,
        }
    }
}

impl SourceConfig {
    /// Interval between two samples.
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// First retry delay after a failed read.
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Upper bound of the retry delay.
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Process attribution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Mount point of the proc filesystem; defaults to the source's.
    pub proc_root: Option<PathBuf>,
    /// Socket table re-reads while the socket still reports inode 0.
    pub socket_retry_attempts: u32,
    /// Delay between two socket table re-reads.
    pub socket_retry_delay_ms: u64,
    /// Maximum processes visited per fd scan.
    pub max_scan_processes: usize,
    /// Capacity of the inode to pid cache.
    pub pid_cache_capacity: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            proc_root: None,
            socket_retry_attempts: constants::DEFAULT_SOCKET_RETRY_ATTEMPTS,
            socket_retry_delay_ms: constants::DEFAULT_SOCKET_RETRY_DELAY_MS,
            max_scan_processes: constants::DEFAULT_MAX_SCAN_PROCESSES,
            pid_cache_capacity: constants::DEFAULT_PID_CACHE_CAPACITY,
        }
    }
}

impl ResolverConfig {
    /// Delay between two socket table re-reads.
    pub const fn socket_retry_delay(&self) -> Duration {
        Duration::from_millis(self.socket_retry_delay_ms)
    }
}

/// Open/close pairing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Maximum tracked open connections; the oldest is evicted beyond it.
    pub capacity: usize,
    /// Window in which a repeated OPEN is treated as a duplicate sample.
    pub duplicate_window_ms: u64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            capacity: constants::DEFAULT_CORRELATOR_CAPACITY,
            duplicate_window_ms: constants::DEFAULT_DUPLICATE_WINDOW_MS,
        }
    }
}

impl CorrelatorConfig {
    /// Window in which a repeated OPEN is treated as a duplicate sample.
    pub const fn duplicate_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_window_ms)
    }
}

/// Fan-out and delivery settings, shared by every sink worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Events buffered per sink before the oldest is dropped.
    pub queue_capacity: usize,
    /// Upper bound for one delivery attempt.
    pub delivery_timeout_ms: u64,
    /// Retries per event after the first failed attempt.
    pub max_retries: u32,
    /// First delay between two attempts.
    pub backoff_base_ms: u64,
    /// Upper bound for the delay between two attempts.
    pub backoff_max_ms: u64,
    /// Time given to workers to drain on shutdown.
    pub shutdown_grace_ms: u64,
    /// Minimum spacing between two warnings for the same sink.
    pub warn_interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: constants::DEFAULT_QUEUE_CAPACITY,
            delivery_timeout_ms: constants::DEFAULT_DELIVERY_TIMEOUT_MS,
            max_retries: constants::DEFAULT_MAX_RETRIES,
            backoff_base_ms: constants::DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: constants::DEFAULT_BACKOFF_MAX_MS,
            shutdown_grace_ms: constants::DEFAULT_SHUTDOWN_GRACE_MS,
            warn_interval_secs: constants::DEFAULT_WARN_INTERVAL_SECS,
        }
    }
}

impl DispatchConfig {
    /// Upper bound for one delivery attempt.
    pub const fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// Time given to workers to drain on shutdown.
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Minimum spacing between two warnings for the same sink.
    pub const fn warn_interval(&self) -> Duration {
        Duration::from_secs(self.warn_interval_secs)
    }

    /// Delay before retry number `attempt` (zero-based), doubling from the
    /// base and capped at the maximum.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

impl AgentConfig {
    /// Parses a configuration from YAML text and validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid YAML for this model or if
    /// validation fails.
    pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).map_err(|e| ConntrailError::ConfigParse {
            path: origin.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading configuration");
        let text = std::fs::read_to_string(path).map_err(|e| ConntrailError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_yaml_str(&text, path)
    }

    /// Checks cross-field constraints the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConntrailError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.sinks.is_empty() {
            return Err(ConntrailError::config("at least one sink must be configured"));
        }
        for (i, sink) in self.sinks.iter().enumerate() {
            sink.validate()?;
            if self.sinks[..i].contains(sink) {
                return Err(ConntrailError::config(format!(
                    "sink {} is configured twice",
                    sink.display_name()
                )));
            }
        }
        let positive = [
            ("source.poll_interval_ms", self.source.poll_interval_ms),
            ("source.max_consecutive_failures", u64::from(self.source.max_consecutive_failures)),
            ("correlator.capacity", self.correlator.capacity as u64),
            ("resolver.max_scan_processes", self.resolver.max_scan_processes as u64),
            ("dispatch.queue_capacity", self.dispatch.queue_capacity as u64),
            ("dispatch.delivery_timeout_ms", self.dispatch.delivery_timeout_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConntrailError::config(format!("{name} must be greater than zero")));
        }
        if self.dispatch.backoff_base_ms > self.dispatch.backoff_max_ms {
            return Err(ConntrailError::config(
                "dispatch.backoff_base_ms must not exceed dispatch.backoff_max_ms",
            ));
        }
        Ok(())
    }

    /// Proc root used by the resolver.
    pub fn resolver_proc_root(&self) -> &Path {
        self.resolver
            .proc_root
            .as_deref()
            .unwrap_or(&self.source.proc_root)
    }
}
