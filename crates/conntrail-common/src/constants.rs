//! System-wide constants and default paths.

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/conntrail/config.yaml";

/// Mount point of the proc filesystem.
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Kernel connection-tracking table, relative to the proc root.
pub const CONNTRACK_TABLE: &str = "net/nf_conntrack";

/// Local syslog socket.
pub const SYSLOG_SOCKET: &str = "/dev/log";

/// Application name used in syslog headers and log output.
pub const APP_NAME: &str = "conntrail";

/// Ports treated as DNS chatter (unicast DNS and mDNS).
pub const DNS_PORTS: [u16; 2] = [53, 5353];

/// Default interval between two samples of the conntrack table.
///
/// Connections whose whole lifetime fits between two samples are not observed.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

/// Consecutive conntrack read failures tolerated before the source gives up.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 20;

/// First backoff delay after a failed conntrack read.
pub const DEFAULT_SOURCE_BACKOFF_MS: u64 = 100;

/// Upper bound for the conntrack read backoff.
pub const DEFAULT_SOURCE_MAX_BACKOFF_MS: u64 = 5_000;

/// Re-reads of the socket table while a socket still reports inode 0.
pub const DEFAULT_SOCKET_RETRY_ATTEMPTS: u32 = 3;

/// Delay between two socket table re-reads.
pub const DEFAULT_SOCKET_RETRY_DELAY_MS: u64 = 2;

/// Maximum processes whose fd tables are visited per resolution.
pub const DEFAULT_MAX_SCAN_PROCESSES: usize = 32_768;

/// Capacity of the inode to pid cache.
pub const DEFAULT_PID_CACHE_CAPACITY: usize = 4_096;

/// Capacity of the correlator's open-connection map.
pub const DEFAULT_CORRELATOR_CAPACITY: usize = 65_536;

/// Window in which a repeated OPEN for the same hash is a duplicate.
pub const DEFAULT_DUPLICATE_WINDOW_MS: u64 = 2_000;

/// Events buffered per sink before the oldest is dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4_096;

/// Upper bound for a single delivery attempt.
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 5_000;

/// Retries per event after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// First delay between two delivery attempts.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 200;

/// Upper bound for the delay between two delivery attempts.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Time given to sink workers to drain on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3_000;

/// Minimum spacing between two warnings for the same failing sink.
pub const DEFAULT_WARN_INTERVAL_SECS: u64 = 60;
