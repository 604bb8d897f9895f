//! Domain primitive types used across the conntrail workspace.

use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transport protocol of a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Transmission Control Protocol.
    #[serde(rename = "TCP")]
    Tcp,
    /// User Datagram Protocol.
    #[serde(rename = "UDP")]
    Udp,
}

impl Protocol {
    /// Returns the protocol for an IP protocol number, if tracked.
    pub const fn from_number(number: u8) -> Option<Self> {
        match number {
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            _ => None,
        }
    }

    /// Returns the canonical upper-case name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of a connection observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// The connection appeared in the kernel table.
    Open,
    /// The connection left the kernel table.
    Close,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// The invariant identity of a connection: protocol plus both endpoints,
/// as seen in the original direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionTuple {
    /// Transport protocol.
    pub protocol: Protocol,
    /// Originating address.
    pub source_address: IpAddr,
    /// Originating port.
    pub source_port: u16,
    /// Target address.
    pub destination_address: IpAddr,
    /// Target port.
    pub destination_port: u16,
}

impl fmt::Display for ConnectionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.protocol,
            std::net::SocketAddr::new(self.source_address, self.source_port),
            std::net::SocketAddr::new(self.destination_address, self.destination_port),
        )
    }
}

/// Stable 64-bit fingerprint linking the OPEN and CLOSE of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationHash(u64);

impl CorrelationHash {
    /// Wraps a raw hash value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw unsigned value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the value reinterpreted as a signed integer, the form used on
    /// the wire so that signed-only consumers (search backends) can index it.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn as_signed(self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for CorrelationHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The process and user owning a connection's local socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessAttribution {
    /// Process id.
    pub pid: u32,
    /// Short process name as reported by the kernel.
    pub process_name: String,
    /// Command line, one element per argument.
    pub command_line: Vec<String>,
    /// Owner of the socket.
    pub uid: u32,
    /// Name of the owner, when the user database knows it.
    pub username: Option<String>,
}

/// The canonical unit flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// Connection identity.
    pub tuple: ConnectionTuple,
    /// Observed lifecycle transition.
    pub phase: Phase,
    /// Socket inode, when the socket table could be matched.
    pub kernel_inode: Option<u64>,
    /// Fingerprint of `tuple`.
    pub correlation_hash: CorrelationHash,
    /// Identifier shared by the OPEN and CLOSE of one observed lifetime.
    pub connection_id: Uuid,
    /// Wall-clock observation time.
    pub timestamp: DateTime<Utc>,
    /// Monotonic observation time, used for every window computation.
    pub observed_at: Instant,
    /// Owning process, best-effort on OPEN and absent on CLOSE.
    pub attribution: Option<ProcessAttribution>,
}

impl ConnectionEvent {
    /// Returns whether this is an OPEN observation.
    pub fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }
}
