//! OPEN/CLOSE pairing.
//!
//! [`correlation_hash`] is a pure function of the connection tuple: SHA-256
//! over a canonical byte encoding, truncated to the first eight bytes read
//! big-endian. It is stable across restarts, builds, and hosts, so consumers
//! can join OPEN and CLOSE records even across agent restarts.
//!
//! Canonical encoding, in order:
//!
//! | field            | bytes                                   |
//! |------------------|-----------------------------------------|
//! | protocol         | 1 (IANA protocol number)                |
//! | source family    | 1 (`4` or `6`)                          |
//! | source address   | 4 or 16                                 |
//! | source port      | 2, big-endian                           |
//! | destination      | same layout as the source               |
//!
//! IPv4-mapped IPv6 addresses are encoded as IPv4.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use conntrail_common::config::CorrelatorConfig;
use conntrail_common::types::{ConnectionEvent, ConnectionTuple, CorrelationHash, Phase, Protocol};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::bounded::BoundedMap;
use crate::resolver::Resolution;
use crate::source::RawConnection;

const fn protocol_number(protocol: Protocol) -> u8 {
    match protocol {
        Protocol::Tcp => 6,
        Protocol::Udp => 17,
    }
}

fn encode_endpoint(bytes: &mut Vec<u8>, address: IpAddr, port: u16) {
    match address.to_canonical() {
        IpAddr::V4(v4) => {
            bytes.push(4);
            bytes.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            bytes.push(6);
            bytes.extend_from_slice(&v6.octets());
        }
    }
    bytes.extend_from_slice(&port.to_be_bytes());
}

/// Computes the correlation hash of a connection tuple.
pub fn correlation_hash(tuple: &ConnectionTuple) -> CorrelationHash {
    let mut bytes = Vec::with_capacity(1 + 2 * 19);
    bytes.push(protocol_number(tuple.protocol));
    encode_endpoint(&mut bytes, tuple.source_address, tuple.source_port);
    encode_endpoint(&mut bytes, tuple.destination_address, tuple.destination_port);
    let digest = Sha256::digest(&bytes);
    let mut head = [0_u8; 8];
    head.copy_from_slice(&digest[..8]);
    CorrelationHash::new(u64::from_be_bytes(head))
}

#[derive(Debug, Clone, Copy)]
struct OpenEntry {
    connection_id: Uuid,
    first_seen: Instant,
    suppressed: bool,
}

/// Result of correlating one raw transition.
#[derive(Debug)]
pub enum Correlated {
    /// An event to pass on to the filter.
    Event(ConnectionEvent),
    /// The CLOSE of a connection whose OPEN was passed on. It shares the
    /// OPEN's verdict and skips the filter.
    PairedClose(ConnectionEvent),
    /// A repeated OPEN inside the duplicate window.
    DuplicateOpen(CorrelationHash),
    /// The CLOSE of a connection whose OPEN was filtered out.
    SuppressedClose(CorrelationHash),
}

/// Pairs OPEN and CLOSE observations and assigns connection ids.
///
/// The open map is bounded; beyond capacity the oldest entry is forgotten and
/// its CLOSE is later emitted with a fresh id.
#[derive(Debug)]
pub struct Correlator {
    open: BoundedMap<CorrelationHash, OpenEntry>,
    duplicate_window: Duration,
    evicted: u64,
}

impl Correlator {
    /// Creates a correlator.
    pub fn new(config: &CorrelatorConfig) -> Self {
        Self {
            open: BoundedMap::new(config.capacity),
            duplicate_window: config.duplicate_window(),
            evicted: 0,
        }
    }

    /// Correlates a raw transition observed at the given times.
    ///
    /// `resolution` is only consulted for OPEN; CLOSE events never carry
    /// attribution.
    pub fn correlate(
        &mut self,
        raw: RawConnection,
        resolution: Resolution,
        timestamp: DateTime<Utc>,
        observed_at: Instant,
    ) -> Correlated {
        let hash = correlation_hash(&raw.tuple);
        let mut paired = false;
        let connection_id = match raw.phase {
            Phase::Open => {
                if let Some(entry) = self.open.get(&hash) {
                    if observed_at.saturating_duration_since(entry.first_seen) < self.duplicate_window {
                        return Correlated::DuplicateOpen(hash);
                    }
                }
                let connection_id = Uuid::new_v4();
                let entry = OpenEntry {
                    connection_id,
                    first_seen: observed_at,
                    suppressed: false,
                };
                if let Some((evicted, _)) = self.open.insert(hash, entry) {
                    self.evicted += 1;
                    tracing::debug!(hash = %evicted, total = self.evicted, "correlator full, forgot oldest connection");
                }
                connection_id
            }
            Phase::Close => match self.open.remove(&hash) {
                Some(entry) if entry.suppressed => return Correlated::SuppressedClose(hash),
                Some(entry) => {
                    paired = true;
                    entry.connection_id
                }
                None => Uuid::new_v4(),
            },
        };

        let (kernel_inode, attribution) = match raw.phase {
            Phase::Open => (resolution.inode, resolution.attribution),
            Phase::Close => (None, None),
        };
        let event = ConnectionEvent {
            tuple: raw.tuple,
            phase: raw.phase,
            kernel_inode,
            correlation_hash: hash,
            connection_id,
            timestamp,
            observed_at,
            attribution,
        };
        if paired {
            Correlated::PairedClose(event)
        } else {
            Correlated::Event(event)
        }
    }

    /// Records that the OPEN with `hash` was filtered out, so its CLOSE is
    /// suppressed as well.
    pub fn mark_suppressed(&mut self, hash: CorrelationHash) {
        if let Some(entry) = self.open.get_mut(&hash) {
            entry.suppressed = true;
        }
    }

    /// Number of connections currently tracked as open.
    pub fn open_connections(&self) -> usize {
        self.open.len()
    }
}
