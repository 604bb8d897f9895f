//! Wire representation of a connection event.
//!
//! Field names are part of the external contract: downstream consumers index
//! them verbatim.

use std::net::IpAddr;

use chrono::SecondsFormat;
use serde::Serialize;
use uuid::Uuid;

use crate::types::{ConnectionEvent, Phase, Protocol};

/// Process details attached to an attributed OPEN event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramDetails {
    /// Socket inode.
    pub inode: u64,
    /// Owning process id.
    pub pid: u32,
    /// Process name.
    pub process_name: String,
    /// Command line arguments.
    pub command_line: Vec<String>,
}

/// JSON document delivered to every sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    /// Connection correlation id.
    pub uuid: Uuid,
    /// Agent identity.
    pub agent: Uuid,
    /// Correlation hash, signed view.
    pub hash: i64,
    /// Observation time, RFC 3339 with nanoseconds.
    pub timestamp: String,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Originating address.
    pub source: IpAddr,
    /// Target address.
    pub destination: IpAddr,
    /// Originating port.
    pub source_port: u16,
    /// Target port.
    pub destination_port: u16,
    /// Owner name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Owner uid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    /// Owning process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program_details: Option<ProgramDetails>,
    /// Lifecycle phase; routed out of band by the sinks.
    #[serde(skip)]
    pub phase: Phase,
}

impl EventRecord {
    /// Builds the wire record for an event emitted by the given agent.
    ///
    /// CLOSE records never carry attribution fields.
    pub fn from_event(event: &ConnectionEvent, agent: Uuid) -> Self {
        let attribution = match event.phase {
            Phase::Open => event.attribution.as_ref(),
            Phase::Close => None,
        };
        Self {
            uuid: event.connection_id,
            agent,
            hash: event.correlation_hash.as_signed(),
            timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            protocol: event.tuple.protocol,
            source: event.tuple.source_address,
            destination: event.tuple.destination_address,
            source_port: event.tuple.source_port,
            destination_port: event.tuple.destination_port,
            username: attribution.and_then(|a| a.username.clone()),
            uid: attribution.map(|a| a.uid),
            program_details: attribution.map(|a| ProgramDetails {
                inode: event.kernel_inode.unwrap_or_default(),
                pid: a.pid,
                process_name: a.process_name.clone(),
                command_line: a.command_line.clone(),
            }),
            phase: event.phase,
        }
    }

    /// Serializes the record to its JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
