//! # conntrail-track
//!
//! The ingestion half of the pipeline: samples the kernel connection-tracking
//! table, attributes connections to processes, pairs OPEN and CLOSE
//! observations, and suppresses noise.
//!
//! Every type here is driven from a single ingestion thread. Nothing in this
//! crate is async.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bounded;
pub mod correlator;
pub mod error;
pub mod filter;
pub mod resolver;
pub mod socket_table;
pub mod source;
