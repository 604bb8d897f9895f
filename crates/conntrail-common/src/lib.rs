//! # conntrail-common
//!
//! Shared event types, error definitions, configuration models, and constants
//! used across the entire conntrail workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the primitives every pipeline stage builds on.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod record;
pub mod types;
