//! Outpost Relay Server Library
//!
//! Core functionality for the Outpost relay:
//! - SQLite storage for endpoints, edge jobs, and team memberships
//! - In-memory tunnel registry (per-endpoint state machine)
//! - Reverse tunnel server for edge agents
//! - Edge job dispatch and log collection
//! - Edge keys for agent enrollment
//! - Upstream selection for proxied endpoint traffic

pub mod app;
pub mod endpoints;
pub mod jobs;
pub mod proxy;
pub mod registry;
pub mod storage;
pub mod tunnel;

pub use outpost_proto::{EdgeKey, EdgeKeyError};
pub use registry::TunnelRegistry;
