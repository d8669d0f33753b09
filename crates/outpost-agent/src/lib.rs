//! Outpost Edge Agent Library
//!
//! The agent side of the Outpost tunnel protocol:
//! - Periodic check-in with the relay named by an edge key
//! - Outbound tunnel when the relay asks for one
//! - Forwarding of multiplexed streams to a local target
//! - Upload of job output the relay wants collected

pub mod client;
pub mod config;
pub mod error;
pub mod logs;
mod session;

pub use client::EdgeAgent;
pub use config::{AgentConfig, ReconnectPolicy};
pub use error::AgentError;
pub use logs::{DirLogSource, LogSource};
