//! Outpost Core Library
//!
//! Shared functionality for Outpost components:
//! - Configuration resolution and hierarchy
//! - Common error types
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Tracing initialisation

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
