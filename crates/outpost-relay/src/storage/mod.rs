//! SQLite storage for the Outpost relay.
//!
//! Provides persistence for endpoints, edge jobs, and team memberships.

mod models;
mod queries;

#[cfg(test)]
mod tests;

pub use models::*;
pub use outpost_core::db::DatabaseError;

outpost_core::define_database!(RelayDatabase, "relay");
