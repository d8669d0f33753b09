//! Reverse tunnel server.
//!
//! Agents dial in and send one handshake frame: `CHECKIN` for a status poll,
//! or `CONNECT` to open a tunnel. An open tunnel exposes a loopback port on
//! the relay; every connection accepted there is multiplexed to the agent as
//! an `OPEN`/`DATA`/`CLOSE` stream.

mod error;
mod server;
mod session;

pub use error::TunnelError;
pub use server::{TunnelServer, TunnelServerConfig};
