//! Core multiplexing engine for the burrow tunneling fabric
//!
//! Three layers, each owning the one below it by id-keyed maps:
//!
//! - [`Endpoint`]: one connected agent's tunnels plus the control outbox.
//! - [`Tunnel`]: one tunnel-control stream, the connection map, and (on the
//!   listening side) TCP listeners. Translates control messages into
//!   connection lifecycle actions.
//! - [`Connection`]: a single duplex TCP <-> byte-stream bridge with two
//!   relay loops, half-close semantics, and idempotent teardown.
//!
//! The server/agent asymmetry in byte-stream origination lives behind the
//! [`ConnectionStreamHandler`] capability; everything else in this crate is
//! shared verbatim by both sides.

pub mod connection;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod tunnel;

pub use connection::{Connection, ConnectionStatus};
pub use endpoint::Endpoint;
pub use error::CoreError;
pub use handler::ConnectionStreamHandler;
pub use tunnel::Tunnel;

/// Capacity of each endpoint's control outbox.
pub const OUTBOX_CAPACITY: usize = 32;
