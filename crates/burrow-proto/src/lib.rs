//! Wire protocol for the burrow tunneling fabric
//!
//! Defines the message vocabulary exchanged between server and agent, the
//! length-prefixed codec used on every transport stream, and the identifier
//! generators shared by both sides.

pub mod admin;
pub mod codec;
pub mod ids;
pub mod messages;

pub use codec::{CodecError, TunnelCodec};
pub use ids::{generate_connection_id, generate_token, generate_tunnel_id, generate_unique_id};
pub use messages::{local_hostname, RejectKind, TunnelDirection, TunnelMessage};

/// Prefix of the authorization header attached to every stream-open message.
pub const BEARER_PREFIX: &str = "Bearer ";

/// Length of generated tunnel identifiers.
pub const TUNNEL_ID_LEN: usize = 8;

/// Length of generated bearer tokens (within the 32-48 char window).
pub const TOKEN_LEN: usize = 40;

/// Maximum payload carried by a single `Bytes` frame.
pub const MAX_BYTES_CHUNK: usize = 4096;
