//! QUIC transport implementation using quinn
//!
//! One QUIC bidirectional stream per logical stream: the endpoint control
//! plane, one per tunnel-control conversation, and one per connection's byte
//! frames. quinn gives per-stream ordering, flow control, observable
//! end-of-stream, and mandatory TLS 1.3.

pub mod config;
pub mod connection;
pub mod listener;
pub mod stream;

pub use config::QuicConfig;
pub use connection::QuicConnection;
pub use listener::{QuicConnector, QuicListener};
pub use stream::{QuicRecvHalf, QuicSendHalf, QuicStream};
