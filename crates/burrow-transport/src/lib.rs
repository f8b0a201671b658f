//! Transport abstraction for the tunneling fabric
//!
//! The engine needs a bidirectional, reliable, message-oriented transport
//! that can multiplex independent ordered streams over one connection and
//! make end-of-stream observable to both sides. These traits capture that
//! contract; `burrow-transport-quic` provides the production implementation.

use async_trait::async_trait;
use burrow_proto::TunnelMessage;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional message stream over a transport connection
///
/// One stream carries one logical conversation: the endpoint control plane,
/// one tunnel's control messages, or one connection's byte frames. Messages
/// on a stream are delivered reliably and in order.
#[async_trait]
pub trait TransportStream: Send + Sync + Debug {
    /// Send a protocol message on this stream
    async fn send_message(&mut self, message: &TunnelMessage) -> TransportResult<()>;

    /// Receive a protocol message from this stream
    ///
    /// Returns `None` when the stream has been closed gracefully by the
    /// remote peer.
    async fn recv_message(&mut self) -> TransportResult<Option<TunnelMessage>>;

    /// Close the sending side of the stream
    async fn finish(&mut self) -> TransportResult<()>;

    /// Transport-level stream id (unique within this connection)
    fn stream_id(&self) -> u64;
}

/// A transport connection that multiplexes streams
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug {
    type Stream: TransportStream;

    /// Open a new bidirectional stream
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Accept an incoming bidirectional stream
    ///
    /// Returns `None` when the connection is closed and no more streams will
    /// arrive.
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Close the connection
    async fn close(&self, error_code: u32, reason: &str);

    /// Whether the connection has terminated
    fn is_closed(&self) -> bool;

    /// Remote peer address
    fn remote_address(&self) -> SocketAddr;

    /// Aggregate traffic counters for this connection
    fn stats(&self) -> ConnectionStats;
}

/// Traffic counters for a transport connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: Option<u32>,
    pub uptime_secs: u64,
}

/// Server side: listens for incoming transport connections
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    type Connection: TransportConnection;

    /// Accept an incoming connection, returning it with the peer address
    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)>;

    /// The local address this listener is bound to
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop accepting new connections
    async fn close(&self);
}

/// Client side: establishes outgoing transport connections
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    type Connection: TransportConnection;

    /// Connect to a remote server
    ///
    /// `server_name` is the name used for TLS verification.
    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Self::Connection>;
}
