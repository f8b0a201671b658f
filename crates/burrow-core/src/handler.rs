//! The server/agent asymmetry behind one capability
//!
//! Byte streams are always originated by the agent (the transport client),
//! so the two sides diverge in how a connection acquires its stream. That
//! divergence — and nothing else — lives behind this trait: the agent's
//! implementation opens a fresh stream on the transport, the server's sends
//! the acknowledgement and waits for the stream to arrive.

use async_trait::async_trait;
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::CoreError;
use crate::tunnel::Tunnel;

#[async_trait]
pub trait ConnectionStreamHandler: Send + Sync {
    /// Acquire and bind the byte stream for a connection this side just
    /// dialed (servicing an inbound `TunnelConnect`).
    async fn get_byte_stream(
        &self,
        tunnel: &Arc<Tunnel>,
        conn: &Arc<Connection>,
    ) -> Result<(), CoreError>;

    /// Acquire and bind the byte stream for a connection this side is
    /// listening for (servicing an inbound `TunnelAck`).
    async fn acknowledge(
        &self,
        tunnel: &Arc<Tunnel>,
        conn: &Arc<Connection>,
    ) -> Result<(), CoreError>;

    /// Tear down the byte stream of a connection. Both sides kill the local
    /// record; the transport notices and unwinds the stream.
    async fn close_stream(&self, _tunnel: &Arc<Tunnel>, conn: &Arc<Connection>) {
        conn.close();
    }
}
