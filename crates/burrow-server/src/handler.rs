//! Server-side connection stream handler
//!
//! The agent originates every byte stream on the transport, so the server's
//! half of the asymmetry is passive: acknowledge the dial over the tunnel
//! control stream and wait for the agent's byte stream to arrive. The
//! `connected` latch is fired by the connection-stream service once the
//! stream is bound.

use async_trait::async_trait;
use burrow_core::{Connection, ConnectionStreamHandler, CoreError, Tunnel};
use burrow_proto::TunnelMessage;
use std::sync::Arc;

pub struct ServerStreamHandler;

#[async_trait]
impl ConnectionStreamHandler for ServerStreamHandler {
    /// Reverse tunnels: the server just dialed its destination. Tell the
    /// agent the dial succeeded, then wait for the byte stream it opens.
    async fn get_byte_stream(
        &self,
        tunnel: &Arc<Tunnel>,
        conn: &Arc<Connection>,
    ) -> Result<(), CoreError> {
        let ack = TunnelMessage::TunnelAck {
            tunnel_id: tunnel.id().to_string(),
            connection_id: conn.id().to_string(),
            error_status: 0,
        };
        tunnel.send_control(&ack).await?;

        conn.wait_connected().await
    }

    /// Forward tunnels: the agent dialed and acknowledged; its byte stream
    /// is already on the way.
    async fn acknowledge(
        &self,
        _tunnel: &Arc<Tunnel>,
        conn: &Arc<Connection>,
    ) -> Result<(), CoreError> {
        conn.wait_connected().await
    }
}
