//! Agent-side connection stream handler
//!
//! The agent is the transport client, so it originates every byte stream:
//! open a fresh stream, send the identification header, bind it to the
//! connection. Servicing an inbound `TunnelConnect` additionally answers
//! with a `TunnelAck` so the listening server starts its half of the relay.

use async_trait::async_trait;
use burrow_core::{Connection, ConnectionStreamHandler, CoreError, Tunnel};
use burrow_proto::TunnelMessage;
use burrow_transport::TransportConnection;
use burrow_transport::TransportStream;
use burrow_transport_quic::QuicConnection;
use std::sync::Arc;

pub struct AgentStreamHandler {
    connection: Arc<QuicConnection>,
    authorization: String,
}

impl AgentStreamHandler {
    pub fn new(connection: Arc<QuicConnection>, authorization: String) -> Self {
        Self {
            connection,
            authorization,
        }
    }

    /// Open a byte stream for `conn` and bind it.
    async fn open_byte_stream(
        &self,
        tunnel: &Arc<Tunnel>,
        conn: &Arc<Connection>,
    ) -> Result<(), CoreError> {
        let mut stream = self.connection.open_stream().await?;

        let header = TunnelMessage::OpenConnection {
            authorization: self.authorization.clone(),
            tunnel_id: tunnel.id().to_string(),
            connection_id: conn.id().to_string(),
        };
        stream.send_message(&header).await?;

        conn.bind_stream(stream);
        Ok(())
    }
}

#[async_trait]
impl ConnectionStreamHandler for AgentStreamHandler {
    /// Forward tunnels: we just dialed the destination. Open the byte
    /// stream, then acknowledge the dial on the control stream.
    async fn get_byte_stream(
        &self,
        tunnel: &Arc<Tunnel>,
        conn: &Arc<Connection>,
    ) -> Result<(), CoreError> {
        self.open_byte_stream(tunnel, conn).await?;

        let ack = TunnelMessage::TunnelAck {
            tunnel_id: tunnel.id().to_string(),
            connection_id: conn.id().to_string(),
            error_status: 0,
        };
        tunnel.send_control(&ack).await?;

        Ok(())
    }

    /// Reverse tunnels: the server acknowledged our `TunnelConnect`; its
    /// half is waiting on the byte stream we open now.
    async fn acknowledge(
        &self,
        tunnel: &Arc<Tunnel>,
        conn: &Arc<Connection>,
    ) -> Result<(), CoreError> {
        self.open_byte_stream(tunnel, conn).await
    }
}
