//! Agent-plane service: accepts QUIC connections and routes their streams
//!
//! Every stream an agent opens starts with a message identifying the call
//! and carrying the bearer credential. Credentials are validated before any
//! payload is handled; a failure is answered with `Rejected` and the stream
//! is finished.

use burrow_proto::{RejectKind, TunnelMessage};
use burrow_transport::{TransportConnection, TransportListener, TransportStream};
use burrow_transport_quic::{QuicConnection, QuicListener, QuicStream};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::error::AdminError;
use crate::registry::ConnectedClient;
use crate::server::Server;

impl Server {
    /// Accept agent connections until the listener dies.
    pub async fn run_agent_service(self: Arc<Self>, listener: QuicListener) {
        loop {
            match listener.accept().await {
                Ok((connection, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_agent_connection(Arc::new(connection), peer).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "agent listener failed");
                    break;
                }
            }
        }
    }

    async fn handle_agent_connection(self: Arc<Self>, connection: Arc<QuicConnection>, peer: SocketAddr) {
        debug!(peer = %peer, "agent transport connected");

        loop {
            match connection.accept_stream().await {
                Ok(Some(stream)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_stream(peer, stream).await;
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "agent transport error");
                    break;
                }
            }
        }

        debug!(peer = %peer, "agent transport closed");
    }

    /// Route one stream by its first message.
    async fn handle_stream(self: Arc<Self>, peer: SocketAddr, mut stream: QuicStream) {
        let first = match stream.recv_message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(e) => {
                debug!(peer = %peer, error = %e, "stream died before first message");
                return;
            }
        };

        match first {
            TunnelMessage::Register {
                authorization,
                hostname,
            } => {
                self.handle_register(peer, stream, &authorization, hostname)
                    .await;
            }
            TunnelMessage::OpenEndpointControl { authorization } => {
                self.handle_endpoint_control(stream, &authorization).await;
            }
            TunnelMessage::OpenTunnelControl {
                authorization,
                tunnel_id,
            } => {
                self.handle_tunnel_control(stream, &authorization, &tunnel_id)
                    .await;
            }
            TunnelMessage::OpenConnection {
                authorization,
                tunnel_id,
                connection_id,
            } => {
                self.handle_connection_stream(stream, &authorization, &tunnel_id, &connection_id)
                    .await;
            }
            other => {
                warn!(peer = %peer, message = ?other, "unexpected first message on stream");
                reject(
                    &mut stream,
                    RejectKind::InvalidArgument,
                    "unexpected first message",
                )
                .await;
            }
        }
    }

    /// Validate the bearer header against the registered-client store.
    fn authenticate(&self, authorization: &str) -> Result<(String, String), AdminError> {
        let (token, unique_id) = auth::parse_bearer(authorization)?;

        if self.store().get_by_token(&token).is_none() {
            warn!(token = %auth::redact(&token), "unknown bearer token");
            return Err(AdminError::Unauthenticated(
                "unknown bearer token".to_string(),
            ));
        }

        Ok((token, unique_id))
    }

    /// Validate the bearer header and require a live connected session.
    fn authenticate_connected(
        &self,
        authorization: &str,
    ) -> Result<Arc<ConnectedClient>, AdminError> {
        let (token, unique_id) = self.authenticate(authorization)?;

        let client = self.registry().get(&unique_id).ok_or_else(|| {
            AdminError::Unauthenticated("unique id is not connected".to_string())
        })?;

        if client.token != token {
            return Err(AdminError::Unauthenticated(
                "token does not match session".to_string(),
            ));
        }

        Ok(client)
    }

    /// Handshake step 1: register the connecting agent.
    async fn handle_register(
        &self,
        peer: SocketAddr,
        mut stream: QuicStream,
        authorization: &str,
        hostname: String,
    ) {
        let (token, unique_id) = match self.authenticate(authorization) {
            Ok(parts) => parts,
            Err(e) => {
                reject_with_error(&mut stream, e).await;
                return;
            }
        };

        // authenticate() has already established the token is registered
        let registered = self
            .store()
            .get_by_token(&token)
            .expect("token validated above");

        let client = ConnectedClient::new(
            unique_id.clone(),
            token,
            registered.name.clone(),
            peer,
            hostname,
        );
        self.registry().register(client);

        let reply = TunnelMessage::Registered {
            endpoint_id: registered.name,
        };
        if let Err(e) = stream.send_message(&reply).await {
            warn!(unique_id = %unique_id, error = %e, "failed to answer registration");
            self.registry().remove(&unique_id);
            return;
        }
        let _ = stream.finish().await;
    }

    /// Handshake step 2: the long-lived endpoint-control stream. Writes
    /// outbox messages to the agent until either side goes away, then tears
    /// the endpoint down.
    async fn handle_endpoint_control(&self, mut stream: QuicStream, authorization: &str) {
        let client = match self.authenticate_connected(authorization) {
            Ok(client) => client,
            Err(e) => {
                reject_with_error(&mut stream, e).await;
                return;
            }
        };

        let mut outbox = match client.take_outbox() {
            Some(rx) => rx,
            None => {
                reject_with_error(
                    &mut stream,
                    AdminError::Internal("endpoint control stream already open".to_string()),
                )
                .await;
                return;
            }
        };

        info!(unique_id = %client.unique_id, name = %client.name, "endpoint connected");

        let (mut tx, mut rx) = stream.split();

        loop {
            tokio::select! {
                queued = outbox.recv() => {
                    match queued {
                        Some(msg) => {
                            if let Err(e) = tx.send_message(&msg).await {
                                debug!(unique_id = %client.unique_id, error = %e, "endpoint control write failed");
                                break;
                            }
                        }
                        // Outbox closed: the endpoint was stopped elsewhere
                        None => break,
                    }
                }
                inbound = rx.recv_message() => {
                    match inbound {
                        Ok(Some(msg)) => {
                            warn!(unique_id = %client.unique_id, message = ?msg, "unexpected message on endpoint control stream");
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            }
        }

        // Stream termination is the endpoint's death: drain all tunnels and
        // drop the session.
        client.endpoint.stop();
        self.registry().remove(&client.unique_id);
        info!(unique_id = %client.unique_id, name = %client.name, "endpoint disconnected");
    }

    /// Bind an inbound tunnel-control stream to its pre-created tunnel and
    /// run the tunnel until it dies.
    async fn handle_tunnel_control(&self, mut stream: QuicStream, authorization: &str, tunnel_id: &str) {
        let client = match self.authenticate_connected(authorization) {
            Ok(client) => client,
            Err(e) => {
                reject_with_error(&mut stream, e).await;
                return;
            }
        };

        let tunnel = match client.endpoint.get_tunnel(tunnel_id) {
            Some(tunnel) => tunnel,
            None => {
                reject_with_error(
                    &mut stream,
                    AdminError::NotFound(format!("tunnel {} does not exist", tunnel_id)),
                )
                .await;
                return;
            }
        };

        debug!(unique_id = %client.unique_id, tunnel_id, "tunnel control stream bound");

        tunnel.set_control_stream(stream);
        tunnel.start();

        // Hold this task open for the tunnel's lifetime so the stream's
        // termination stays tied to the tunnel's cancellation.
        tunnel.cancel_token().cancelled().await;
    }

    /// Bind an inbound byte stream to its connection, fire the latch, and
    /// remove the record once the connection dies.
    async fn handle_connection_stream(
        &self,
        mut stream: QuicStream,
        authorization: &str,
        tunnel_id: &str,
        connection_id: &str,
    ) {
        let client = match self.authenticate_connected(authorization) {
            Ok(client) => client,
            Err(e) => {
                reject_with_error(&mut stream, e).await;
                return;
            }
        };

        let tunnel = match client.endpoint.get_tunnel(tunnel_id) {
            Some(tunnel) => tunnel,
            None => {
                reject_with_error(
                    &mut stream,
                    AdminError::NotFound(format!("tunnel {} does not exist", tunnel_id)),
                )
                .await;
                return;
            }
        };

        let conn = match tunnel.get_connection(connection_id) {
            Some(conn) => conn,
            None => {
                reject_with_error(
                    &mut stream,
                    AdminError::NotFound(format!("connection {} does not exist", connection_id)),
                )
                .await;
                return;
            }
        };

        debug!(
            unique_id = %client.unique_id,
            tunnel_id,
            connection_id,
            "byte stream bound"
        );

        conn.bind_stream(stream);
        conn.fire_connected();

        conn.kill_token().cancelled().await;
        tunnel.remove_connection(connection_id);
    }
}

/// Answer a stream-open request with a rejection and finish the stream.
async fn reject(stream: &mut QuicStream, kind: RejectKind, reason: &str) {
    let msg = TunnelMessage::Rejected {
        kind,
        reason: reason.to_string(),
    };
    let _ = stream.send_message(&msg).await;
    let _ = stream.finish().await;
}

async fn reject_with_error(stream: &mut QuicStream, error: AdminError) {
    let kind = match &error {
        AdminError::InvalidArgument(_) => RejectKind::InvalidArgument,
        AdminError::NotFound(_) => RejectKind::NotFound,
        _ => RejectKind::Unauthenticated,
    };
    debug!(code = error.code(), error = %error, "rejecting stream");
    reject(stream, kind, &error.to_string()).await;
}
