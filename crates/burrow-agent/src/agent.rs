//! Agent session: handshake, endpoint-control loop, tunnel management

use burrow_core::{CoreError, Endpoint, Tunnel};
use burrow_proto::{
    generate_unique_id, local_hostname, RejectKind, TunnelDirection, TunnelMessage, BEARER_PREFIX,
};
use burrow_transport::{TransportConnection, TransportConnector, TransportError, TransportStream};
use burrow_transport_quic::{QuicConfig, QuicConnection, QuicConnector};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::handler::AgentStreamHandler;
use crate::socks::SocksServer;

/// Errors that can end an agent session
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Registration rejected ({kind:?}): {reason}")]
    Rejected { kind: RejectKind, reason: String },

    #[error("Address resolution failed: {0}")]
    AddressResolution(String),

    #[error("Endpoint control stream ended")]
    ControlStreamEnded,
}

/// How a session ended
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server ordered a disconnect; the agent process should exit.
    Disconnected,
}

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server address (host:port)
    pub server_addr: String,

    /// Pre-shared bearer token
    pub token: String,

    /// Skip certificate verification (self-signed server deployments)
    pub insecure: bool,
}

/// The burrow agent
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    fn resolve_server(&self) -> Result<(SocketAddr, String), AgentError> {
        let addr = self
            .config
            .server_addr
            .to_socket_addrs()
            .map_err(|e| {
                AgentError::AddressResolution(format!(
                    "failed to resolve {}: {}",
                    self.config.server_addr, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                AgentError::AddressResolution(format!(
                    "no addresses for {}",
                    self.config.server_addr
                ))
            })?;

        let server_name = self
            .config
            .server_addr
            .split(':')
            .next()
            .unwrap_or("localhost")
            .to_string();

        Ok((addr, server_name))
    }

    /// Run one session: connect, register, then service the endpoint
    /// control stream until the server disconnects us or the stream dies.
    ///
    /// Each call is a fresh session with a fresh unique id; the server sees
    /// a brand-new endpoint.
    pub async fn run(&self) -> Result<SessionEnd, AgentError> {
        let unique_id = generate_unique_id();
        let authorization = format!("{}{}-{}", BEARER_PREFIX, self.config.token, unique_id);

        let (server_addr, server_name) = self.resolve_server()?;

        let quic_config = if self.config.insecure {
            Arc::new(QuicConfig::client_insecure())
        } else {
            Arc::new(QuicConfig::client_default())
        };
        let connector = QuicConnector::new(quic_config)?;
        let connection = Arc::new(connector.connect(server_addr, &server_name).await?);

        let endpoint_id = self.register(&connection, &authorization).await?;
        info!(endpoint_id = %endpoint_id, unique_id = %unique_id, "registered with server");

        let (endpoint, _outbox) = Endpoint::new(unique_id.clone());

        let result = self
            .serve_endpoint_control(&connection, &authorization, &endpoint)
            .await;

        // Whatever ended the session, drain everything we own.
        endpoint.stop();
        connection.close(0, "session over").await;

        result
    }

    /// Handshake step 1: present the bearer credential and hostname.
    async fn register(
        &self,
        connection: &Arc<QuicConnection>,
        authorization: &str,
    ) -> Result<String, AgentError> {
        let mut stream = connection.open_stream().await?;

        stream
            .send_message(&TunnelMessage::Register {
                authorization: authorization.to_string(),
                hostname: local_hostname(),
            })
            .await?;

        match stream.recv_message().await? {
            Some(TunnelMessage::Registered { endpoint_id }) => Ok(endpoint_id),
            Some(TunnelMessage::Rejected { kind, reason }) => {
                Err(AgentError::Rejected { kind, reason })
            }
            Some(other) => Err(AgentError::Transport(TransportError::ProtocolError(
                format!("unexpected registration reply: {:?}", other),
            ))),
            None => Err(AgentError::Transport(TransportError::StreamClosed)),
        }
    }

    /// Handshake step 2 and main loop: open the endpoint-control stream and
    /// act on everything the server pushes.
    async fn serve_endpoint_control(
        &self,
        connection: &Arc<QuicConnection>,
        authorization: &str,
        endpoint: &Arc<Endpoint>,
    ) -> Result<SessionEnd, AgentError> {
        let mut stream = connection.open_stream().await?;
        stream
            .send_message(&TunnelMessage::OpenEndpointControl {
                authorization: authorization.to_string(),
            })
            .await?;

        let mut socks_server: Option<SocksServer> = None;

        loop {
            let msg = match stream.recv_message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(AgentError::ControlStreamEnded),
                Err(e) => {
                    warn!(error = %e, "endpoint control stream error");
                    return Err(AgentError::ControlStreamEnded);
                }
            };

            match msg {
                TunnelMessage::AddTunnel {
                    tunnel_id,
                    listen_ip,
                    listen_port,
                    destination_ip,
                    destination_port,
                } => {
                    self.add_tunnel(
                        connection,
                        authorization,
                        endpoint,
                        tunnel_id,
                        listen_ip,
                        listen_port,
                        destination_ip,
                        destination_port,
                    )
                    .await;
                }
                TunnelMessage::DeleteTunnel { tunnel_id } => {
                    if !endpoint.stop_and_delete_tunnel(&tunnel_id) {
                        warn!(tunnel_id = %tunnel_id, "delete for unknown tunnel");
                    }
                }
                TunnelMessage::SocksProxy { listen_port } => {
                    // Status is recorded but the acknowledgement is
                    // best-effort; this stream only flows server -> agent.
                    let mut error_status = 0u32;
                    if let Some(old) = socks_server.take() {
                        error_status = 1;
                        old.stop();
                    }
                    match SocksServer::start(listen_port).await {
                        Ok(server) => socks_server = Some(server),
                        Err(e) => {
                            error_status = 2;
                            warn!(listen_port, error = %e, "socks server failed to start");
                        }
                    }
                    info!(listen_port, error_status, "socks proxy request handled");
                }
                TunnelMessage::SocksKill => {
                    if let Some(server) = socks_server.take() {
                        server.stop();
                    }
                }
                TunnelMessage::Disconnect => {
                    info!("server ordered disconnect");
                    if let Some(server) = socks_server.take() {
                        server.stop();
                    }
                    return Ok(SessionEnd::Disconnected);
                }
                other => {
                    warn!(message = ?other, "unexpected message on endpoint control stream");
                }
            }
        }
    }

    /// Materialize a tunnel the server just pushed. Zeroed listen fields
    /// mean this side dials (forward); otherwise this side listens
    /// (reverse).
    #[allow(clippy::too_many_arguments)]
    async fn add_tunnel(
        &self,
        connection: &Arc<QuicConnection>,
        authorization: &str,
        endpoint: &Arc<Endpoint>,
        tunnel_id: String,
        listen_ip: String,
        listen_port: u16,
        destination_ip: String,
        destination_port: u16,
    ) {
        let direction = if listen_port == 0 {
            TunnelDirection::Forward
        } else {
            TunnelDirection::Reverse
        };

        info!(
            tunnel_id = %tunnel_id,
            direction = direction.as_str(),
            "adding tunnel"
        );

        let tunnel = Arc::new(Tunnel::new(
            tunnel_id.clone(),
            direction,
            listen_ip,
            listen_port,
            destination_ip,
            destination_port,
        ));
        tunnel.set_handler(Arc::new(AgentStreamHandler::new(
            connection.clone(),
            authorization.to_string(),
        )));

        // The control stream must be up before the listener can announce
        // accepted connections.
        let mut ctrl = match connection.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(tunnel_id = %tunnel_id, error = %e, "failed to open tunnel control stream");
                return;
            }
        };
        let open = TunnelMessage::OpenTunnelControl {
            authorization: authorization.to_string(),
            tunnel_id: tunnel_id.clone(),
        };
        if let Err(e) = ctrl.send_message(&open).await {
            warn!(tunnel_id = %tunnel_id, error = %e, "failed to announce tunnel control stream");
            return;
        }
        tunnel.set_control_stream(ctrl);

        if direction == TunnelDirection::Reverse
            && !tunnel.add_listener(listen_port, endpoint.id()).await
        {
            warn!(tunnel_id = %tunnel_id, listen_port, "reverse tunnel listener failed to bind");
        }

        endpoint.add_tunnel(tunnel_id, tunnel.clone());
        tunnel.start();
    }
}
