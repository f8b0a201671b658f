//! The server facade: administrative operations over connected agents

use burrow_core::Tunnel;
use burrow_proto::admin::{ClientInfo, ConnectionInfo, TunnelInfo};
use burrow_proto::{generate_token, generate_tunnel_id, TunnelDirection, TunnelMessage};
use burrow_store::{ClientStore, RegisteredClient};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::AdminError;
use crate::handler::ServerStreamHandler;
use crate::registry::{ClientRegistry, ConnectedClient};

/// Server state shared by the agent plane and the admin plane
pub struct Server {
    registry: ClientRegistry,
    store: Arc<ClientStore>,
}

impl Server {
    pub fn new(store: Arc<ClientStore>) -> Arc<Self> {
        Arc::new(Self {
            registry: ClientRegistry::new(),
            store,
        })
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ClientStore {
        &self.store
    }

    fn resolve_client(&self, client_id: &str) -> Result<Arc<ConnectedClient>, AdminError> {
        self.registry
            .resolve(client_id)
            .ok_or_else(|| AdminError::NotFound(format!("client {} does not exist", client_id)))
    }

    /// Register a new agent record and hand back its bearer token.
    pub fn register_client(
        &self,
        name: String,
        platform: String,
        server: String,
        port: u16,
        arch: String,
    ) -> Result<String, AdminError> {
        if name.is_empty() {
            return Err(AdminError::InvalidArgument(
                "client name must not be empty".to_string(),
            ));
        }
        if self.store.find_by_name(&name).is_some() {
            return Err(AdminError::AlreadyExists(format!(
                "client {} is already registered",
                name
            )));
        }

        let token = generate_token();
        self.store
            .register(RegisteredClient {
                token: token.clone(),
                name: name.clone(),
                platform,
                server,
                port,
                arch,
            })
            .map_err(|e| AdminError::Internal(format!("store write failed: {}", e)))?;

        info!(name = %name, "registered new client");
        Ok(token)
    }

    /// Create a tunnel on an agent and, for forward tunnels, bind the local
    /// listener. The control message sent to the agent only carries the
    /// fields the dialing side needs.
    pub async fn add_tunnel(
        &self,
        client_id: &str,
        tunnel_id: Option<String>,
        direction: TunnelDirection,
        listen_ip: String,
        listen_port: u16,
        destination_ip: String,
        destination_port: u16,
    ) -> Result<String, AdminError> {
        let client = self.resolve_client(client_id)?;
        let endpoint = &client.endpoint;

        let mut tunnel_id = tunnel_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_tunnel_id);
        if endpoint.get_tunnel(&tunnel_id).is_some() {
            warn!(tunnel_id = %tunnel_id, "tunnel id already exists, generating a new one");
            tunnel_id = generate_tunnel_id();
        }

        let tunnel = Arc::new(Tunnel::new(
            tunnel_id.clone(),
            direction,
            listen_ip.clone(),
            listen_port,
            destination_ip.clone(),
            destination_port,
        ));
        tunnel.set_handler(Arc::new(ServerStreamHandler));

        if direction == TunnelDirection::Forward
            && !tunnel.add_listener(listen_port, &client.unique_id).await
        {
            return Err(AdminError::Internal(format!(
                "failed to listen on port {}",
                listen_port
            )));
        }

        endpoint.add_tunnel(tunnel_id.clone(), tunnel);

        // The listening side only tells the dialer what the dialer needs.
        let control = match direction {
            TunnelDirection::Forward => TunnelMessage::AddTunnel {
                tunnel_id: tunnel_id.clone(),
                listen_ip: "0.0.0.0".to_string(),
                listen_port: 0,
                destination_ip,
                destination_port,
            },
            TunnelDirection::Reverse => TunnelMessage::AddTunnel {
                tunnel_id: tunnel_id.clone(),
                listen_ip,
                listen_port,
                destination_ip: "0.0.0.0".to_string(),
                destination_port: 0,
            },
        };

        endpoint.enqueue(control).await.map_err(|e| {
            AdminError::Internal(format!("failed to enqueue control message: {}", e))
        })?;

        info!(
            client_id = %client.unique_id,
            tunnel_id = %tunnel_id,
            direction = direction.as_str(),
            "tunnel added"
        );

        Ok(tunnel_id)
    }

    /// Stop and delete a tunnel on both sides.
    pub async fn delete_tunnel(&self, client_id: &str, tunnel_id: &str) -> Result<(), AdminError> {
        let client = self.resolve_client(client_id)?;

        if !client.endpoint.stop_and_delete_tunnel(tunnel_id) {
            return Err(AdminError::NotFound(format!(
                "tunnel {} does not exist",
                tunnel_id
            )));
        }

        client
            .endpoint
            .enqueue(TunnelMessage::DeleteTunnel {
                tunnel_id: tunnel_id.to_string(),
            })
            .await
            .map_err(|e| AdminError::Internal(format!("failed to enqueue delete: {}", e)))?;

        info!(client_id = %client.unique_id, tunnel_id, "tunnel deleted");
        Ok(())
    }

    pub fn list_clients(&self) -> Result<Vec<ClientInfo>, AdminError> {
        let clients = self.registry.list();
        if clients.is_empty() {
            return Err(AdminError::OutOfRange("no clients connected".to_string()));
        }

        Ok(clients
            .iter()
            .map(|c| ClientInfo {
                client_id: c.unique_id.clone(),
                name: c.name.clone(),
                remote_addr: c.remote_addr.to_string(),
                hostname: c.hostname.clone(),
                connected_at: c.connected_at,
            })
            .collect())
    }

    pub fn list_tunnels(&self, client_id: &str) -> Result<Vec<TunnelInfo>, AdminError> {
        let client = self.resolve_client(client_id)?;

        let tunnels = client.endpoint.get_tunnels();
        if tunnels.is_empty() {
            return Err(AdminError::OutOfRange(format!(
                "{} has no tunnels",
                client_id
            )));
        }

        Ok(tunnels
            .iter()
            .map(|t| TunnelInfo {
                tunnel_id: t.id().to_string(),
                direction: t.direction().as_str().to_string(),
                listen_ip: t.listen_ip().to_string(),
                listen_port: t.listen_port(),
                destination_ip: t.destination_ip().to_string(),
                destination_port: t.destination_port(),
                connections: t.connection_count(),
            })
            .collect())
    }

    pub fn list_connections(
        &self,
        client_id: &str,
        tunnel_id: &str,
    ) -> Result<Vec<ConnectionInfo>, AdminError> {
        let client = self.resolve_client(client_id)?;

        let tunnel = client.endpoint.get_tunnel(tunnel_id).ok_or_else(|| {
            AdminError::NotFound(format!("tunnel {} does not exist", tunnel_id))
        })?;

        let connections = tunnel.get_connections();
        if connections.is_empty() {
            return Err(AdminError::OutOfRange(format!(
                "no connections exist for tunnel {}",
                tunnel_id
            )));
        }

        Ok(connections
            .iter()
            .map(|c| ConnectionInfo {
                connection_id: c.id().to_string(),
                source: c.local_addr().to_string(),
                destination: c.peer_addr().to_string(),
                bytes_tx: c.bytes_tx(),
                bytes_rx: c.bytes_rx(),
            })
            .collect())
    }

    pub async fn socks_start(&self, client_id: &str, listen_port: u16) -> Result<(), AdminError> {
        let client = self.resolve_client(client_id)?;

        info!(client_id = %client.unique_id, listen_port, "starting socks proxy");
        client
            .endpoint
            .enqueue(TunnelMessage::SocksProxy { listen_port })
            .await
            .map_err(|e| AdminError::Internal(format!("failed to enqueue socks start: {}", e)))
    }

    pub async fn socks_stop(&self, client_id: &str) -> Result<(), AdminError> {
        let client = self.resolve_client(client_id)?;

        client
            .endpoint
            .enqueue(TunnelMessage::SocksKill)
            .await
            .map_err(|e| AdminError::Internal(format!("failed to enqueue socks stop: {}", e)))
    }

    /// Ask an agent to terminate. Endpoint teardown follows from the control
    /// stream ending once the agent exits.
    pub async fn disconnect(&self, client_id: &str) -> Result<(), AdminError> {
        let client = self.resolve_client(client_id)?;

        info!(client_id = %client.unique_id, "disconnecting agent");
        client
            .endpoint
            .enqueue(TunnelMessage::Disconnect)
            .await
            .map_err(|e| AdminError::Internal(format!("failed to enqueue disconnect: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_server() -> Arc<Server> {
        let dir = tempfile::tempdir().unwrap();
        let store = ClientStore::load(&dir.path().join("clients.json")).unwrap();
        Server::new(Arc::new(store))
    }

    /// Register a fake connected agent, returning its outbox consumer.
    fn connect_fake_agent(
        server: &Server,
        unique_id: &str,
        name: &str,
    ) -> mpsc::Receiver<TunnelMessage> {
        let client = ConnectedClient::new(
            unique_id.to_string(),
            "token".to_string(),
            name.to_string(),
            "127.0.0.1:50000".parse().unwrap(),
            "agent-host".to_string(),
        );
        let rx = client.take_outbox().unwrap();
        server.registry().register(client);
        rx
    }

    async fn free_port() -> u16 {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_add_tunnel_unknown_client() {
        let server = test_server();
        let result = server
            .add_tunnel(
                "ghost",
                None,
                TunnelDirection::Forward,
                "0.0.0.0".to_string(),
                0,
                "127.0.0.1".to_string(),
                80,
            )
            .await;

        assert!(matches!(result, Err(AdminError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_add_forward_tunnel_masks_listen_fields() {
        let server = test_server();
        let mut outbox = connect_fake_agent(&server, "uid1", "alpha");
        let port = free_port().await;

        let tunnel_id = server
            .add_tunnel(
                "alpha",
                Some("fwd1".to_string()),
                TunnelDirection::Forward,
                "0.0.0.0".to_string(),
                port,
                "10.0.0.5".to_string(),
                8080,
            )
            .await
            .unwrap();
        assert_eq!(tunnel_id, "fwd1");

        match outbox.recv().await.unwrap() {
            TunnelMessage::AddTunnel {
                tunnel_id,
                listen_ip,
                listen_port,
                destination_ip,
                destination_port,
            } => {
                assert_eq!(tunnel_id, "fwd1");
                // Listener runs on the server; the agent only needs the
                // destination.
                assert_eq!(listen_ip, "0.0.0.0");
                assert_eq!(listen_port, 0);
                assert_eq!(destination_ip, "10.0.0.5");
                assert_eq!(destination_port, 8080);
            }
            other => panic!("expected AddTunnel, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_add_reverse_tunnel_masks_destination_fields() {
        let server = test_server();
        let mut outbox = connect_fake_agent(&server, "uid1", "alpha");

        server
            .add_tunnel(
                "uid1",
                Some("rev1".to_string()),
                TunnelDirection::Reverse,
                "0.0.0.0".to_string(),
                9090,
                "10.0.0.5".to_string(),
                80,
            )
            .await
            .unwrap();

        match outbox.recv().await.unwrap() {
            TunnelMessage::AddTunnel {
                listen_ip,
                listen_port,
                destination_ip,
                destination_port,
                ..
            } => {
                assert_eq!(listen_ip, "0.0.0.0");
                assert_eq!(listen_port, 9090);
                assert_eq!(destination_ip, "0.0.0.0");
                assert_eq!(destination_port, 0);
            }
            other => panic!("expected AddTunnel, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_tunnel_id_regenerated() {
        let server = test_server();
        let mut outbox = connect_fake_agent(&server, "uid1", "alpha");

        let first = server
            .add_tunnel(
                "uid1",
                Some("dup".to_string()),
                TunnelDirection::Reverse,
                "0.0.0.0".to_string(),
                9090,
                "10.0.0.5".to_string(),
                80,
            )
            .await
            .unwrap();
        assert_eq!(first, "dup");
        let _ = outbox.recv().await;

        let second = server
            .add_tunnel(
                "uid1",
                Some("dup".to_string()),
                TunnelDirection::Reverse,
                "0.0.0.0".to_string(),
                9091,
                "10.0.0.5".to_string(),
                80,
            )
            .await
            .unwrap();
        assert_ne!(second, "dup");
        assert_eq!(second.len(), burrow_proto::TUNNEL_ID_LEN);
    }

    #[tokio::test]
    async fn test_forward_bind_failure_enqueues_nothing() {
        let server = test_server();
        let mut outbox = connect_fake_agent(&server, "uid1", "alpha");

        // Occupy the port so the tunnel listener cannot bind it
        let blocker = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let result = server
            .add_tunnel(
                "uid1",
                None,
                TunnelDirection::Forward,
                "0.0.0.0".to_string(),
                port,
                "127.0.0.1".to_string(),
                80,
            )
            .await;
        assert!(matches!(result, Err(AdminError::Internal(_))));

        // No control message may reach the agent after a bind failure
        assert!(outbox.try_recv().is_err());
        // And no half-created tunnel record may linger
        let client = server.registry().resolve("uid1").unwrap();
        assert_eq!(client.endpoint.tunnel_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_tunnel_enqueues_control() {
        let server = test_server();
        let mut outbox = connect_fake_agent(&server, "uid1", "alpha");

        server
            .add_tunnel(
                "uid1",
                Some("t1".to_string()),
                TunnelDirection::Reverse,
                "0.0.0.0".to_string(),
                9090,
                "10.0.0.5".to_string(),
                80,
            )
            .await
            .unwrap();
        let _ = outbox.recv().await;

        server.delete_tunnel("uid1", "t1").await.unwrap();
        assert_eq!(
            outbox.recv().await,
            Some(TunnelMessage::DeleteTunnel {
                tunnel_id: "t1".to_string()
            })
        );

        assert!(matches!(
            server.delete_tunnel("uid1", "t1").await,
            Err(AdminError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_calls_signal_out_of_range() {
        let server = test_server();

        assert!(matches!(
            server.list_clients(),
            Err(AdminError::OutOfRange(_))
        ));

        let _outbox = connect_fake_agent(&server, "uid1", "alpha");
        assert_eq!(server.list_clients().unwrap().len(), 1);

        assert!(matches!(
            server.list_tunnels("uid1"),
            Err(AdminError::OutOfRange(_))
        ));
        assert!(matches!(
            server.list_tunnels("ghost"),
            Err(AdminError::NotFound(_))
        ));
        assert!(matches!(
            server.list_connections("uid1", "ghost"),
            Err(AdminError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_socks_and_disconnect_enqueue() {
        let server = test_server();
        let mut outbox = connect_fake_agent(&server, "uid1", "alpha");

        server.socks_start("uid1", 1080).await.unwrap();
        assert_eq!(
            outbox.recv().await,
            Some(TunnelMessage::SocksProxy { listen_port: 1080 })
        );

        server.socks_stop("uid1").await.unwrap();
        assert_eq!(outbox.recv().await, Some(TunnelMessage::SocksKill));

        server.disconnect("uid1").await.unwrap();
        assert_eq!(outbox.recv().await, Some(TunnelMessage::Disconnect));
    }

    #[tokio::test]
    async fn test_register_client_token_and_duplicate() {
        let server = test_server();

        let token = server
            .register_client(
                "alpha".to_string(),
                "linux".to_string(),
                "198.51.100.7".to_string(),
                5555,
                "x86_64".to_string(),
            )
            .unwrap();
        assert!(token.len() >= 32 && token.len() <= 48);
        assert_eq!(server.store().get_by_token(&token).unwrap().name, "alpha");

        let dup = server.register_client(
            "alpha".to_string(),
            "linux".to_string(),
            "198.51.100.7".to_string(),
            5555,
            "x86_64".to_string(),
        );
        assert!(matches!(dup, Err(AdminError::AlreadyExists(_))));
    }
}
