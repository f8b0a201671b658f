//! Tunnel: one control stream, many connections
//!
//! The tunnel owns the control-message dispatch loop, the connection map,
//! and (on the listening side) the TCP acceptors. Control messages are
//! dispatched in arrival order; each one drives the connection lifecycle
//! state machine.

use burrow_proto::{generate_connection_id, TunnelDirection, TunnelMessage};
use burrow_transport_quic::{QuicRecvHalf, QuicSendHalf, QuicStream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::CoreError;
use crate::handler::ConnectionStreamHandler;

/// A named multiplexing channel between the server and one agent
pub struct Tunnel {
    id: String,
    direction: TunnelDirection,
    listen_ip: String,
    listen_port: u16,
    destination_ip: String,
    destination_port: u16,

    // Lookups, inserts, and deletes all happen under this mutex
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    acceptors: Mutex<Vec<JoinHandle<()>>>,

    control_tx: Mutex<Option<Arc<AsyncMutex<QuicSendHalf>>>>,
    control_rx: Mutex<Option<QuicRecvHalf>>,
    handler: Mutex<Option<Arc<dyn ConnectionStreamHandler>>>,

    cancel: CancellationToken,
}

impl Tunnel {
    pub fn new(
        id: String,
        direction: TunnelDirection,
        listen_ip: String,
        listen_port: u16,
        destination_ip: String,
        destination_port: u16,
    ) -> Self {
        Self {
            id,
            direction,
            listen_ip,
            listen_port,
            destination_ip,
            destination_port,
            connections: Mutex::new(HashMap::new()),
            acceptors: Mutex::new(Vec::new()),
            control_tx: Mutex::new(None),
            control_rx: Mutex::new(None),
            handler: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> TunnelDirection {
        self.direction
    }

    pub fn listen_ip(&self) -> &str {
        &self.listen_ip
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn destination_ip(&self) -> &str {
        &self.destination_ip
    }

    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    /// Token fired when the tunnel is stopped.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_handler(&self, handler: Arc<dyn ConnectionStreamHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    /// Bind the tunnel-control stream. Must happen before `start`.
    pub fn set_control_stream(&self, stream: QuicStream) {
        let (tx, rx) = stream.split();
        *self.control_tx.lock().unwrap() = Some(Arc::new(AsyncMutex::new(tx)));
        *self.control_rx.lock().unwrap() = Some(rx);
    }

    /// Send a control message to the peer on the tunnel-control stream.
    pub async fn send_control(&self, msg: &TunnelMessage) -> Result<(), CoreError> {
        let tx = self
            .control_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CoreError::ControlUnbound(self.id.clone()))?;

        tx.lock().await.send_message(msg).await?;
        Ok(())
    }

    pub fn get_connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().get(connection_id).cloned()
    }

    /// Snapshot of the live connections.
    pub fn get_connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().unwrap().values().cloned().collect()
    }

    pub fn add_connection(&self, conn: Arc<Connection>) {
        self.connections
            .lock()
            .unwrap()
            .insert(conn.id().to_string(), conn);
    }

    /// Remove and close a connection record. Safe to call repeatedly.
    pub fn remove_connection(&self, connection_id: &str) {
        let removed = self.connections.lock().unwrap().remove(connection_id);
        if let Some(conn) = removed {
            conn.close();
            debug!(tunnel_id = %self.id, connection_id, "connection removed");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Bind `0.0.0.0:listen_port` and accept TCP connections into the
    /// tunnel. Each accepted socket gets a fresh connection id and a
    /// `TunnelConnect` on the control stream. Returns false on bind failure.
    pub async fn add_listener(self: &Arc<Self>, listen_port: u16, endpoint_id: &str) -> bool {
        let listener = match TcpListener::bind(("0.0.0.0", listen_port)).await {
            Ok(l) => l,
            Err(e) => {
                warn!(tunnel_id = %self.id, listen_port, error = %e, "listener bind failed");
                return false;
            }
        };

        info!(
            tunnel_id = %self.id,
            endpoint_id,
            listen_port,
            "tunnel listener started"
        );

        let tunnel = self.clone();
        let endpoint_id = endpoint_id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tunnel.cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let (socket, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(tunnel_id = %tunnel.id, error = %e, "listener accept error");
                                break;
                            }
                        };

                        let connection_id = generate_connection_id();
                        debug!(
                            tunnel_id = %tunnel.id,
                            endpoint_id = %endpoint_id,
                            connection_id = %connection_id,
                            peer = %peer,
                            "accepted tunnel connection"
                        );

                        let conn = Arc::new(Connection::new(connection_id.clone(), socket));
                        tunnel.add_connection(conn);

                        let msg = TunnelMessage::TunnelConnect {
                            tunnel_id: tunnel.id.clone(),
                            connection_id: connection_id.clone(),
                        };
                        if let Err(e) = tunnel.send_control(&msg).await {
                            warn!(
                                tunnel_id = %tunnel.id,
                                connection_id = %connection_id,
                                error = %e,
                                "failed to announce connection, dropping it"
                            );
                            tunnel.remove_connection(&connection_id);
                        }
                    }
                }
            }
        });

        self.acceptors.lock().unwrap().push(handle);
        true
    }

    /// Start the control-message dispatch loop.
    pub fn start(self: &Arc<Self>) {
        let mut rx = match self.control_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                warn!(tunnel_id = %self.id, "start without a control stream");
                return;
            }
        };

        let tunnel = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tunnel.cancel.cancelled() => break,
                    msg = rx.recv_message() => {
                        match msg {
                            Ok(Some(msg)) => tunnel.handle_control(msg).await,
                            Ok(None) => {
                                debug!(tunnel_id = %tunnel.id, "control stream ended");
                                break;
                            }
                            Err(e) => {
                                debug!(tunnel_id = %tunnel.id, error = %e, "control stream error");
                                break;
                            }
                        }
                    }
                }
            }
            // A dead control stream takes the whole tunnel with it, but the
            // endpoint stays up.
            tunnel.stop();
        });
    }

    /// Dispatch one inbound control message.
    pub async fn handle_control(self: &Arc<Self>, msg: TunnelMessage) {
        match msg {
            TunnelMessage::TunnelConnect { connection_id, .. } => {
                self.handle_connect(connection_id).await;
            }
            TunnelMessage::TunnelAck {
                connection_id,
                error_status,
                ..
            } => {
                self.handle_ack(connection_id, error_status).await;
            }
            TunnelMessage::TunnelDisconnect { connection_id, .. } => {
                let handler = self.handler.lock().unwrap().clone();
                if let (Some(handler), Some(conn)) = (handler, self.get_connection(&connection_id))
                {
                    handler.close_stream(self, &conn).await;
                }
                self.remove_connection(&connection_id);
            }
            other => {
                warn!(tunnel_id = %self.id, message = ?other, "unexpected message on control stream");
            }
        }
    }

    /// The peer's listener accepted a connection; dial the destination and
    /// wire up the byte stream.
    async fn handle_connect(self: &Arc<Self>, connection_id: String) {
        let dest = (self.destination_ip.as_str(), self.destination_port);

        let socket = match TcpStream::connect(dest).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(
                    tunnel_id = %self.id,
                    connection_id = %connection_id,
                    destination = %format!("{}:{}", dest.0, dest.1),
                    error = %e,
                    "dial failed"
                );
                let nack = TunnelMessage::TunnelAck {
                    tunnel_id: self.id.clone(),
                    connection_id,
                    error_status: 1,
                };
                if let Err(e) = self.send_control(&nack).await {
                    warn!(tunnel_id = %self.id, error = %e, "failed to send dial nack");
                }
                return;
            }
        };

        // Adopt an existing record for this id rather than overwriting it;
        // the freshly dialed socket is dropped in that case.
        let conn = {
            let mut conns = self.connections.lock().unwrap();
            match conns.get(&connection_id) {
                Some(existing) => existing.clone(),
                None => {
                    let conn = Arc::new(Connection::new(connection_id.clone(), socket));
                    conns.insert(connection_id.clone(), conn.clone());
                    conn
                }
            }
        };

        let handler = match self.handler.lock().unwrap().clone() {
            Some(h) => h,
            None => {
                warn!(tunnel_id = %self.id, "no connection handler set");
                self.remove_connection(&connection_id);
                return;
            }
        };

        if let Err(e) = handler.get_byte_stream(self, &conn).await {
            warn!(
                tunnel_id = %self.id,
                connection_id = %connection_id,
                error = %e,
                "failed to obtain byte stream"
            );
            self.remove_connection(&connection_id);
            return;
        }

        self.start_relay(conn);
    }

    /// The dialing side answered our `TunnelConnect`.
    async fn handle_ack(self: &Arc<Self>, connection_id: String, error_status: u32) {
        if error_status != 0 {
            // Peer could not dial; no relay ever started.
            debug!(
                tunnel_id = %self.id,
                connection_id = %connection_id,
                error_status,
                "peer dial failed"
            );
            self.remove_connection(&connection_id);
            return;
        }

        let conn = match self.get_connection(&connection_id) {
            Some(conn) => conn,
            None => {
                warn!(tunnel_id = %self.id, connection_id = %connection_id, "ack for unknown connection");
                return;
            }
        };

        let handler = match self.handler.lock().unwrap().clone() {
            Some(h) => h,
            None => {
                warn!(tunnel_id = %self.id, "no connection handler set");
                self.remove_connection(&connection_id);
                return;
            }
        };

        if let Err(e) = handler.acknowledge(self, &conn).await {
            warn!(
                tunnel_id = %self.id,
                connection_id = %connection_id,
                error = %e,
                "acknowledge failed"
            );
            self.remove_connection(&connection_id);
            return;
        }

        self.start_relay(conn);
    }

    /// Start relaying and arrange for the record to be removed once the
    /// connection dies. A second start attempt for the same connection is a
    /// no-op.
    pub fn start_relay(self: &Arc<Self>, conn: Arc<Connection>) {
        if !conn.start() {
            return;
        }

        let tunnel = self.clone();
        let connection_id = conn.id().to_string();
        let kill = conn.kill_token();
        tokio::spawn(async move {
            kill.cancelled().await;
            tunnel.remove_connection(&connection_id);
        });
    }

    /// Stop the tunnel: stop accepting new work first, then tear down every
    /// connection, then fire the cancellation. Idempotent.
    pub fn stop(&self) {
        for handle in self.acceptors.lock().unwrap().drain(..) {
            handle.abort();
        }

        let connections: Vec<_> = {
            let mut conns = self.connections.lock().unwrap();
            conns.drain().map(|(_, c)| c).collect()
        };
        for conn in connections {
            conn.close();
        }

        self.cancel.cancel();
        debug!(tunnel_id = %self.id, "tunnel stopped");
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopHandler {
        acknowledged: AtomicUsize,
    }

    impl NoopHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                acknowledged: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConnectionStreamHandler for NoopHandler {
        async fn get_byte_stream(
            &self,
            _tunnel: &Arc<Tunnel>,
            _conn: &Arc<Connection>,
        ) -> Result<(), CoreError> {
            Ok(())
        }

        async fn acknowledge(
            &self,
            _tunnel: &Arc<Tunnel>,
            conn: &Arc<Connection>,
        ) -> Result<(), CoreError> {
            self.acknowledged.fetch_add(1, Ordering::SeqCst);
            // No byte stream to bind in tests; report the connection dead so
            // dispatch removes it.
            Err(CoreError::StreamUnbound(conn.id().to_string()))
        }
    }

    fn test_tunnel() -> Arc<Tunnel> {
        let tunnel = Arc::new(Tunnel::new(
            "tun1".to_string(),
            TunnelDirection::Forward,
            "0.0.0.0".to_string(),
            0,
            "127.0.0.1".to_string(),
            1,
            // Port 1 is never listening in the test environment, so dial
            // attempts fail fast.
        ));
        tunnel.set_handler(NoopHandler::new());
        tunnel
    }

    async fn test_connection(id: &str) -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let _ = listener.accept().await.unwrap();
        Arc::new(Connection::new(id.to_string(), client))
    }

    #[tokio::test]
    async fn test_ack_with_error_removes_connection() {
        let tunnel = test_tunnel();
        let conn = test_connection("c1").await;
        tunnel.add_connection(conn.clone());

        tunnel
            .handle_control(TunnelMessage::TunnelAck {
                tunnel_id: "tun1".to_string(),
                connection_id: "c1".to_string(),
                error_status: 1,
            })
            .await;

        assert!(tunnel.get_connection("c1").is_none());
        assert_eq!(conn.status(), crate::ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_removes_connection() {
        let tunnel = test_tunnel();
        let conn = test_connection("c2").await;
        tunnel.add_connection(conn);

        tunnel
            .handle_control(TunnelMessage::TunnelDisconnect {
                tunnel_id: "tun1".to_string(),
                connection_id: "c2".to_string(),
            })
            .await;

        assert!(tunnel.get_connection("c2").is_none());
    }

    #[tokio::test]
    async fn test_ack_for_unknown_connection_is_ignored() {
        let tunnel = test_tunnel();

        tunnel
            .handle_control(TunnelMessage::TunnelAck {
                tunnel_id: "tun1".to_string(),
                connection_id: "ghost".to_string(),
                error_status: 0,
            })
            .await;

        assert_eq!(tunnel.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_acknowledge_removes_connection() {
        let tunnel = test_tunnel();
        let handler = NoopHandler::new();
        tunnel.set_handler(handler.clone());

        let conn = test_connection("c3").await;
        tunnel.add_connection(conn);

        tunnel
            .handle_control(TunnelMessage::TunnelAck {
                tunnel_id: "tun1".to_string(),
                connection_id: "c3".to_string(),
                error_status: 0,
            })
            .await;

        assert_eq!(handler.acknowledged.load(Ordering::SeqCst), 1);
        assert!(tunnel.get_connection("c3").is_none());
    }

    #[tokio::test]
    async fn test_connect_dial_failure_sends_nack() {
        // Destination port 1 refuses; the nack send fails because no control
        // stream is bound, but the record must not linger either way.
        let tunnel = test_tunnel();

        tunnel
            .handle_control(TunnelMessage::TunnelConnect {
                tunnel_id: "tun1".to_string(),
                connection_id: "c4".to_string(),
            })
            .await;

        assert!(tunnel.get_connection("c4").is_none());
    }

    #[tokio::test]
    async fn test_stop_closes_connections_and_cancels() {
        let tunnel = test_tunnel();
        let conn = test_connection("c5").await;
        tunnel.add_connection(conn.clone());

        tunnel.stop();

        assert_eq!(tunnel.connection_count(), 0);
        assert_eq!(conn.status(), crate::ConnectionStatus::Closed);
        assert!(tunnel.cancel_token().is_cancelled());

        // stop is idempotent
        tunnel.stop();
    }

    #[tokio::test]
    async fn test_add_listener_bind_failure() {
        let tunnel = test_tunnel();

        // Occupy a port, then ask the tunnel to bind the same one
        let blocker = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        assert!(!tunnel.add_listener(port, "ep1").await);
    }

    #[tokio::test]
    async fn test_listener_drops_connection_without_control_stream() {
        // An accepted socket that cannot be announced must not leak a record
        let tunnel = test_tunnel();

        let free_port = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };

        assert!(tunnel.add_listener(free_port, "ep1").await);

        let _client = TcpStream::connect(("127.0.0.1", free_port)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert_eq!(tunnel.connection_count(), 0);
        tunnel.stop();
    }
}
