//! A single tunneled TCP connection
//!
//! Couples one TCP socket to one transport byte stream. Two relay loops run
//! after the byte stream is bound: egress (TCP -> stream) and ingress
//! (stream -> TCP). A zero-length byte frame is the half-close sentinel in
//! either direction; the loops are independent, so half-close in one
//! direction never stops the other.

use burrow_proto::{TunnelMessage, MAX_BYTES_CHUNK};
use burrow_transport_quic::{QuicRecvHalf, QuicSendHalf, QuicStream};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::CoreError;

/// Connection lifecycle status; progression is monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Created,
    Connected,
    Closed,
}

/// One TCP connection riding a tunnel
pub struct Connection {
    id: String,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,

    // Status transitions and kill closure happen under this mutex so close
    // is idempotent across ingress-error / egress-error / tunnel-stop races.
    status: Mutex<ConnectionStatus>,
    kill: CancellationToken,

    // Taken by the relay loops when they start
    socket: Mutex<Option<TcpStream>>,
    stream_rx: Mutex<Option<QuicRecvHalf>>,
    // Shared: the egress loop sends payloads, the ingress loop may send the
    // close sentinel after a TCP write failure.
    stream_tx: Mutex<Option<Arc<AsyncMutex<QuicSendHalf>>>>,

    // One-shot latch; fired by the transport service when the peer's byte
    // stream arrives. Double-signalling is a bug and is only logged.
    connected_tx: Mutex<Option<oneshot::Sender<()>>>,
    connected_rx: Mutex<Option<oneshot::Receiver<()>>>,

    remote_close: AtomicBool,
    bytes_tx: AtomicU64,
    bytes_rx: AtomicU64,
}

impl Connection {
    pub fn new(id: String, socket: TcpStream) -> Self {
        let unspecified: SocketAddr = "0.0.0.0:0".parse().expect("static addr");
        let local_addr = socket.local_addr().unwrap_or(unspecified);
        let peer_addr = socket.peer_addr().unwrap_or(unspecified);

        let (connected_tx, connected_rx) = oneshot::channel();

        Self {
            id,
            local_addr,
            peer_addr,
            status: Mutex::new(ConnectionStatus::Created),
            kill: CancellationToken::new(),
            socket: Mutex::new(Some(socket)),
            stream_rx: Mutex::new(None),
            stream_tx: Mutex::new(None),
            connected_tx: Mutex::new(Some(connected_tx)),
            connected_rx: Mutex::new(Some(connected_rx)),
            remote_close: AtomicBool::new(false),
            bytes_tx: AtomicU64::new(0),
            bytes_rx: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    /// Bytes written to the TCP socket (received from the peer).
    pub fn bytes_tx(&self) -> u64 {
        self.bytes_tx.load(Ordering::Relaxed)
    }

    /// Bytes read from the TCP socket (forwarded to the peer).
    pub fn bytes_rx(&self) -> u64 {
        self.bytes_rx.load(Ordering::Relaxed)
    }

    /// Token fired exactly once when the connection is closed.
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Bind the byte stream. The stream and the socket are 1:1 with this
    /// connection for its entire life: once the relay has started, a rebind
    /// attempt (e.g. a duplicate connect for an adopted record) is refused
    /// and the surplus stream is dropped.
    pub fn bind_stream(&self, stream: QuicStream) {
        if self.status() != ConnectionStatus::Created {
            warn!(connection_id = %self.id, "refusing to rebind byte stream");
            return;
        }
        let (tx, rx) = stream.split();
        *self.stream_tx.lock().unwrap() = Some(Arc::new(AsyncMutex::new(tx)));
        *self.stream_rx.lock().unwrap() = Some(rx);
    }

    /// Fire the `connected` latch. Called by the transport service once the
    /// peer's byte stream has been bound.
    pub fn fire_connected(&self) {
        match self.connected_tx.lock().unwrap().take() {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => warn!(connection_id = %self.id, "connected latch fired twice"),
        }
    }

    /// Wait until the byte stream has been bound, or the connection dies.
    pub async fn wait_connected(&self) -> Result<(), CoreError> {
        let rx = self
            .connected_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(CoreError::LatchConsumed)?;

        tokio::select! {
            result = rx => result.map_err(|_| CoreError::Cancelled),
            _ = self.kill.cancelled() => Err(CoreError::Cancelled),
        }
    }

    /// Start both relay loops.
    ///
    /// Idempotent under the status transition: only the first caller moves
    /// Created -> Connected and spawns the loops; later attempts are no-ops.
    pub fn start(self: &Arc<Self>) -> bool {
        {
            let mut status = self.status.lock().unwrap();
            match *status {
                ConnectionStatus::Created => *status = ConnectionStatus::Connected,
                _ => {
                    debug!(connection_id = %self.id, "relay already started, ignoring");
                    return false;
                }
            }
        }

        let socket = self.socket.lock().unwrap().take();
        let stream_rx = self.stream_rx.lock().unwrap().take();
        let stream_tx = self.stream_tx.lock().unwrap().clone();

        let (socket, stream_rx, stream_tx) = match (socket, stream_rx, stream_tx) {
            (Some(s), Some(rx), Some(tx)) => (s, rx, tx),
            _ => {
                warn!(connection_id = %self.id, "relay start without socket or stream");
                self.close();
                return false;
            }
        };

        let (read_half, write_half) = socket.into_split();

        let egress = tokio::spawn(egress_loop(self.clone(), read_half, stream_tx.clone()));
        let ingress = tokio::spawn(ingress_loop(self.clone(), write_half, stream_rx, stream_tx));

        // Supervisor: the record is done once both directions have finished.
        let conn = self.clone();
        tokio::spawn(async move {
            let _ = egress.await;
            let _ = ingress.await;
            conn.close();
            trace!(connection_id = %conn.id, "relay loops finished");
        });

        true
    }

    /// Tear the connection down: close the TCP socket, fire `kill`, and move
    /// the status to Closed. Idempotent under the connection mutex.
    pub fn close(&self) {
        let mut status = self.status.lock().unwrap();
        if *status == ConnectionStatus::Closed {
            return;
        }
        *status = ConnectionStatus::Closed;

        // A socket that never started relaying is still held here; dropping
        // it releases the fd. Running relay loops exit via the token and drop
        // their halves.
        drop(self.socket.lock().unwrap().take());
        self.kill.cancel();

        debug!(connection_id = %self.id, "connection closed");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Egress: read from the TCP socket, forward byte frames to the peer.
async fn egress_loop(
    conn: Arc<Connection>,
    mut read_half: OwnedReadHalf,
    stream_tx: Arc<AsyncMutex<QuicSendHalf>>,
) {
    let mut buf = vec![0u8; MAX_BYTES_CHUNK];

    loop {
        tokio::select! {
            _ = conn.kill.cancelled() => break,
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) | Err(_) => {
                        // Local side is done sending. Tell the peer, unless
                        // the peer already told us it was done.
                        if !conn.remote_close.load(Ordering::SeqCst) {
                            let _ = stream_tx
                                .lock()
                                .await
                                .send_message(&TunnelMessage::close_sentinel())
                                .await;
                        }
                        break;
                    }
                    Ok(n) => {
                        let frame = TunnelMessage::bytes(buf[..n].to_vec());
                        if stream_tx.lock().await.send_message(&frame).await.is_err() {
                            conn.close();
                            break;
                        }
                        conn.bytes_rx.fetch_add(n as u64, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    // Nothing more will be sent in this direction; finish the stream so
    // in-flight frames flush instead of being torn down by a reset.
    let _ = stream_tx.lock().await.finish();

    trace!(connection_id = %conn.id, "egress loop done");
}

/// Ingress: receive byte frames from the peer, write them to the TCP socket.
async fn ingress_loop(
    conn: Arc<Connection>,
    mut write_half: OwnedWriteHalf,
    mut stream_rx: QuicRecvHalf,
    stream_tx: Arc<AsyncMutex<QuicSendHalf>>,
) {
    loop {
        tokio::select! {
            _ = conn.kill.cancelled() => break,
            result = stream_rx.recv_message() => {
                match result {
                    Ok(Some(TunnelMessage::Bytes { content })) if content.is_empty() => {
                        // Definitive EOF from the peer: stop writing, keep
                        // the other direction alive.
                        conn.remote_close.store(true, Ordering::SeqCst);
                        let _ = write_half.shutdown().await;
                        break;
                    }
                    Ok(Some(TunnelMessage::Bytes { content })) => {
                        if write_half.write_all(&content).await.is_err() {
                            let _ = stream_tx
                                .lock()
                                .await
                                .send_message(&TunnelMessage::close_sentinel())
                                .await;
                            break;
                        }
                        conn.bytes_tx.fetch_add(content.len() as u64, Ordering::Relaxed);
                    }
                    Ok(Some(other)) => {
                        warn!(connection_id = %conn.id, message = ?other, "unexpected message on byte stream");
                    }
                    Ok(None) | Err(_) => {
                        conn.close();
                        break;
                    }
                }
            }
        }
    }

    trace!(connection_id = %conn.id, "ingress loop done");
}
