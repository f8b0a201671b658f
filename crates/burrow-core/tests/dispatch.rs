//! Dispatch-level integration tests over a real QUIC loopback
//!
//! Exercises the dialing side of the connection state machine end to end:
//! a tunnel dials a local destination, acquires byte streams through a test
//! handler, and must adopt (not overwrite) an existing record when a
//! duplicate connect arrives.

use async_trait::async_trait;
use burrow_core::{Connection, ConnectionStatus, ConnectionStreamHandler, CoreError, Tunnel};
use burrow_proto::{TunnelDirection, TunnelMessage};
use burrow_transport::{TransportConnection, TransportConnector, TransportListener, TransportStream};
use burrow_transport_quic::{QuicConfig, QuicConnection, QuicConnector, QuicListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

use std::sync::OnceLock;
static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

fn init_crypto_provider() {
    CRYPTO_PROVIDER_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Loopback QUIC pair: (client side, server side).
async fn quic_pair() -> (Arc<QuicConnection>, Arc<QuicConnection>) {
    init_crypto_provider();

    let config = Arc::new(QuicConfig::server_ephemeral().unwrap());
    let listener = QuicListener::new("127.0.0.1:0".parse().unwrap(), config).unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

    let connector = QuicConnector::new(Arc::new(QuicConfig::client_insecure())).unwrap();
    let client = connector.connect(addr, "localhost").await.unwrap();
    let server = accept.await.unwrap();

    (Arc::new(client), Arc::new(server))
}

/// Dialing-side handler backed by a real transport connection. The peer
/// (the test) accepts the streams and holds them open.
struct DialSideHandler {
    transport: Arc<QuicConnection>,
}

#[async_trait]
impl ConnectionStreamHandler for DialSideHandler {
    async fn get_byte_stream(
        &self,
        tunnel: &Arc<Tunnel>,
        conn: &Arc<Connection>,
    ) -> Result<(), CoreError> {
        let mut stream = self.transport.open_stream().await?;
        stream
            .send_message(&TunnelMessage::OpenConnection {
                authorization: "Bearer test-session".to_string(),
                tunnel_id: tunnel.id().to_string(),
                connection_id: conn.id().to_string(),
            })
            .await?;
        conn.bind_stream(stream);
        Ok(())
    }

    async fn acknowledge(
        &self,
        tunnel: &Arc<Tunnel>,
        conn: &Arc<Connection>,
    ) -> Result<(), CoreError> {
        self.get_byte_stream(tunnel, conn).await
    }
}

/// A TCP listener that accepts and holds sockets so dials succeed.
async fn sink_destination() -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    (port, handle)
}

#[tokio::test]
async fn test_duplicate_connect_adopts_existing_record() {
    let (client_transport, server_transport) = quic_pair().await;

    // Peer side: accept byte streams and keep them alive
    let peer = tokio::spawn(async move {
        let mut streams = Vec::new();
        while let Ok(Some(mut stream)) = server_transport.accept_stream().await {
            // Consume the identification header
            let _ = stream.recv_message().await;
            streams.push(stream);
            if streams.len() == 2 {
                // Hold both until the test is done
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    });

    let (dest_port, _dest) = sink_destination().await;

    let tunnel = Arc::new(Tunnel::new(
        "tun1".to_string(),
        TunnelDirection::Forward,
        "0.0.0.0".to_string(),
        0,
        "127.0.0.1".to_string(),
        dest_port,
    ));
    tunnel.set_handler(Arc::new(DialSideHandler {
        transport: client_transport,
    }));

    // First connect: dial succeeds, record created, relay starts
    tunnel
        .handle_control(TunnelMessage::TunnelConnect {
            tunnel_id: "tun1".to_string(),
            connection_id: "dup-conn".to_string(),
        })
        .await;

    let first = tunnel.get_connection("dup-conn").expect("record created");
    assert_eq!(first.status(), ConnectionStatus::Connected);

    // Duplicate connect for the same id: the existing record is adopted,
    // not overwritten, and the running relay is left alone.
    tunnel
        .handle_control(TunnelMessage::TunnelConnect {
            tunnel_id: "tun1".to_string(),
            connection_id: "dup-conn".to_string(),
        })
        .await;

    let second = tunnel.get_connection("dup-conn").expect("record still present");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.status(), ConnectionStatus::Connected);
    assert_eq!(tunnel.connection_count(), 1);

    tunnel.stop();
    peer.abort();
}

#[tokio::test]
async fn test_relay_carries_bytes_to_peer_stream() {
    let (client_transport, server_transport) = quic_pair().await;

    // Destination service: writes a greeting, then echoes one chunk back
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"greetings").await.unwrap();
        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).await.unwrap();
        socket.write_all(&buf[..n]).await.unwrap();
    });

    let tunnel = Arc::new(Tunnel::new(
        "tun1".to_string(),
        TunnelDirection::Forward,
        "0.0.0.0".to_string(),
        0,
        "127.0.0.1".to_string(),
        dest_port,
    ));
    tunnel.set_handler(Arc::new(DialSideHandler {
        transport: client_transport,
    }));

    tunnel
        .handle_control(TunnelMessage::TunnelConnect {
            tunnel_id: "tun1".to_string(),
            connection_id: "c1".to_string(),
        })
        .await;

    // Peer side: read the header, then the greeting relayed off the TCP
    // socket, then push data back through the relay.
    let mut stream = timeout(Duration::from_secs(5), server_transport.accept_stream())
        .await
        .unwrap()
        .unwrap()
        .expect("byte stream opened");

    match timeout(Duration::from_secs(5), stream.recv_message())
        .await
        .unwrap()
        .unwrap()
    {
        Some(TunnelMessage::OpenConnection { connection_id, .. }) => {
            assert_eq!(connection_id, "c1");
        }
        other => panic!("expected identification header, got {:?}", other),
    }

    match timeout(Duration::from_secs(5), stream.recv_message())
        .await
        .unwrap()
        .unwrap()
    {
        Some(TunnelMessage::Bytes { content }) => assert_eq!(content, b"greetings"),
        other => panic!("expected relayed bytes, got {:?}", other),
    }

    // Send a chunk toward the TCP socket and read the echo back
    stream
        .send_message(&TunnelMessage::bytes(b"pong".to_vec()))
        .await
        .unwrap();

    match timeout(Duration::from_secs(5), stream.recv_message())
        .await
        .unwrap()
        .unwrap()
    {
        Some(TunnelMessage::Bytes { content }) => assert_eq!(content, b"pong"),
        other => panic!("expected echoed bytes, got {:?}", other),
    }

    // Counters tick after the frames are forwarded; give them a beat
    tokio::time::sleep(Duration::from_millis(100)).await;
    let conn = tunnel.get_connection("c1").unwrap();
    assert_eq!(conn.bytes_rx(), ("greetings".len() + "pong".len()) as u64);
    assert_eq!(conn.bytes_tx(), "pong".len() as u64);

    tunnel.stop();
}

#[tokio::test]
async fn test_half_close_sentinel_reaches_tcp_side() {
    let (client_transport, server_transport) = quic_pair().await;

    // Destination service: observes EOF on read, then can still write
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_port = listener.local_addr().unwrap().port();
    let dest_task = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut all = Vec::new();
        socket.read_to_end(&mut all).await.unwrap();
        // Read side saw EOF; the write direction must still work
        socket.write_all(b"after-eof").await.unwrap();
        all
    });

    let tunnel = Arc::new(Tunnel::new(
        "tun1".to_string(),
        TunnelDirection::Forward,
        "0.0.0.0".to_string(),
        0,
        "127.0.0.1".to_string(),
        dest_port,
    ));
    tunnel.set_handler(Arc::new(DialSideHandler {
        transport: client_transport,
    }));

    tunnel
        .handle_control(TunnelMessage::TunnelConnect {
            tunnel_id: "tun1".to_string(),
            connection_id: "c1".to_string(),
        })
        .await;

    let mut stream = server_transport
        .accept_stream()
        .await
        .unwrap()
        .expect("byte stream opened");
    let _header = stream.recv_message().await.unwrap();

    // Payload, then the half-close sentinel
    stream
        .send_message(&TunnelMessage::bytes(b"last-words".to_vec()))
        .await
        .unwrap();
    stream
        .send_message(&TunnelMessage::close_sentinel())
        .await
        .unwrap();

    // The TCP side sees exactly the payload then EOF
    let received = timeout(Duration::from_secs(5), dest_task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"last-words");

    // The reverse direction still carries data after the half-close
    match timeout(Duration::from_secs(5), stream.recv_message())
        .await
        .unwrap()
        .unwrap()
    {
        Some(TunnelMessage::Bytes { content }) => assert_eq!(content, b"after-eof"),
        other => panic!("expected bytes after half-close, got {:?}", other),
    }

    tunnel.stop();
}
