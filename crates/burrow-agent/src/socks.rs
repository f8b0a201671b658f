//! Local SOCKSv5 proxy mode
//!
//! On `SocksProxy` the agent binds a SOCKSv5 listener on localhost and
//! serves it directly: proxied connections are dialed from the agent's own
//! network. The SOCKS protocol itself is delegated to `socks5-impl`.

use socks5_impl::protocol::{Address, Reply};
use socks5_impl::server::{
    auth::NoAuth,
    connection::{ClientConnection, IncomingConnection},
    Server,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timeout for dials made on behalf of SOCKS clients.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A running SOCKSv5 server on the agent
pub struct SocksServer {
    listen_port: u16,
    cancel: CancellationToken,
}

impl SocksServer {
    /// Bind `127.0.0.1:listen_port` and start serving. Returns an error on
    /// bind failure.
    pub async fn start(listen_port: u16) -> std::io::Result<Self> {
        let server = Server::bind(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listen_port),
            Arc::new(NoAuth),
        )
        .await
        .map_err(std::io::Error::other)?;

        let cancel = CancellationToken::new();
        info!(listen_port, "socks server started");

        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = server.accept() => {
                        match accepted {
                            Ok((conn, peer)) => {
                                debug!(peer = %peer, "socks client connected");
                                tokio::spawn(async move {
                                    if let Err(e) = serve_connection(conn).await {
                                        debug!(error = %e, "socks connection ended with error");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "socks accept failed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            listen_port,
            cancel,
        })
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Stop accepting SOCKS clients. In-flight connections run to
    /// completion.
    pub fn stop(&self) {
        self.cancel.cancel();
        info!(listen_port = self.listen_port, "socks server stopped");
    }
}

async fn serve_connection(conn: IncomingConnection<()>) -> socks5_impl::Result<()> {
    let (conn, _auth) = conn.authenticate().await?;

    match conn.wait_request().await? {
        ClientConnection::Connect(connect, addr) => {
            let dial = async {
                match addr {
                    Address::DomainAddress(domain, port) => {
                        TcpStream::connect((&*domain, port)).await
                    }
                    Address::SocketAddress(addr) => TcpStream::connect(addr).await,
                }
            };

            match tokio::time::timeout(DIAL_TIMEOUT, dial).await {
                Ok(Ok(mut target)) => {
                    let mut conn = connect.reply(Reply::Succeeded, Address::unspecified()).await?;
                    let _ = tokio::io::copy_bidirectional(&mut target, &mut conn).await;
                }
                Ok(Err(_)) | Err(_) => {
                    let mut conn = connect
                        .reply(Reply::HostUnreachable, Address::unspecified())
                        .await?;
                    let _ = conn.shutdown().await;
                }
            }
        }
        ClientConnection::Bind(bind, _) => {
            let mut conn = bind
                .reply(Reply::CommandNotSupported, Address::unspecified())
                .await?;
            let _ = conn.shutdown().await;
        }
        ClientConnection::UdpAssociate(associate, _) => {
            let mut conn = associate
                .reply(Reply::CommandNotSupported, Address::unspecified())
                .await?;
            let _ = conn.shutdown().await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        assert!(SocksServer::start(port).await.is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let port = {
            let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let server = SocksServer::start(port).await.unwrap();
        assert_eq!(server.listen_port(), port);

        // The listener answers while running
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_ok());

        server.stop();
    }
}
