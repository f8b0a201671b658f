//! QUIC connection implementation

use async_trait::async_trait;
use burrow_transport::{ConnectionStats, TransportConnection, TransportError, TransportResult};
use quinn::Connection;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, trace};

use crate::stream::QuicStream;

/// QUIC connection wrapper
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
    created_at: Instant,
}

impl QuicConnection {
    pub fn new(connection: Connection) -> Self {
        Self {
            inner: connection,
            created_at: Instant::now(),
        }
    }
}

#[async_trait]
impl TransportConnection for QuicConnection {
    type Stream = QuicStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        let (send, recv) = self
            .inner
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!(stream_id = send.id().index(), "Opened bidirectional stream");

        Ok(QuicStream::new(send, recv))
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        match self.inner.accept_bi().await {
            Ok((send, recv)) => {
                trace!(stream_id = send.id().index(), "Accepted bidirectional stream");
                Ok(Some(QuicStream::new(send, recv)))
            }
            // Every terminal condition collapses to "no more streams"; the
            // caller observes connection death through is_closed().
            Err(e) => {
                debug!(error = %e, "Connection stopped accepting streams");
                Ok(None)
            }
        }
    }

    async fn close(&self, error_code: u32, reason: &str) {
        self.inner
            .close(quinn::VarInt::from_u32(error_code), reason.as_bytes());

        debug!(code = error_code, reason, "QUIC connection closed");
    }

    fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    fn stats(&self) -> ConnectionStats {
        let quinn_stats = self.inner.stats();

        ConnectionStats {
            bytes_sent: quinn_stats.udp_tx.bytes,
            bytes_received: quinn_stats.udp_rx.bytes,
            rtt_ms: Some(quinn_stats.path.rtt.as_millis() as u32),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}
