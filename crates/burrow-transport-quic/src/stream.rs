//! QUIC stream implementation

use async_trait::async_trait;
use burrow_proto::{TunnelCodec, TunnelMessage};
use burrow_transport::{TransportError, TransportResult, TransportStream};
use bytes::BytesMut;
use quinn::{RecvStream, SendStream};
use tracing::trace;

const READ_CHUNK_SIZE: usize = 8192;

/// QUIC stream wrapper carrying framed protocol messages
#[derive(Debug)]
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    stream_id: u64,
    closed: bool,
    // Accumulates raw chunks until a whole frame can be decoded
    recv_buffer: BytesMut,
}

impl QuicStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        let stream_id = send.id().index();
        Self {
            send,
            recv,
            stream_id,
            closed: false,
            recv_buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
        }
    }

    /// Split into independent send and receive halves so the two relay
    /// directions of a connection run without sharing a lock.
    pub fn split(self) -> (QuicSendHalf, QuicRecvHalf) {
        let send_half = QuicSendHalf {
            send: self.send,
            stream_id: self.stream_id,
        };
        let recv_half = QuicRecvHalf {
            recv: self.recv,
            stream_id: self.stream_id,
            closed: self.closed,
            recv_buffer: self.recv_buffer,
        };
        (send_half, recv_half)
    }
}

#[async_trait]
impl TransportStream for QuicStream {
    async fn send_message(&mut self, message: &TunnelMessage) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        let encoded =
            TunnelCodec::encode(message).map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        self.send
            .write_all(&encoded)
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!(stream_id = self.stream_id, "Sent message");
        Ok(())
    }

    async fn recv_message(&mut self) -> TransportResult<Option<TunnelMessage>> {
        if self.closed {
            return Ok(None);
        }

        match recv_framed(&mut self.recv, &mut self.recv_buffer, self.stream_id).await {
            Ok(None) => {
                self.closed = true;
                Ok(None)
            }
            other => other,
        }
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }

        self.send
            .finish()
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        self.closed = true;
        Ok(())
    }

    fn stream_id(&self) -> u64 {
        self.stream_id
    }
}

/// Send half of a split QUIC stream
#[derive(Debug)]
pub struct QuicSendHalf {
    send: SendStream,
    stream_id: u64,
}

impl QuicSendHalf {
    pub async fn send_message(&mut self, message: &TunnelMessage) -> TransportResult<()> {
        let encoded =
            TunnelCodec::encode(message).map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        self.send
            .write_all(&encoded)
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!(stream_id = self.stream_id, "Sent message");
        Ok(())
    }

    /// Close the sending side; the peer observes end-of-stream.
    pub fn finish(&mut self) -> TransportResult<()> {
        self.send
            .finish()
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }
}

/// Receive half of a split QUIC stream
#[derive(Debug)]
pub struct QuicRecvHalf {
    recv: RecvStream,
    stream_id: u64,
    closed: bool,
    recv_buffer: BytesMut,
}

impl QuicRecvHalf {
    pub async fn recv_message(&mut self) -> TransportResult<Option<TunnelMessage>> {
        if self.closed {
            return Ok(None);
        }

        match recv_framed(&mut self.recv, &mut self.recv_buffer, self.stream_id).await {
            Ok(None) => {
                self.closed = true;
                Ok(None)
            }
            other => other,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }
}

/// Shared decode loop: pull chunks off the wire until a frame completes.
async fn recv_framed(
    recv: &mut RecvStream,
    buffer: &mut BytesMut,
    stream_id: u64,
) -> TransportResult<Option<TunnelMessage>> {
    loop {
        if let Some(msg) =
            TunnelCodec::decode(buffer).map_err(|e| TransportError::ProtocolError(e.to_string()))?
        {
            trace!(stream_id, "Received message");
            return Ok(Some(msg));
        }

        match recv.read_chunk(READ_CHUNK_SIZE, true).await {
            Ok(Some(chunk)) => {
                buffer.extend_from_slice(&chunk.bytes);
            }
            Ok(None) => {
                if buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::ProtocolError(
                    "Incomplete message at end of stream".to_string(),
                ));
            }
            Err(e) => {
                return Err(TransportError::ConnectionError(e.to_string()));
            }
        }
    }
}
