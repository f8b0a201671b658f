//! Core engine errors

use burrow_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("No control stream bound to tunnel {0}")]
    ControlUnbound(String),

    #[error("No byte stream bound to connection {0}")]
    StreamUnbound(String),

    #[error("Connected latch already consumed")]
    LatchConsumed,

    #[error("Cancelled")]
    Cancelled,
}
