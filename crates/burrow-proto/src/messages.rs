//! Protocol message types

use serde::{Deserialize, Serialize};

/// Direction of a tunnel: which side runs the TCP listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelDirection {
    /// Listener on the server, agent dials the destination.
    Forward,
    /// Listener on the agent, server dials the destination.
    Reverse,
}

impl TunnelDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelDirection::Forward => "forward",
            TunnelDirection::Reverse => "reverse",
        }
    }
}

impl std::str::FromStr for TunnelDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forward" => Ok(TunnelDirection::Forward),
            "reverse" => Ok(TunnelDirection::Reverse),
            other => Err(format!(
                "invalid direction '{}', expected 'forward' or 'reverse'",
                other
            )),
        }
    }
}

/// Why a stream-open request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectKind {
    /// The request itself was malformed (e.g. bad authorization header).
    InvalidArgument,
    /// Credential validation failed.
    Unauthenticated,
    /// The referenced endpoint/tunnel/connection does not exist.
    NotFound,
}

/// Main protocol message enum
///
/// Every transport stream carries these, length-prefix framed. The first
/// message on a stream identifies the call and carries the agent's bearer
/// credential; subsequent traffic depends on the stream kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TunnelMessage {
    // Handshake (short-lived stream, agent -> server)
    Register {
        authorization: String,
        hostname: String,
    },
    Registered {
        endpoint_id: String,
    },
    /// Negative reply to any stream-open request.
    Rejected {
        kind: RejectKind,
        reason: String,
    },

    // Stream-open requests (first message on a long-lived stream)
    OpenEndpointControl {
        authorization: String,
    },
    OpenTunnelControl {
        authorization: String,
        tunnel_id: String,
    },
    /// Identification header opening a connection byte stream.
    OpenConnection {
        authorization: String,
        tunnel_id: String,
        connection_id: String,
    },

    // Endpoint control plane (server -> agent)
    AddTunnel {
        tunnel_id: String,
        listen_ip: String,
        listen_port: u16,
        destination_ip: String,
        destination_port: u16,
    },
    DeleteTunnel {
        tunnel_id: String,
    },
    SocksProxy {
        listen_port: u16,
    },
    /// Best-effort status for a SocksProxy request. 0 = started,
    /// 1 = already running, 2 = bind failure.
    SocksProxyAck {
        error_status: u32,
    },
    SocksKill,
    Disconnect,

    // Tunnel control plane (bidirectional, one stream per tunnel)
    TunnelConnect {
        tunnel_id: String,
        connection_id: String,
    },
    /// error_status != 0 means the dialing side could not reach the
    /// destination; it carries no meaning on any other message.
    TunnelAck {
        tunnel_id: String,
        connection_id: String,
        error_status: u32,
    },
    TunnelDisconnect {
        tunnel_id: String,
        connection_id: String,
    },

    // Connection byte stream. Zero-length content is the half-close sentinel.
    Bytes {
        #[serde(with = "serde_bytes")]
        content: Vec<u8>,
    },
}

impl TunnelMessage {
    /// Payload frame for a connection byte stream.
    pub fn bytes(content: Vec<u8>) -> Self {
        TunnelMessage::Bytes { content }
    }

    /// The half-close sentinel: a byte frame with no content.
    pub fn close_sentinel() -> Self {
        TunnelMessage::Bytes {
            content: Vec::new(),
        }
    }
}

// Compact serde helper for byte payloads
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

/// Hostname reported by the agent during the handshake.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = TunnelMessage::TunnelConnect {
            tunnel_id: "tun1".to_string(),
            connection_id: "conn1".to_string(),
        };
        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: TunnelMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_bytes_message() {
        let data = vec![1, 2, 3, 4, 5];
        let msg = TunnelMessage::bytes(data.clone());

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: TunnelMessage = bincode::deserialize(&serialized).unwrap();

        if let TunnelMessage::Bytes { content } = deserialized {
            assert_eq!(content, data);
        } else {
            panic!("Expected Bytes message");
        }
    }

    #[test]
    fn test_close_sentinel_is_empty() {
        if let TunnelMessage::Bytes { content } = TunnelMessage::close_sentinel() {
            assert!(content.is_empty());
        } else {
            panic!("Expected Bytes message");
        }
    }

    #[test]
    fn test_add_tunnel_masked_fields_roundtrip() {
        // Forward tunnels zero the listen side on the wire
        let msg = TunnelMessage::AddTunnel {
            tunnel_id: "abc12345".to_string(),
            listen_ip: "0.0.0.0".to_string(),
            listen_port: 0,
            destination_ip: "10.1.2.3".to_string(),
            destination_port: 8080,
        };
        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: TunnelMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!(
            "forward".parse::<TunnelDirection>().unwrap(),
            TunnelDirection::Forward
        );
        assert_eq!(
            "reverse".parse::<TunnelDirection>().unwrap(),
            TunnelDirection::Reverse
        );
        assert!("sideways".parse::<TunnelDirection>().is_err());
    }
}
