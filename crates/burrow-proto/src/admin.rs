//! Admin API models
//!
//! JSON bodies exchanged between the operator CLI and the server's admin
//! plane. The `code` field in [`ErrorResponse`] carries the error kind so
//! the CLI can tell an empty listing from a real failure.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub name: String,
    pub remote_addr: String,
    pub hostname: String,
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterClientRequest {
    pub name: String,
    pub platform: String,
    pub server: String,
    pub port: u16,
    pub arch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterClientResponse {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTunnelRequest {
    #[serde(default)]
    pub tunnel_id: Option<String>,
    pub direction: String,
    pub listen_ip: String,
    pub listen_port: u16,
    pub destination_ip: String,
    pub destination_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTunnelResponse {
    pub tunnel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub tunnel_id: String,
    pub direction: String,
    pub listen_ip: String,
    pub listen_port: u16,
    pub destination_ip: String,
    pub destination_port: u16,
    pub connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub source: String,
    pub destination: String,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocksStartRequest {
    pub listen_port: u16,
}
