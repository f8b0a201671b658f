//! Registry of currently connected agents
//!
//! Keyed by the per-session unique id: an agent that reconnects presents a
//! fresh unique id and gets a fresh entry (and endpoint); the stale entry is
//! torn down when its endpoint-control stream dies.

use burrow_core::Endpoint;
use burrow_proto::TunnelMessage;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::info;

/// One connected agent session
pub struct ConnectedClient {
    pub unique_id: String,
    pub token: String,
    pub name: String,
    pub remote_addr: SocketAddr,
    pub hostname: String,
    pub connected_at: DateTime<Utc>,
    pub endpoint: Arc<Endpoint>,
    // Consumer side of the endpoint outbox, claimed once by the
    // endpoint-control writer task.
    outbox_rx: Mutex<Option<mpsc::Receiver<TunnelMessage>>>,
}

impl ConnectedClient {
    pub fn new(
        unique_id: String,
        token: String,
        name: String,
        remote_addr: SocketAddr,
        hostname: String,
    ) -> Arc<Self> {
        let (endpoint, outbox_rx) = Endpoint::new(unique_id.clone());

        Arc::new(Self {
            unique_id,
            token,
            name,
            remote_addr,
            hostname,
            connected_at: Utc::now(),
            endpoint,
            outbox_rx: Mutex::new(Some(outbox_rx)),
        })
    }

    /// Claim the outbox consumer. Only the first caller gets it.
    pub fn take_outbox(&self) -> Option<mpsc::Receiver<TunnelMessage>> {
        self.outbox_rx.lock().unwrap().take()
    }
}

impl std::fmt::Debug for ConnectedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedClient")
            .field("unique_id", &self.unique_id)
            .field("name", &self.name)
            .finish()
    }
}

/// Connected-agent registry
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<ConnectedClient>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; an entry under the same unique id is replaced.
    pub fn register(&self, client: Arc<ConnectedClient>) -> Option<Arc<ConnectedClient>> {
        let replaced = self
            .clients
            .write()
            .unwrap()
            .insert(client.unique_id.clone(), client.clone());

        info!(
            unique_id = %client.unique_id,
            name = %client.name,
            hostname = %client.hostname,
            replaced = replaced.is_some(),
            "agent connected"
        );

        replaced
    }

    /// Drop a session by unique id.
    pub fn remove(&self, unique_id: &str) -> Option<Arc<ConnectedClient>> {
        let removed = self.clients.write().unwrap().remove(unique_id);
        if let Some(ref client) = removed {
            info!(unique_id = %unique_id, name = %client.name, "agent disconnected");
        }
        removed
    }

    pub fn get(&self, unique_id: &str) -> Option<Arc<ConnectedClient>> {
        self.clients.read().unwrap().get(unique_id).cloned()
    }

    /// Resolve an operator-supplied client id: unique id first, then
    /// friendly name.
    pub fn resolve(&self, client_id: &str) -> Option<Arc<ConnectedClient>> {
        let clients = self.clients.read().unwrap();
        if let Some(client) = clients.get(client_id) {
            return Some(client.clone());
        }
        clients.values().find(|c| c.name == client_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<ConnectedClient>> {
        self.clients.read().unwrap().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.clients.read().unwrap().len()
    }
}
