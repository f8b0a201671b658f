//! Endpoint: one connected agent's tunnels and control outbox

use burrow_proto::TunnelMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::CoreError;
use crate::tunnel::Tunnel;
use crate::OUTBOX_CAPACITY;

/// Per-agent handle: the server keeps one per connected agent, the agent
/// keeps the symmetric one for itself.
pub struct Endpoint {
    id: String,
    tunnels: Mutex<HashMap<String, Arc<Tunnel>>>,
    // The admin facade is the sole producer; the endpoint-control writer
    // task is the sole consumer. Taken on stop, which closes the channel.
    outbox: Mutex<Option<mpsc::Sender<TunnelMessage>>>,
}

impl Endpoint {
    /// Create an endpoint together with the consumer side of its outbox.
    pub fn new(id: String) -> (Arc<Self>, mpsc::Receiver<TunnelMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);

        let endpoint = Arc::new(Self {
            id,
            tunnels: Mutex::new(HashMap::new()),
            outbox: Mutex::new(Some(tx)),
        });

        (endpoint, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Insert a tunnel. The caller checks for duplicates first.
    pub fn add_tunnel(&self, tunnel_id: String, tunnel: Arc<Tunnel>) {
        self.tunnels.lock().unwrap().insert(tunnel_id, tunnel);
    }

    pub fn get_tunnel(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.lock().unwrap().get(tunnel_id).cloned()
    }

    /// Snapshot of the live tunnels.
    pub fn get_tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.lock().unwrap().values().cloned().collect()
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.lock().unwrap().len()
    }

    /// Stop a tunnel and drop it from the map. Returns false if absent.
    pub fn stop_and_delete_tunnel(&self, tunnel_id: &str) -> bool {
        let tunnel = match self.get_tunnel(tunnel_id) {
            Some(t) => t,
            None => return false,
        };

        tunnel.stop();
        self.tunnels.lock().unwrap().remove(tunnel_id);
        debug!(endpoint_id = %self.id, tunnel_id, "tunnel deleted");
        true
    }

    /// Queue a control message for delivery to the agent.
    pub async fn enqueue(&self, msg: TunnelMessage) -> Result<(), CoreError> {
        let tx = self
            .outbox
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CoreError::NotFound(format!("outbox for endpoint {}", self.id)))?;

        tx.send(msg)
            .await
            .map_err(|_| CoreError::Cancelled)
    }

    /// Orderly shutdown: stop every tunnel (any order), then close the
    /// outbox. Idempotent.
    pub fn stop(&self) {
        let tunnels: Vec<_> = {
            let mut map = self.tunnels.lock().unwrap();
            map.drain().map(|(_, t)| t).collect()
        };

        for tunnel in &tunnels {
            tunnel.stop();
        }

        drop(self.outbox.lock().unwrap().take());

        if !tunnels.is_empty() {
            info!(endpoint_id = %self.id, tunnels = tunnels.len(), "endpoint stopped");
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::TunnelDirection;

    fn test_tunnel(id: &str) -> Arc<Tunnel> {
        Arc::new(Tunnel::new(
            id.to_string(),
            TunnelDirection::Forward,
            "0.0.0.0".to_string(),
            0,
            "127.0.0.1".to_string(),
            80,
        ))
    }

    #[tokio::test]
    async fn test_tunnel_map_operations() {
        let (endpoint, _rx) = Endpoint::new("ep1".to_string());

        assert!(endpoint.get_tunnel("t1").is_none());

        endpoint.add_tunnel("t1".to_string(), test_tunnel("t1"));
        endpoint.add_tunnel("t2".to_string(), test_tunnel("t2"));

        assert!(endpoint.get_tunnel("t1").is_some());
        assert_eq!(endpoint.tunnel_count(), 2);
    }

    #[tokio::test]
    async fn test_stop_and_delete_absent_returns_false() {
        let (endpoint, _rx) = Endpoint::new("ep1".to_string());
        assert!(!endpoint.stop_and_delete_tunnel("missing"));
    }

    #[tokio::test]
    async fn test_stop_and_delete_existing() {
        let (endpoint, _rx) = Endpoint::new("ep1".to_string());
        let tunnel = test_tunnel("t1");
        endpoint.add_tunnel("t1".to_string(), tunnel.clone());

        assert!(endpoint.stop_and_delete_tunnel("t1"));
        assert!(endpoint.get_tunnel("t1").is_none());
        assert!(tunnel.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_outbox_delivery_and_close() {
        let (endpoint, mut rx) = Endpoint::new("ep1".to_string());

        endpoint
            .enqueue(TunnelMessage::SocksKill)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(TunnelMessage::SocksKill));

        endpoint.stop();

        // Outbox is closed: the consumer drains to None, producers error
        assert_eq!(rx.recv().await, None);
        assert!(endpoint.enqueue(TunnelMessage::SocksKill).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_cascades_and_is_idempotent() {
        let (endpoint, _rx) = Endpoint::new("ep1".to_string());
        let t1 = test_tunnel("t1");
        let t2 = test_tunnel("t2");
        endpoint.add_tunnel("t1".to_string(), t1.clone());
        endpoint.add_tunnel("t2".to_string(), t2.clone());

        endpoint.stop();
        endpoint.stop();

        assert_eq!(endpoint.tunnel_count(), 0);
        assert!(t1.cancel_token().is_cancelled());
        assert!(t2.cancel_token().is_cancelled());
    }
}
