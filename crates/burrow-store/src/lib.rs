//! Persistent store of registered agents
//!
//! Registered agents are keyed by their pre-shared bearer token and
//! serialized as JSON. The store loads everything at startup and writes
//! through on every mutation; all operations take the store-level mutex.
//! The server receives the store as a constructor parameter, so tests can
//! point it at a scratch file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A registered agent's persistent record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisteredClient {
    pub token: String,
    pub name: String,
    pub platform: String,
    pub server: String,
    pub port: u16,
    pub arch: String,
}

/// Token-keyed store backed by a JSON file
pub struct ClientStore {
    path: PathBuf,
    clients: Mutex<HashMap<String, RegisteredClient>>,
}

impl ClientStore {
    /// Open the store, loading existing records. A missing file is an empty
    /// store.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let clients = if path.exists() {
            let json = std::fs::read_to_string(path)?;
            serde_json::from_str(&json)?
        } else {
            HashMap::new()
        };

        info!(path = %path.display(), "client store loaded");

        Ok(Self {
            path: path.to_path_buf(),
            clients: Mutex::new(clients),
        })
    }

    /// Insert a record and persist.
    pub fn register(&self, client: RegisteredClient) -> Result<(), StoreError> {
        let mut clients = self.clients.lock().unwrap();
        debug!(name = %client.name, "registering client");
        clients.insert(client.token.clone(), client);
        self.persist(&clients)
    }

    /// Remove a record by token and persist. Returns false if absent.
    pub fn delete(&self, token: &str) -> Result<bool, StoreError> {
        let mut clients = self.clients.lock().unwrap();
        if clients.remove(token).is_none() {
            return Ok(false);
        }
        self.persist(&clients)?;
        Ok(true)
    }

    pub fn get_by_token(&self, token: &str) -> Option<RegisteredClient> {
        self.clients.lock().unwrap().get(token).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<RegisteredClient> {
        self.clients
            .lock()
            .unwrap()
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn list(&self) -> Vec<RegisteredClient> {
        self.clients.lock().unwrap().values().cloned().collect()
    }

    fn persist(&self, clients: &HashMap<String, RegisteredClient>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(clients)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}
