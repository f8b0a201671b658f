//! Operator CLI configuration
//!
//! The admin endpoint comes from `BURROW_HOST` / `BURROW_PORT`, falling
//! back to a `.burrow.conf` JSON file in the working directory, falling
//! back to localhost and the default admin port.

use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1337;
pub const CONFIG_FILE: &str = ".burrow.conf";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Read the config file; a missing or unparsable file is an empty config.
pub fn load_file(path: &Path) -> CliConfig {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default()
}

/// Merge sources: environment over file over defaults.
pub fn resolve(file: CliConfig, env_host: Option<String>, env_port: Option<String>) -> (String, u16) {
    let host = env_host
        .filter(|h| !h.is_empty())
        .or(file.host)
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = env_port
        .and_then(|p| p.parse().ok())
        .or(file.port)
        .unwrap_or(DEFAULT_PORT);

    (host, port)
}

/// The admin endpoint for this invocation.
pub fn admin_endpoint() -> (String, u16) {
    resolve(
        load_file(Path::new(CONFIG_FILE)),
        std::env::var("BURROW_HOST").ok(),
        std::env::var("BURROW_PORT").ok(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_nothing_set() {
        let (host, port) = resolve(CliConfig::default(), None, None);
        assert_eq!(host, DEFAULT_HOST);
        assert_eq!(port, DEFAULT_PORT);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = CliConfig {
            host: Some("10.1.2.3".to_string()),
            port: Some(9000),
        };
        let (host, port) = resolve(file, None, None);
        assert_eq!(host, "10.1.2.3");
        assert_eq!(port, 9000);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = CliConfig {
            host: Some("10.1.2.3".to_string()),
            port: Some(9000),
        };
        let (host, port) = resolve(
            file,
            Some("192.0.2.9".to_string()),
            Some("2000".to_string()),
        );
        assert_eq!(host, "192.0.2.9");
        assert_eq!(port, 2000);
    }

    #[test]
    fn test_unparsable_env_port_falls_through() {
        let file = CliConfig {
            host: None,
            port: Some(9000),
        };
        let (_, port) = resolve(file, None, Some("not-a-port".to_string()));
        assert_eq!(port, 9000);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_file(&dir.path().join(CONFIG_FILE));
        assert!(config.host.is_none());
        assert!(config.port.is_none());
    }

    #[test]
    fn test_load_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"host": "203.0.113.4", "port": 1400}"#).unwrap();

        let config = load_file(&path);
        assert_eq!(config.host.as_deref(), Some("203.0.113.4"));
        assert_eq!(config.port, Some(1400));
    }
}
