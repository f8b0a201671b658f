//! Self-signed certificate generation for zero-config server startup
//!
//! The server needs a TLS certificate for its QUIC endpoint. Deployments
//! that do not supply one get a self-signed pair generated here and
//! persisted next to the rest of the server state so agents keep trusting
//! the same certificate across restarts.

use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Certificate errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("Certificate generation failed: {0}")]
    Generation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A generated certificate/key pair, PEM encoded
pub struct SelfSignedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generate a self-signed certificate valid for localhost deployments.
pub fn generate_self_signed_cert() -> Result<SelfSignedCert, CertError> {
    let subject_alt_names = vec!["localhost".to_string(), "burrow".to_string()];

    let certified = rcgen::generate_simple_self_signed(subject_alt_names)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(SelfSignedCert {
        cert_pem: certified.cert.pem(),
        key_pem: certified.key_pair.serialize_pem(),
    })
}

impl SelfSignedCert {
    /// Write the pair to disk, creating parent directories as needed.
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> Result<(), CertError> {
        if let Some(parent) = cert_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(cert_path, &self.cert_pem)?;
        std::fs::write(key_path, &self.key_pem)?;

        info!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "Saved self-signed certificate"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_self_signed() {
        let cert = generate_self_signed_cert().unwrap();
        assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_save_to_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");

        let cert = generate_self_signed_cert().unwrap();
        cert.save_to_files(&cert_path, &key_path).unwrap();

        assert!(cert_path.exists());
        assert!(key_path.exists());
        let reloaded = std::fs::read_to_string(&cert_path).unwrap();
        assert_eq!(reloaded, cert.cert_pem);
    }
}
