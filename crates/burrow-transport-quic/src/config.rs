//! QUIC transport configuration

use burrow_transport::{TransportError, TransportResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const ALPN_PROTOCOL: &[u8] = b"burrow/1";

/// QUIC-specific configuration
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Server certificate path (server side only)
    pub server_cert_path: Option<PathBuf>,

    /// Server private key path (server side only)
    pub server_key_path: Option<PathBuf>,

    /// Skip server certificate verification (self-signed deployments)
    pub insecure_skip_verify: bool,

    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout; a dead peer is detected within this window,
    /// which is the health signal for endpoint teardown
    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams
    pub max_concurrent_streams: u64,
}

impl QuicConfig {
    /// Client configuration verifying against the system roots.
    pub fn client_default() -> Self {
        Self {
            server_cert_path: None,
            server_key_path: None,
            insecure_skip_verify: false,
            keep_alive_interval: Duration::from_secs(3),
            max_idle_timeout: Duration::from_secs(10),
            max_concurrent_streams: 1024,
        }
    }

    /// Client configuration that skips certificate verification.
    ///
    /// Required when the server runs from a self-signed certificate.
    pub fn client_insecure() -> Self {
        let mut config = Self::client_default();
        config.insecure_skip_verify = true;
        config
    }

    /// Server configuration with explicit certificate paths.
    pub fn server_from_files(cert_path: &Path, key_path: &Path) -> Self {
        Self {
            server_cert_path: Some(cert_path.to_path_buf()),
            server_key_path: Some(key_path.to_path_buf()),
            insecure_skip_verify: false,
            keep_alive_interval: Duration::from_secs(3),
            max_idle_timeout: Duration::from_secs(10),
            max_concurrent_streams: 4096,
        }
    }

    /// Zero-config server with a persistent self-signed certificate.
    ///
    /// The pair lives in `~/.burrow/` and is reused across restarts so
    /// agents keep trusting the same certificate.
    pub fn server_self_signed() -> TransportResult<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            TransportError::ConfigurationError("Cannot determine home directory".to_string())
        })?;

        let burrow_dir = home.join(".burrow");
        let cert_path = burrow_dir.join("burrow-quic.crt");
        let key_path = burrow_dir.join("burrow-quic.key");

        if !(cert_path.exists() && key_path.exists()) {
            let cert = burrow_cert::generate_self_signed_cert()
                .map_err(|e| TransportError::TlsError(e.to_string()))?;
            cert.save_to_files(&cert_path, &key_path)
                .map_err(|e| TransportError::TlsError(e.to_string()))?;
        }

        Ok(Self::server_from_files(&cert_path, &key_path))
    }

    /// Zero-config server with an ephemeral self-signed certificate.
    ///
    /// Each call generates a unique pair in the temp directory so parallel
    /// test runs never collide. Not reused across runs.
    pub fn server_ephemeral() -> TransportResult<Self> {
        let cert = burrow_cert::generate_self_signed_cert()
            .map_err(|e| TransportError::TlsError(e.to_string()))?;

        let unique = uuid::Uuid::new_v4();
        let temp_dir = std::env::temp_dir();
        let cert_path = temp_dir.join(format!("burrow-quic-test-{}.crt", unique));
        let key_path = temp_dir.join(format!("burrow-quic-test-{}.key", unique));

        cert.save_to_files(&cert_path, &key_path)
            .map_err(|e| TransportError::TlsError(e.to_string()))?;

        Ok(Self::server_from_files(&cert_path, &key_path))
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.as_millis() == 0 {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                "Idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }

        Ok(())
    }

    /// Build a quinn ClientConfig
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        let mut client_crypto = if self.insecure_skip_verify {
            quinn::rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        } else {
            let mut roots = quinn::rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            quinn::rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        client_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));

        client_config.transport_config(Arc::new(self.build_transport_config()?));

        Ok(client_config)
    }

    /// Build a quinn ServerConfig
    pub(crate) fn build_server_config(&self) -> TransportResult<quinn::ServerConfig> {
        let cert_path = self.server_cert_path.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server cert path required".to_string())
        })?;
        let key_path = self.server_key_path.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server key path required".to_string())
        })?;

        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let mut server_crypto = quinn::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        server_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));

        server_config.transport_config(Arc::new(self.build_transport_config()?));

        Ok(server_config)
    }

    fn build_transport_config(&self) -> TransportResult<quinn::TransportConfig> {
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(self.max_idle_timeout.try_into().map_err(|_| {
            TransportError::ConfigurationError("Idle timeout out of range".to_string())
        })?));
        transport.max_concurrent_bidi_streams(
            u32::try_from(self.max_concurrent_streams)
                .map_err(|_| {
                    TransportError::ConfigurationError(
                        "Stream limit out of range".to_string(),
                    )
                })?
                .into(),
        );
        Ok(transport)
    }
}

fn load_certs(path: &Path) -> TransportResult<Vec<quinn::rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = std::io::BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(path: &Path) -> TransportResult<quinn::rustls::pki_types::PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = std::io::BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that accepts anything; only reachable through
// client_insecure() for self-signed deployments.
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl quinn::rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &quinn::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[quinn::rustls::pki_types::CertificateDer<'_>],
        _server_name: &quinn::rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: quinn::rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        use quinn::rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = QuicConfig::client_default();
        assert_eq!(config.keep_alive_interval, Duration::from_secs(3));
        assert_eq!(config.max_idle_timeout, Duration::from_secs(10));
        assert!(!config.insecure_skip_verify);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_insecure_flag() {
        let config = QuicConfig::client_insecure();
        assert!(config.insecure_skip_verify);
    }

    #[test]
    fn test_invalid_idle_timeout_rejected() {
        let config = QuicConfig::client_default().with_idle_timeout(Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_ephemeral_produces_cert_pair() {
        let config = QuicConfig::server_ephemeral().unwrap();
        assert!(config.server_cert_path.as_ref().unwrap().exists());
        assert!(config.server_key_path.as_ref().unwrap().exists());
    }
}
