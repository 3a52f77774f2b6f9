//! TLS material loading.
//!
//! Servers present a certificate chain and private key from PEM files;
//! clients trust the certificates in a CA bundle. Both sides use the
//! `ring` crypto provider explicitly.

use remora_core::{RemoraError, RemoraResult};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Paths to PEM encoded TLS material.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Certificate chain presented by a server.
    pub cert_file: Option<PathBuf>,
    /// Private key matching `cert_file`.
    pub key_file: Option<PathBuf>,
    /// CA bundle trusted by clients.
    pub ca_file: Option<PathBuf>,
}

impl TlsConfig {
    /// Server-side material only.
    pub fn server(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: Some(cert_file.into()),
            key_file: Some(key_file.into()),
            ca_file: None,
        }
    }

    /// Client-side trust anchors only.
    pub fn client(ca_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: None,
            key_file: None,
            ca_file: Some(ca_file.into()),
        }
    }

    /// Build a handshake acceptor from `cert_file` and `key_file`.
    pub fn acceptor(&self) -> RemoraResult<TlsAcceptor> {
        let cert_file = required(&self.cert_file, "cert_file")?;
        let key_file = required(&self.key_file, "key_file")?;

        let certs = load_certs(cert_file)?;
        let key = PrivateKeyDer::from_pem_file(key_file).map_err(|e| {
            RemoraError::Tls(format!("cannot read key {}: {:?}", key_file.display(), e))
        })?;

        let config = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| RemoraError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| RemoraError::Tls(e.to_string()))?;

        debug!("Loaded TLS server certificate from {}", cert_file.display());
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Build a connector trusting the certificates in `ca_file`.
    pub fn connector(&self) -> RemoraResult<TlsConnector> {
        let ca_file = required(&self.ca_file, "ca_file")?;

        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(ca_file)? {
            roots
                .add(cert)
                .map_err(|e| RemoraError::Tls(format!("bad CA certificate: {}", e)))?;
        }

        let config = rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| RemoraError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        debug!("Loaded TLS trust anchors from {}", ca_file.display());
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn required<'a>(path: &'a Option<PathBuf>, field: &str) -> RemoraResult<&'a Path> {
    path.as_deref()
        .ok_or_else(|| RemoraError::Tls(format!("{} is not configured", field)))
}

fn load_certs(path: &Path) -> RemoraResult<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| RemoraError::Tls(format!("cannot read {}: {:?}", path.display(), e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RemoraError::Tls(format!("bad PEM in {}: {:?}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(RemoraError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_material_is_reported() {
        let err = TlsConfig::default()
            .acceptor()
            .err()
            .expect("acceptor without a certificate must fail");
        assert!(err.to_string().contains("cert_file"));

        let err = TlsConfig::default()
            .connector()
            .err()
            .expect("connector without a CA bundle must fail");
        assert!(err.to_string().contains("ca_file"));
    }

    #[test]
    fn test_unreadable_file_is_reported() {
        let config = TlsConfig::client("/nonexistent/ca.pem");
        assert!(config.connector().is_err());
    }
}
