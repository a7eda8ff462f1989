//! Client-side TLS configuration.
//!
//! Loads a CA bundle and an optional client certificate/key pair from PEM
//! files into a rustls `ClientConfig`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tracing::info;

use crate::error::{ClientError, ClientResult};

/// PEM file locations for a TLS client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// CA bundle used to verify the server.
    pub ca_file: PathBuf,
    /// Client certificate for mutual TLS.
    pub cert_file: Option<PathBuf>,
    /// Private key matching `cert_file`.
    pub key_file: Option<PathBuf>,
}

impl TlsOptions {
    /// Verify the server only, without presenting a client certificate.
    pub fn ca_only(ca_file: impl Into<PathBuf>) -> Self {
        Self {
            ca_file: ca_file.into(),
            cert_file: None,
            key_file: None,
        }
    }

    /// Build a rustls client configuration from the PEM files.
    pub fn client_config(&self) -> ClientResult<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&self.ca_file)? {
            roots
                .add(cert)
                .map_err(|e| ClientError::Tls(format!("bad CA certificate: {e}")))?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);

        let config = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => {
                let chain = load_certs(cert)?;
                let key = load_key(key)?;
                info!(cert = ?cert, "tls client configured with client certificate");
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| ClientError::Tls(e.to_string()))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(ClientError::Tls(
                    "client certificate and key must be given together".to_string(),
                ));
            }
        };

        Ok(Arc::new(config))
    }
}

fn open(path: &Path) -> ClientResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ClientError::Tls(format!("open {}: {e}", path.display())))
}

fn load_certs(path: &Path) -> ClientResult<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::Tls(format!("parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ClientError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> ClientResult<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ClientError::Tls(format!("parse {}: {e}", path.display())))?
        .ok_or_else(|| ClientError::Tls(format!("no private key found in {}", path.display())))
}
