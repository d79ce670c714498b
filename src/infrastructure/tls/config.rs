/// TLS configuration for SIP over TLS
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// TLS errors
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Certificate path required when TLS is enabled")]
    MissingCertificate,

    #[error("Private key path required when TLS is enabled")]
    MissingPrivateKey,

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificate found in {0}")]
    NoCertificate(PathBuf),

    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM format)
    pub certificate_path: Option<PathBuf>,

    /// Path to private key file (PEM format, PKCS#8, PKCS#1 or SEC1)
    pub private_key_path: Option<PathBuf>,
}

impl TlsConfig {
    /// Set certificate and key paths
    pub fn with_certificate(mut self, cert_path: PathBuf, key_path: PathBuf) -> Self {
        self.certificate_path = Some(cert_path);
        self.private_key_path = Some(key_path);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), TlsError> {
        if self.certificate_path.is_none() {
            return Err(TlsError::MissingCertificate);
        }
        if self.private_key_path.is_none() {
            return Err(TlsError::MissingPrivateKey);
        }
        Ok(())
    }

    /// Load the PEM files and build an acceptor for the TLS listener
    pub fn build_acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        let cert_path = self
            .certificate_path
            .as_deref()
            .ok_or(TlsError::MissingCertificate)?;
        let key_path = self
            .private_key_path
            .as_deref()
            .ok_or(TlsError::MissingPrivateKey)?;

        let certs = load_certificates(cert_path)?;
        let key = load_private_key(key_path)?;

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        info!("Loaded TLS certificate from {}", cert_path.display());
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, std::io::Error>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}
