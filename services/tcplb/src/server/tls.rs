//! TLS termination setup for the client-facing listener.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::error::SetupError;

fn tls_error(path: &Path, detail: impl Into<String>) -> SetupError {
    SetupError::Tls {
        path: path.to_path_buf(),
        detail: detail.into(),
    }
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, SetupError> {
    let file = File::open(path).map_err(|e| tls_error(path, e.to_string()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(path, format!("failed to read certificate: {e}")))?;

    if certs.is_empty() {
        return Err(tls_error(path, "no certificate found"));
    }

    Ok(certs)
}

/// Load the first PEM private key (PKCS#8, PKCS#1 or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, SetupError> {
    let file = File::open(path).map_err(|e| tls_error(path, e.to_string()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| tls_error(path, format!("failed to read private key: {e}")))?
        .ok_or_else(|| tls_error(path, "no private key found"))
}

/// Build an acceptor from certificate and key files.
///
/// Uses the ring provider with its safe default protocol versions, which
/// means TLS 1.2 and 1.3.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, SetupError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| tls_error(cert_path, e.to_string()))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| tls_error(cert_path, e.to_string()))?;

    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "TLS certificate loaded"
    );

    Ok(TlsAcceptor::from(Arc::new(config)))
}
