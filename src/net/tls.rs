//! TLS configuration and certificate loading for the worker listener.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::error::{TunnelError, TunnelResult};

/// Build a `TlsAcceptor` from PEM certificate chain and private key files.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> TunnelResult<TlsAcceptor> {
    let cert_file = File::open(cert_path).map_err(|e| {
        TunnelError::Tls(format!("certificate file {}: {e}", cert_path.display()))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Tls(format!("reading certificate: {e}")))?;
    if certs.is_empty() {
        return Err(TunnelError::Tls(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path).map_err(|e| {
        TunnelError::Tls(format!("private key file {}: {e}", key_path.display()))
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| TunnelError::Tls(format!("reading private key: {e}")))?
        .ok_or_else(|| {
            TunnelError::Tls(format!("no private key found in {}", key_path.display()))
        })?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}
