use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read certificate '{path}': {source}")]
    CertRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to read private key '{path}': {source}")]
    KeyRead {
        path: String,
        source: std::io::Error,
    },
    #[error("no PEM certificates found in '{0}'")]
    NoCerts(String),
    #[error("no PEM private key found in '{0}'")]
    NoKey(String),
    #[error("certificate and key do not form a usable TLS config: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Reads the serving certificate chain and key once. Rotating either file
/// takes a restart.
pub fn load_server_config(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();
    let cert_display = cert_path.display().to_string();
    let key_display = key_path.display().to_string();

    let cert_pem = fs::read(cert_path).map_err(|source| TlsError::CertRead {
        path: cert_display.clone(),
        source,
    })?;
    let key_pem = fs::read(key_path).map_err(|source| TlsError::KeyRead {
        path: key_display.clone(),
        source,
    })?;

    let chain = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::CertRead {
            path: cert_display.clone(),
            source,
        })?;
    if chain.is_empty() {
        return Err(TlsError::NoCerts(cert_display));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))
        .map_err(|source| TlsError::KeyRead {
            path: key_display.clone(),
            source,
        })?
        .ok_or(TlsError::NoKey(key_display))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;

    Ok(Arc::new(config))
}
