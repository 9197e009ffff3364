//! TLS configuration with a pinned CA bundle.
//!
//! When `BATCHSYNC_CA_BUNDLE` points at a PEM file, every HTTP client
//! trusts only the certificates in that file instead of the platform
//! roots.

use std::path::Path;

use rustls::ClientConfig;

use crate::Result;

/// Builds a [`ClientConfig`] whose root store contains only the CA
/// certificates found in the PEM file at `path`.
///
/// # Errors
///
/// Returns [`BatchSyncError::Io`](crate::BatchSyncError::Io) if the file
/// cannot be read and [`BatchSyncError::Tls`](crate::BatchSyncError::Tls)
/// if it holds no parsable certificate.
pub fn build_tls_config(path: &Path) -> Result<ClientConfig> {
    let pem = std::fs::read(path)?;
    build_tls_config_from_pem(&pem)
}

/// [`build_tls_config`] for PEM bytes already in memory.
///
/// # Errors
///
/// Returns [`BatchSyncError::Tls`](crate::BatchSyncError::Tls) if the PEM
/// cannot be parsed or contains no usable certificate.
pub fn build_tls_config_from_pem(pem: &[u8]) -> Result<ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();

    let certs: Vec<_> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| crate::BatchSyncError::Tls(format!("failed to parse CA PEM: {e}")))?;

    let (added, _ignored) = root_store.add_parsable_certificates(certs);
    if added == 0 {
        return Err(crate::BatchSyncError::Tls(
            "CA bundle contains no usable certificate".into(),
        ));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bundle_is_rejected() {
        let err = build_tls_config_from_pem(b"").unwrap_err();
        assert!(err.to_string().contains("no usable certificate"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_tls_config(&dir.path().join("absent.pem")).unwrap_err();
        assert!(matches!(err, crate::BatchSyncError::Io(_)));
    }
}
