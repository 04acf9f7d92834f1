//! # Certificate Store
//!
//! Loads the PEM material a `tls` node needs: the CA bundle that peers are
//! verified against, plus the node's own server and client chains and
//! keys. Every certificate is checked for expiry at load time, so an
//! expired bundle stops the node at startup instead of failing every
//! handshake later.
//!
//! A `raw` node never touches this module; callers receive `None` from
//! [`load_for`] and must not assume a bundle exists.

mod tls;

pub use tls::{client_config, server_config, TlsConfigError};

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::node_config::{NodeConfig, TlsPaths};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures while loading certificate material. Fatal when transport is
/// `tls`, never raised otherwise.
#[derive(Debug, Error)]
pub enum CertError {
    /// The configured file does not exist.
    #[error("certificate file {} not found", path.display())]
    NotFound { path: PathBuf },

    /// The file exists but cannot be opened.
    #[error("failed to read {}: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },

    /// The file holds no usable PEM certificate or key, or a certificate
    /// is not valid X.509.
    #[error("failed to parse {}: {reason}", path.display())]
    ParseFailure { path: PathBuf, reason: String },

    /// A certificate's `notAfter` is in the past.
    #[error("certificate '{subject}' in {} expired at {expired_at}", path.display())]
    Expired {
        path: PathBuf,
        subject: String,
        expired_at: DateTime<Utc>,
    },
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// Everything the TLS layer needs, loaded and validated.
#[derive(Debug)]
pub struct CertBundle {
    ca_roots: Vec<CertificateDer<'static>>,
    ca_fingerprints: Vec<String>,
    server_chain: Vec<CertificateDer<'static>>,
    server_key: PrivateKeyDer<'static>,
    client_chain: Vec<CertificateDer<'static>>,
    client_key: PrivateKeyDer<'static>,
    insecure: bool,
}

impl CertBundle {
    /// Loads the CA bundle first, then the node's own chains and keys.
    pub fn load(paths: &TlsPaths) -> Result<Self, CertError> {
        let ca_roots = load_ca(&paths.ca_certs)?;
        let ca_fingerprints = ca_roots.iter().map(|c| fingerprint(c)).collect();

        let server_chain = load_cert_chain(&paths.server_cert)?;
        let server_key = load_private_key(&paths.server_key)?;
        let client_chain = load_cert_chain(&paths.client_cert)?;
        let client_key = load_private_key(&paths.client_key)?;

        Ok(Self {
            ca_roots,
            ca_fingerprints,
            server_chain,
            server_key,
            client_chain,
            client_key,
            insecure: paths.insecure,
        })
    }

    pub fn ca_roots(&self) -> &[CertificateDer<'static>] {
        &self.ca_roots
    }

    /// Lowercase hex SHA-256 of each CA certificate, in file order.
    pub fn ca_fingerprints(&self) -> &[String] {
        &self.ca_fingerprints
    }

    pub fn server_chain(&self) -> &[CertificateDer<'static>] {
        &self.server_chain
    }

    pub fn server_key(&self) -> PrivateKeyDer<'static> {
        self.server_key.clone_key()
    }

    pub fn client_chain(&self) -> &[CertificateDer<'static>] {
        &self.client_chain
    }

    pub fn client_key(&self) -> PrivateKeyDer<'static> {
        self.client_key.clone_key()
    }

    /// Whether peer verification and client authentication are disabled.
    pub fn insecure(&self) -> bool {
        self.insecure
    }
}

/// Loads the bundle a node needs for its configured transport.
///
/// Returns `Ok(None)` for `raw` transport without reading any file.
pub fn load_for(config: &NodeConfig) -> Result<Option<CertBundle>, CertError> {
    let Some(paths) = config.tls() else {
        return Ok(None);
    };
    let bundle = CertBundle::load(paths)?;
    info!(
        ca_certs = %paths.ca_certs.display(),
        roots = bundle.ca_roots.len(),
        fingerprints = ?bundle.ca_fingerprints,
        insecure = bundle.insecure,
        "certificate bundle loaded"
    );
    Ok(Some(bundle))
}

// ---------------------------------------------------------------------------
// PEM helpers
// ---------------------------------------------------------------------------

fn open(path: &Path) -> Result<BufReader<File>, CertError> {
    File::open(path).map(BufReader::new).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CertError::NotFound {
            path: path.to_path_buf(),
        },
        _ => CertError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
    })
}

/// Loads a CA bundle: one or more PEM certificates, none expired.
pub fn load_ca(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    load_cert_chain(path)
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::ParseFailure {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(CertError::ParseFailure {
            path: path.to_path_buf(),
            reason: "no PEM certificates found".to_string(),
        });
    }
    for cert in &certs {
        check_validity(path, cert)?;
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CertError::ParseFailure {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| CertError::ParseFailure {
            path: path.to_path_buf(),
            reason: "no PEM private key found".to_string(),
        })
}

fn check_validity(path: &Path, cert: &CertificateDer<'_>) -> Result<(), CertError> {
    let (_, parsed) =
        x509_parser::parse_x509_certificate(cert.as_ref()).map_err(|e| CertError::ParseFailure {
            path: path.to_path_buf(),
            reason: format!("invalid x509 certificate: {}", e),
        })?;

    let not_after = parsed.validity().not_after.timestamp();
    if not_after < Utc::now().timestamp() {
        let expired_at = Utc
            .timestamp_opt(not_after, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        return Err(CertError::Expired {
            path: path.to_path_buf(),
            subject: parsed.subject().to_string(),
            expired_at,
        });
    }
    Ok(())
}

fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn self_signed_pem() -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn missing_ca_is_not_found() {
        let err = load_ca(Path::new("/no/such/ca.pem")).unwrap_err();
        assert!(matches!(err, CertError::NotFound { .. }));
    }

    #[test]
    fn garbage_ca_is_parse_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "ca.pem", "this is not pem\n");
        let err = load_ca(&path).unwrap_err();
        assert!(matches!(err, CertError::ParseFailure { .. }));
    }

    #[test]
    fn expired_ca_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["old-ca".to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        let cert = params.self_signed(&key).unwrap();
        let path = write(dir.path(), "ca.pem", &cert.pem());

        let err = load_ca(&path).unwrap_err();
        match err {
            CertError::Expired { expired_at, .. } => {
                assert_eq!(expired_at.timestamp(), 978_307_200)
            }
            other => panic!("expected Expired, got {:?}", other),
        }
    }

    #[test]
    fn full_bundle_loads_with_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_pem, key_pem) = self_signed_pem();
        let paths = TlsPaths {
            ca_certs: write(dir.path(), "ca.pem", &cert_pem),
            server_cert: write(dir.path(), "server.crt", &cert_pem),
            server_key: write(dir.path(), "server.key", &key_pem),
            client_cert: write(dir.path(), "client.crt", &cert_pem),
            client_key: write(dir.path(), "client.key", &key_pem),
            insecure: false,
        };

        let bundle = CertBundle::load(&paths).unwrap();
        assert_eq!(bundle.ca_roots().len(), 1);
        assert_eq!(bundle.ca_fingerprints()[0].len(), 64);
        assert_eq!(bundle.server_chain().len(), 1);
        assert!(!bundle.insecure());
    }

    #[test]
    fn missing_key_file_names_the_key_path() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_pem, _) = self_signed_pem();
        let paths = TlsPaths {
            ca_certs: write(dir.path(), "ca.pem", &cert_pem),
            server_cert: write(dir.path(), "server.crt", &cert_pem),
            server_key: dir.path().join("server.key"),
            client_cert: write(dir.path(), "client.crt", &cert_pem),
            client_key: dir.path().join("client.key"),
            insecure: false,
        };
        match CertBundle::load(&paths).unwrap_err() {
            CertError::NotFound { path } => assert!(path.ends_with("server.key")),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn raw_transport_skips_loading() {
        let cfg = NodeConfig::from_toml_str(
            r#"
node_id = "n"
service_endpoint = "127.0.0.1:0"
network_endpoints = ["127.0.0.1:0"]
transport = "raw"
rest_api_endpoint = "127.0.0.1:0"
"#,
        )
        .unwrap();
        assert!(load_for(&cfg).unwrap().is_none());
    }
}
