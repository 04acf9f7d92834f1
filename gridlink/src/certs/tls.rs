//! rustls configuration built from a [`CertBundle`].
//!
//! Both sides use the `ring` provider explicitly rather than the process
//! default, so the node behaves the same whichever rustls features other
//! crates in the build happen to enable.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use super::CertBundle;

/// The bundle is loaded but rustls refuses to build a config from it
/// (key does not match the chain, unsupported algorithm, ...).
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TlsConfigError(pub String);

impl From<rustls::Error> for TlsConfigError {
    fn from(e: rustls::Error) -> Self {
        Self(e.to_string())
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn root_store(bundle: &CertBundle) -> Result<RootCertStore, TlsConfigError> {
    let mut roots = RootCertStore::empty();
    for cert in bundle.ca_roots() {
        roots
            .add(cert.clone())
            .map_err(|e| TlsConfigError(format!("unusable CA certificate: {}", e)))?;
    }
    Ok(roots)
}

/// Server side: presents the node's server chain and, unless the bundle is
/// insecure, requires a client certificate issued by the CA bundle.
pub fn server_config(bundle: &CertBundle) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?;

    let builder = if bundle.insecure() {
        builder.with_no_client_auth()
    } else {
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(bundle)?), provider())
                .build()
                .map_err(|e| TlsConfigError(format!("client verifier: {}", e)))?;
        builder.with_client_cert_verifier(verifier)
    };

    let config = builder.with_single_cert(bundle.server_chain().to_vec(), bundle.server_key())?;
    Ok(Arc::new(config))
}

/// Client side: presents the node's client chain and verifies the peer
/// against the CA bundle, unless the bundle is insecure.
pub fn client_config(bundle: &CertBundle) -> Result<Arc<ClientConfig>, TlsConfigError> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?;

    let builder = if bundle.insecure() {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider())))
    } else {
        builder.with_root_certificates(root_store(bundle)?)
    };

    let config =
        builder.with_client_auth_cert(bundle.client_chain().to_vec(), bundle.client_key())?;
    Ok(Arc::new(config))
}

/// Verifier used for `tls_insecure`: signatures are still checked so the
/// handshake is well-formed, but the chain is not.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
