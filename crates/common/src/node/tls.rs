use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use sha2::{Digest, Sha256};

/// A TLS identity: leaf certificate plus private key, both DER.
#[derive(Debug)]
pub struct TlsIdentity {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        TlsIdentity {
            cert: self.cert.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl TlsIdentity {
    /// Build an identity from DER-encoded certificate and PKCS#8 key.
    pub fn from_der(cert: Vec<u8>, key: Vec<u8>) -> Result<TlsIdentity, rustls::Error> {
        let key = PrivateKeyDer::try_from(key)
            .map_err(|e| rustls::Error::General(format!("invalid private key: {}", e)))?;

        Ok(TlsIdentity {
            cert: CertificateDer::from(cert),
            key,
        })
    }

    /// Fingerprint of the identity's certificate.
    pub fn fingerprint(&self) -> String {
        fingerprint(self.cert.as_ref())
    }
}

/// The canonical string form of a certificate fingerprint: SHA-256 of
/// the DER bytes, lower-case hex, one colon between every byte.
pub fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);

    let mut out = String::with_capacity(digest.len() * 3);
    for (i, b) in digest.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Client configuration with library verification disabled.
///
/// Trust is decided by the transport after the handshake, by comparing
/// the observed leaf fingerprint against the pinned one.
pub(crate) fn client_config(identity: &TlsIdentity) -> Result<ClientConfig, rustls::Error> {
    let provider = provider();

    ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
        .with_client_auth_cert(vec![identity.cert.clone()], identity.key.clone_key())
}

/// Server configuration presenting the node's certificate.
pub(crate) fn server_config(identity: &TlsIdentity) -> Result<ServerConfig, rustls::Error> {
    ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![identity.cert.clone()], identity.key.clone_key())
}

/// Certificate verifier that accepts any presented chain.
///
/// Verification is NOT skipped overall: the connection is only used
/// after its leaf fingerprint matched the peer's pinned fingerprint
/// (or was adopted on first use).
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

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
            &self.provider.signature_verification_algorithms,
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
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
