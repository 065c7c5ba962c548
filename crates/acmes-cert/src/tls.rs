//! rustls configurations for the mutually authenticated channel

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::sync::Arc;
use tracing::debug;

use crate::authority::{Authority, LeafProfile, CHANNEL_COMMON_NAME};
use crate::{pem, CertError};

/// How the client checks the server certificate's names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostnameVerification {
    /// Standard WebPKI name checks against the dialed host
    Strict,
    /// Only require a chain to the shared root; the server may be reached
    /// under any address
    #[default]
    Skip,
}

impl std::str::FromStr for HostnameVerification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(HostnameVerification::Strict),
            "skip" => Ok(HostnameVerification::Skip),
            _ => Err(format!("Unknown hostname verification policy: {}", s)),
        }
    }
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install ring as the process-wide rustls provider.
///
/// Needed by components that build rustls configs without an explicit
/// provider, such as the ACME HTTP client.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Rustls crypto provider already installed");
        }
    });
}

/// Crypto provider used by every config in this workspace
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn root_store(authority: &Authority) -> Result<RootCertStore, CertError> {
    let mut roots = RootCertStore::empty();
    roots
        .add(authority.root_der().clone())
        .map_err(|e| CertError::Tls(format!("Failed to add root certificate: {}", e)))?;
    Ok(roots)
}

/// Server config that requires a client certificate signed by the root
pub fn server_tls_config(
    authority: &Authority,
    server_names: &[String],
) -> Result<ServerConfig, CertError> {
    let leaf = authority.issue(&LeafProfile::new(
        CHANNEL_COMMON_NAME,
        server_names.to_vec(),
    ))?;
    let provider = crypto_provider();

    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(authority)?), provider.clone())
            .build()
            .map_err(|e| CertError::Tls(format!("Failed to build client verifier: {}", e)))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CertError::Tls(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![leaf.cert_der.clone()], leaf.private_key())
        .map_err(|e| CertError::Tls(format!("Invalid server cert/key: {}", e)))?;

    debug!(names = ?server_names, "Built mTLS server config");
    Ok(config)
}

/// Client config presenting a leaf signed by the root
pub fn client_tls_config(
    authority: &Authority,
    policy: HostnameVerification,
) -> Result<ClientConfig, CertError> {
    let leaf = authority.issue(&LeafProfile::new(
        CHANNEL_COMMON_NAME,
        vec![CHANNEL_COMMON_NAME.to_string()],
    ))?;
    let provider = crypto_provider();
    let roots = root_store(authority)?;

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| CertError::Tls(e.to_string()))?;

    let builder = match policy {
        HostnameVerification::Strict => builder.with_root_certificates(roots),
        HostnameVerification::Skip => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(RootOnlyVerifier::new(roots, provider))),
    };

    let config = builder
        .with_client_auth_cert(vec![leaf.cert_der.clone()], leaf.private_key())
        .map_err(|e| CertError::Tls(format!("Invalid client cert/key: {}", e)))?;

    debug!(policy = ?policy, "Built mTLS client config");
    Ok(config)
}

/// Build a signing-ready certificate from a PEM chain and key
pub fn certified_key(chain_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey, CertError> {
    let chain = pem::parse_chain(chain_pem)?;
    let key = pem::parse_private_key(key_pem)?;

    let signing_key = crypto_provider()
        .key_provider
        .load_private_key(key)
        .map_err(|e| CertError::Tls(format!("Unsupported private key: {}", e)))?;

    Ok(CertifiedKey::new(chain, signing_key))
}

/// Verifies the chain to the shared root and nothing else
#[derive(Debug)]
struct RootOnlyVerifier {
    roots: RootCertStore,
    provider: Arc<CryptoProvider>,
}

impl RootOnlyVerifier {
    fn new(roots: RootCertStore, provider: Arc<CryptoProvider>) -> Self {
        Self { roots, provider }
    }
}

impl ServerCertVerifier for RootOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
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
