//! Hot-swappable server certificate

use arc_swap::ArcSwap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::sync::Arc;

use acmes_cert::tls::crypto_provider;

use crate::client::ClientError;

/// Serves whatever certificate was stored last.
///
/// Handshakes load a complete snapshot, so a concurrent [`swap`](Self::swap)
/// is never observed half-applied.
pub struct RenewableCertResolver {
    current: ArcSwap<CertifiedKey>,
}

impl RenewableCertResolver {
    pub fn new(initial: CertifiedKey) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Replace the served certificate
    pub fn swap(&self, key: CertifiedKey) {
        self.current.store(Arc::new(key));
    }

    pub fn current(&self) -> Arc<CertifiedKey> {
        self.current.load_full()
    }

    /// Server config that always presents the current certificate
    pub fn server_config(self: &Arc<Self>) -> Result<ServerConfig, ClientError> {
        let config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| ClientError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(self.clone());
        Ok(config)
    }
}

impl std::fmt::Debug for RenewableCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewableCertResolver")
            .field("chain_len", &self.current.load().cert.len())
            .finish()
    }
}

impl ResolvesServerCert for RenewableCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current.load_full())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acmes_cert::tls::certified_key;
    use acmes_cert::{Authority, LeafProfile};

    fn leaf(authority: &Authority, name: &str) -> CertifiedKey {
        let issued = authority
            .issue(&LeafProfile::new(name, vec![name.to_string()]))
            .unwrap();
        certified_key(issued.cert_pem.as_bytes(), issued.key_pem.as_bytes()).unwrap()
    }

    #[test]
    fn test_swap_replaces_snapshot() {
        let authority = Authority::generate("test ca", 1).unwrap();
        let first = leaf(&authority, "a.example.com");
        let second = leaf(&authority, "b.example.com");
        let second_der = second.cert[0].clone();

        let resolver = RenewableCertResolver::new(first);
        let before = resolver.current();
        resolver.swap(second);

        assert_eq!(resolver.current().cert[0], second_der);
        // Earlier snapshots stay intact for in-flight handshakes
        assert_ne!(before.cert[0], second_der);
    }

    #[test]
    fn test_server_config_builds() {
        let authority = Authority::generate("test ca", 1).unwrap();
        let resolver = Arc::new(RenewableCertResolver::new(leaf(&authority, "example.com")));
        assert!(resolver.server_config().is_ok());
    }
}
