//! Certificate management for acmes
//!
//! Trust bootstrap for the mutually authenticated channel, the certificate
//! store, and ACME issuance with DNS-01 challenges.

pub mod acme;
pub mod authority;
pub mod dns;
mod error;
pub mod pem;
pub mod storage;
pub mod tls;

pub use acme::{AcmeConfig, AcmeEngine, AcmeError, Issuance, IssuanceEngine};
pub use authority::{Authority, IssuedCertificate, LeafProfile};
pub use dns::{build_dns_provider, DnsProvider, DnsProviderConfig, ExecDnsProvider};
pub use error::{CertError, StorageError};
pub use storage::{open_store, Account, CertificateRecord, CertificateStore, FileStore};
pub use tls::{client_tls_config, ensure_crypto_provider, server_tls_config, HostnameVerification};
