//! Shared root authority for the mutually authenticated channel
//!
//! The server and every client hold the same root certificate and key. Each
//! side derives its own short-lived leaf from it at startup, so no per-peer
//! provisioning is needed: any leaf signed by the root is trusted.

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::path::Path;
use tracing::{debug, info};

use crate::{pem, CertError};

/// Common name used by both channel identities
pub const CHANNEL_COMMON_NAME: &str = "acmes";

/// Default validity of the root and of channel leaves, in days
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

/// Root certificate and key used to sign channel leaves
pub struct Authority {
    cert_pem: String,
    root_der: CertificateDer<'static>,
    issuer: rcgen::Certificate,
    key: KeyPair,
}

impl std::fmt::Debug for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authority")
            .field("root_der_len", &self.root_der.len())
            .finish()
    }
}

impl Authority {
    /// Generate a new self-signed root
    pub fn generate(common_name: &str, validity_days: u32) -> Result<Self, CertError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = Utc::now();
        params.not_before = to_offset(now - Duration::minutes(1))?;
        params.not_after = to_offset(now + Duration::days(i64::from(validity_days)))?;
        params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

        let key =
            KeyPair::generate().map_err(|e| CertError::KeyGenerationFailed(e.to_string()))?;
        let issuer = params
            .self_signed(&key)
            .map_err(|e| CertError::GenerationFailed(e.to_string()))?;

        info!(
            common_name = %common_name,
            validity_days,
            "Generated root authority"
        );

        Ok(Self {
            cert_pem: issuer.pem(),
            root_der: issuer.der().clone(),
            issuer,
            key,
        })
    }

    /// Load an existing root from PEM text
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CertError> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| CertError::InvalidPem(format!("Failed to parse root key: {}", e)))?;

        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| CertError::InvalidCertificate(format!("Failed to parse root: {}", e)))?;

        // Only used to sign leaves; peers trust the DER as loaded
        let issuer = params
            .self_signed(&key)
            .map_err(|e| CertError::GenerationFailed(e.to_string()))?;

        let root_der = pem::parse_chain(cert_pem.as_bytes())?.remove(0);

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            root_der,
            issuer,
            key,
        })
    }

    /// Load the root from PEM files
    pub async fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let cert_pem = tokio::fs::read_to_string(cert_path).await.map_err(|e| {
            CertError::InvalidPem(format!("Failed to read {}: {}", cert_path.display(), e))
        })?;
        let key_pem = tokio::fs::read_to_string(key_path).await.map_err(|e| {
            CertError::InvalidPem(format!("Failed to read {}: {}", key_path.display(), e))
        })?;

        let authority = Self::from_pem(&cert_pem, &key_pem)?;
        info!(
            "Root authority loaded from {} and {}",
            cert_path.display(),
            key_path.display()
        );
        Ok(authority)
    }

    /// Write `cert.pem` and `key.pem` into `dir`
    pub async fn save(&self, dir: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(dir).await?;

        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        tokio::fs::write(&cert_path, &self.cert_pem).await?;
        tokio::fs::write(&key_path, self.key.serialize_pem()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        info!("Root authority written to {}", dir.display());
        Ok(())
    }

    /// Root certificate as PEM
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Root private key as PEM
    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    /// Root certificate as DER, the only trust anchor of the channel
    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    /// Derive a leaf certificate signed by this root
    pub fn issue(&self, profile: &LeafProfile) -> Result<IssuedCertificate, CertError> {
        let mut params = CertificateParams::new(profile.names.clone())
            .map_err(|e| CertError::GenerationFailed(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, profile.common_name.as_str());
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let (not_before, not_after) = profile.validity();
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;
        params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

        let key =
            KeyPair::generate().map_err(|e| CertError::KeyGenerationFailed(e.to_string()))?;
        let cert = params
            .signed_by(&key, &self.issuer, &self.key)
            .map_err(|e| CertError::GenerationFailed(e.to_string()))?;

        debug!(
            common_name = %profile.common_name,
            names = ?profile.names,
            not_after = %not_after,
            "Issued leaf certificate"
        );

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert_der: cert.der().clone(),
            key_der: key.serialize_der(),
        })
    }
}

/// Subject and validity of a leaf to derive
#[derive(Debug, Clone)]
pub struct LeafProfile {
    pub common_name: String,
    /// Subject alternative names; IP literals become IP SANs
    pub names: Vec<String>,
    pub validity_days: u32,
    pub not_after: Option<DateTime<Utc>>,
}

impl LeafProfile {
    pub fn new(common_name: impl Into<String>, names: Vec<String>) -> Self {
        Self {
            common_name: common_name.into(),
            names,
            validity_days: DEFAULT_VALIDITY_DAYS,
            not_after: None,
        }
    }

    pub fn valid_for_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Pin the expiry; may lie in the past
    pub fn expires_at(mut self, not_after: DateTime<Utc>) -> Self {
        self.not_after = Some(not_after);
        self
    }

    fn validity(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        match self.not_after {
            Some(not_after) => {
                let not_before = std::cmp::min(now, not_after) - Duration::days(1);
                (not_before, not_after)
            }
            None => (
                now - Duration::minutes(1),
                now + Duration::days(i64::from(self.validity_days)),
            ),
        }
    }
}

/// A leaf certificate with its private key
#[derive(Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl IssuedCertificate {
    /// Private key in PKCS#8 DER form, for rustls
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

fn to_offset(at: DateTime<Utc>) -> Result<time::OffsetDateTime, CertError> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| CertError::GenerationFailed(e.to_string()))
}
