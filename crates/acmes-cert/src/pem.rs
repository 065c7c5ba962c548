//! PEM and X.509 helpers shared by the store, the coordinator and the client

use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::CertError;

/// Parse every certificate of a PEM bundle, leaf first
pub fn parse_chain(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let chain = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::InvalidPem(format!("Failed to parse certificates: {}", e)))?;

    if chain.is_empty() {
        return Err(CertError::InvalidPem(
            "No certificate found in PEM".to_string(),
        ));
    }

    Ok(chain)
}

/// Parse the first private key of a PEM document
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, CertError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| CertError::InvalidPem(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| CertError::InvalidPem("No private key found in PEM".to_string()))
}

/// Expiry of the leaf (first) certificate of a PEM chain, second precision
pub fn leaf_not_after(chain_pem: &[u8]) -> Result<DateTime<Utc>, CertError> {
    let chain = parse_chain(chain_pem)?;
    not_after(&chain[0])
}

/// Expiry of a single DER certificate
pub fn not_after(cert: &CertificateDer<'_>) -> Result<DateTime<Utc>, CertError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| CertError::InvalidCertificate(e.to_string()))?;

    let timestamp = parsed.validity().not_after.timestamp();
    DateTime::from_timestamp(timestamp, 0).ok_or_else(|| {
        CertError::InvalidCertificate(format!("notAfter out of range: {}", timestamp))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{Authority, LeafProfile};
    use chrono::TimeZone;

    #[test]
    fn test_leaf_not_after_reads_first_certificate() {
        let authority = Authority::generate("test root", 365).unwrap();
        let expiry = Utc.with_ymd_and_hms(2031, 6, 1, 12, 30, 45).unwrap();
        let leaf = authority
            .issue(&LeafProfile::new("leaf", vec!["leaf.example.com".to_string()]).expires_at(expiry))
            .unwrap();

        // Bundle with the root after the leaf; the root expires a year from now
        let bundle = format!("{}{}", leaf.cert_pem, authority.cert_pem());
        assert_eq!(leaf_not_after(bundle.as_bytes()).unwrap(), expiry);
    }

    #[test]
    fn test_leaf_not_after_rejects_garbage() {
        assert!(leaf_not_after(b"not a certificate").is_err());
        assert!(leaf_not_after(b"").is_err());
    }

    #[test]
    fn test_parse_private_key() {
        let authority = Authority::generate("test root", 1).unwrap();
        let leaf = authority
            .issue(&LeafProfile::new("leaf", vec!["leaf".to_string()]))
            .unwrap();

        assert!(parse_private_key(leaf.key_pem.as_bytes()).is_ok());
        assert!(parse_private_key(leaf.cert_pem.as_bytes()).is_err());
    }
}
