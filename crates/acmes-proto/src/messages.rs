//! Request and response bodies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{OBTAIN_PATH, RENEW_PATH};

/// Certificate operation exposed by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Return the cached certificate or issue a new one
    Obtain,
    /// Replace an existing certificate once it has expired
    Renew,
}

impl Operation {
    /// Request path for this operation
    pub fn path(&self) -> &'static str {
        match self {
            Operation::Obtain => OBTAIN_PATH,
            Operation::Renew => RENEW_PATH,
        }
    }

    /// Resolve an operation from a request path
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            OBTAIN_PATH => Some(Operation::Obtain),
            RENEW_PATH => Some(Operation::Renew),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Obtain => write!(f, "obtain"),
            Operation::Renew => write!(f, "renew"),
        }
    }
}

/// Body of `/obtain` and `/renew` requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRequest {
    pub domain: String,
}

impl DomainRequest {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }
}

/// Successful certificate response
///
/// Byte fields travel as standard base64 strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateResponse {
    /// Opaque issuance resource, needed by the server to renew
    #[serde(with = "base64_bytes")]
    pub resource: Vec<u8>,
    /// PEM certificate chain, leaf first
    #[serde(with = "base64_bytes")]
    pub cert: Vec<u8>,
    /// PEM private key matching the leaf
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    /// Expiry of the leaf certificate
    pub not_after: DateTime<Utc>,
}

/// Failure body returned with status 500
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub cause: String,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_operation_paths() {
        assert_eq!(Operation::Obtain.path(), "/obtain");
        assert_eq!(Operation::Renew.path(), "/renew");
        assert_eq!(Operation::from_path("/obtain"), Some(Operation::Obtain));
        assert_eq!(Operation::from_path("/renew"), Some(Operation::Renew));
        assert_eq!(Operation::from_path("/revoke"), None);
        assert_eq!(Operation::Renew.to_string(), "renew");
    }

    #[test]
    fn test_certificate_response_field_names() {
        let response = CertificateResponse {
            resource: b"{}".to_vec(),
            cert: b"cert".to_vec(),
            key: b"key".to_vec(),
            not_after: Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap(),
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["resource"], "e30=");
        assert_eq!(value["cert"], "Y2VydA==");
        assert_eq!(value["key"], "a2V5");
        assert_eq!(value["notAfter"], "2030-01-02T03:04:05Z");
        assert!(value.get("not_after").is_none());
    }

    #[test]
    fn test_certificate_response_rejects_invalid_base64() {
        let body = r#"{"resource":"!!","cert":"","key":"","notAfter":"2030-01-02T03:04:05Z"}"#;
        assert!(serde_json::from_str::<CertificateResponse>(body).is_err());
    }

    #[test]
    fn test_domain_request_json() {
        let request: DomainRequest = serde_json::from_str(r#"{"domain":"*.example.com"}"#).unwrap();
        assert_eq!(request, DomainRequest::new("*.example.com"));
    }
}
