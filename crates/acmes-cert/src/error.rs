use thiserror::Error;

/// Errors from certificate generation, parsing and TLS configuration
#[derive(Debug, Error)]
pub enum CertError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("Invalid PEM: {0}")]
    InvalidPem(String),

    #[error("Invalid X.509 certificate: {0}")]
    InvalidCertificate(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

/// Certificate store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Corrupt stored artifact {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Unsupported store URI: {0}")]
    UnsupportedUri(String),

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertError),
}
