//! mTLS HTTP client for the acmes server

use acmes_cert::tls::certified_key;
use acmes_cert::{client_tls_config, Authority, HostnameVerification};
use acmes_proto::{CertificateResponse, DomainRequest, ErrorResponse, Operation, ACME_CONTENT_TYPE};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::resolver::RenewableCertResolver;
use crate::scheduler::{RemoteCertificates, RenewalHandle, RenewalScheduler, RENEW_RETRY_DELAY};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Server returned {status}: {cause}")]
    Status { status: u16, cause: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Domain must not be empty")]
    EmptyDomain,
}

/// Client for `POST /obtain` and `POST /renew`
///
/// Each request uses a fresh connection; certificate traffic is rare.
#[derive(Clone)]
pub struct AcmesClient {
    server_addr: String,
    host: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    retry_delay: Duration,
}

impl AcmesClient {
    /// Client presenting a leaf derived from the shared root
    pub fn new(
        server_addr: impl Into<String>,
        server_name: &str,
        authority: &Authority,
        policy: HostnameVerification,
    ) -> Result<Self, ClientError> {
        let config =
            client_tls_config(authority, policy).map_err(|e| ClientError::Tls(e.to_string()))?;
        Self::with_tls_config(server_addr, server_name, config)
    }

    /// Client using a caller-built TLS configuration
    pub fn with_tls_config(
        server_addr: impl Into<String>,
        server_name: &str,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let host = server_name.to_string();
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| ClientError::Tls(format!("Invalid server name '{}': {}", host, e)))?;

        Ok(Self {
            server_addr: server_addr.into(),
            host,
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
            retry_delay: RENEW_RETRY_DELAY,
        })
    }

    /// Delay between failed renewal attempts of certificates from [`obtain`](Self::obtain)
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Obtain a certificate and keep it renewed in the background.
    ///
    /// The returned config always presents the latest certificate. Renewal
    /// runs until [`RenewalHandle::cancel`] is called.
    pub async fn obtain(
        &self,
        domain: &str,
    ) -> Result<(Arc<ServerConfig>, RenewalHandle), ClientError> {
        let domain = domain.trim();
        let response = self.obtain_certificate(domain).await?;

        let key = certified_key(&response.cert, &response.key)
            .map_err(|e| ClientError::InvalidCertificate(e.to_string()))?;
        let resolver = Arc::new(RenewableCertResolver::new(key));
        let config = resolver.server_config()?;

        info!(
            domain = %domain,
            not_after = %response.not_after,
            "Obtained certificate"
        );

        let handle = RenewalScheduler::new(Arc::new(self.clone()), resolver)
            .with_retry_delay(self.retry_delay)
            .start(domain, response.not_after);

        Ok((Arc::new(config), handle))
    }

    /// Perform one operation against the server
    pub async fn send(
        &self,
        operation: Operation,
        domain: &str,
    ) -> Result<CertificateResponse, ClientError> {
        let domain = domain.trim();
        if domain.is_empty() {
            return Err(ClientError::EmptyDomain);
        }

        let stream = TcpStream::connect(&self.server_addr).await.map_err(|e| {
            ClientError::Transport(format!("Failed to connect to {}: {}", self.server_addr, e))
        })?;

        let tls_stream = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| ClientError::Tls(format!("Handshake failed: {}", e)))?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(tls_stream))
            .await
            .map_err(|e| ClientError::Transport(format!("HTTP handshake failed: {}", e)))?;

        // Spawn connection driver
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Connection closed: {}", e);
            }
        });

        let body = serde_json::to_vec(&DomainRequest::new(domain))
            .map_err(|e| ClientError::Decode(e.to_string()))?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(operation.path())
            .header(HOST, self.host.as_str())
            .header(CONTENT_TYPE, ACME_CONTENT_TYPE)
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ClientError::Transport(format!("Failed to build request: {}", e)))?;

        debug!(operation = %operation, domain = %domain, "Sending request");

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ClientError::Transport(format!("Failed to send request: {}", e)))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ClientError::Transport(format!("Failed to read response body: {}", e)))?
            .to_bytes();

        if status != StatusCode::OK {
            let cause = match serde_json::from_slice::<ErrorResponse>(&body) {
                Ok(error) => error.cause,
                Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
            };
            return Err(ClientError::Status {
                status: status.as_u16(),
                cause,
            });
        }

        serde_json::from_slice(&body).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteCertificates for AcmesClient {
    async fn obtain_certificate(&self, domain: &str) -> Result<CertificateResponse, ClientError> {
        self.send(Operation::Obtain, domain).await
    }

    async fn renew_certificate(&self, domain: &str) -> Result<CertificateResponse, ClientError> {
        self.send(Operation::Renew, domain).await
    }
}
