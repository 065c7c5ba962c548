//! ACME issuance via Let's Encrypt (or any RFC 8555 directory) with DNS-01

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use instant_acme::{
    Account as AcmeAccount, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier,
    NewAccount, NewOrder, OrderStatus, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dns::DnsProvider;
use crate::storage::Account;

/// Production Let's Encrypt directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Staging Let's Encrypt directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// ACME errors
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("Account creation failed: {0}")]
    AccountCreationFailed(String),

    #[error("Invalid account: {0}")]
    InvalidAccount(String),

    #[error("Order creation failed: {0}")]
    OrderCreationFailed(String),

    #[error("Challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("Certificate finalization failed: {0}")]
    FinalizationFailed(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid issuance resource: {0}")]
    InvalidResource(String),

    #[error("DNS provider error: {0}")]
    DnsProvider(String),
}

/// Result of a successful issuance
#[derive(Debug, Clone)]
pub struct Issuance {
    pub domain: String,
    /// PEM chain as downloaded from the CA, leaf first
    pub certificate_chain: Vec<u8>,
    /// PEM private key generated for the order
    pub private_key: Vec<u8>,
    /// Opaque blob handed back on renewal
    pub resource: Vec<u8>,
}

/// Performs account registration and certificate orders
#[async_trait]
pub trait IssuanceEngine: Send + Sync {
    /// Register a new account, terms of service accepted
    async fn register(&self, email: &str) -> Result<Account, AcmeError>;

    /// Order a bundled certificate for exactly one domain
    async fn obtain(&self, account: &Account, domain: &str) -> Result<Issuance, AcmeError>;

    /// Re-issue the certificate described by a previous issuance's resource
    async fn renew(&self, account: &Account, resource: &[u8]) -> Result<Issuance, AcmeError>;
}

/// Renewal information kept next to an issued certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceResource {
    pub domain: String,
    pub directory: String,
    pub issued_at: DateTime<Utc>,
}

/// ACME configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// ACME directory URL
    pub directory_url: String,
    /// PEM root used to reach a private directory (e.g. Pebble)
    pub directory_root: Option<PathBuf>,
    /// Wait after publishing DNS records before asking for validation
    pub propagation_delay: Duration,
    /// Upper bound for order and certificate polling
    pub poll_timeout: Duration,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            directory_root: None,
            propagation_delay: Duration::from_secs(60),
            poll_timeout: Duration::from_secs(300),
        }
    }
}

/// [`IssuanceEngine`] backed by `instant-acme` and a DNS-01 provider
pub struct AcmeEngine {
    config: AcmeConfig,
    dns: Arc<dyn DnsProvider>,
}

impl AcmeEngine {
    pub fn new(config: AcmeConfig, dns: Arc<dyn DnsProvider>) -> Self {
        crate::tls::ensure_crypto_provider();
        Self { config, dns }
    }

    async fn load_account(&self, account: &Account) -> Result<AcmeAccount, AcmeError> {
        let credentials: AccountCredentials = serde_json::from_slice(&account.registration)
            .map_err(|e| AcmeError::InvalidAccount(e.to_string()))?;

        let builder = match &self.config.directory_root {
            Some(root) => AcmeAccount::builder_with_root(root),
            None => AcmeAccount::builder(),
        }
        .map_err(|e| AcmeError::InvalidAccount(e.to_string()))?;

        builder
            .from_credentials(credentials)
            .await
            .map_err(|e| AcmeError::InvalidAccount(e.to_string()))
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .timeout(self.config.poll_timeout)
            .initial_delay(Duration::from_secs(2))
    }

    async fn issue(&self, account: &Account, domain: &str) -> Result<Issuance, AcmeError> {
        validate_domain(domain)?;
        let acme_account = self.load_account(account).await?;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = acme_account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| AcmeError::OrderCreationFailed(e.to_string()))?;

        debug!(domain = %domain, "Created order");

        let mut published = Vec::new();
        let result = self
            .complete_order(&mut order, domain, &mut published)
            .await;

        for (fqdn, value) in &published {
            if let Err(e) = self.dns.cleanup(fqdn, value).await {
                warn!(fqdn = %fqdn, error = %e, "Failed to remove DNS-01 record");
            }
        }

        let (certificate_chain, private_key) = result?;

        let resource = serde_json::to_vec(&IssuanceResource {
            domain: domain.to_string(),
            directory: self.config.directory_url.clone(),
            issued_at: Utc::now(),
        })
        .map_err(|e| AcmeError::InvalidResource(e.to_string()))?;

        info!(domain = %domain, "Certificate issued");

        Ok(Issuance {
            domain: domain.to_string(),
            certificate_chain: certificate_chain.into_bytes(),
            private_key: private_key.into_bytes(),
            resource,
        })
    }

    async fn complete_order(
        &self,
        order: &mut instant_acme::Order,
        domain: &str,
        published: &mut Vec<(String, String)>,
    ) -> Result<(String, String), AcmeError> {
        let mut submitted = 0usize;
        let mut authorizations = order.authorizations();
        while let Some(authz) = authorizations.next().await {
            let mut authz = authz.map_err(|e| AcmeError::ChallengeFailed(e.to_string()))?;
            match &authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(AcmeError::ChallengeFailed(format!(
                        "Authorization for {} is {:?}",
                        domain, status
                    )))
                }
            }

            let mut challenge = authz.challenge(ChallengeType::Dns01).ok_or_else(|| {
                AcmeError::ChallengeFailed(format!("No DNS-01 challenge offered for {}", domain))
            })?;

            let fqdn = format!("_acme-challenge.{}", domain.trim_start_matches("*."));
            let value = challenge.key_authorization().dns_value();
            self.dns.present(&fqdn, &value).await?;
            published.push((fqdn, value));

            if !self.config.propagation_delay.is_zero() {
                debug!(
                    delay_secs = self.config.propagation_delay.as_secs(),
                    "Waiting for DNS propagation"
                );
                tokio::time::sleep(self.config.propagation_delay).await;
            }

            challenge
                .set_ready()
                .await
                .map_err(|e| AcmeError::ChallengeFailed(e.to_string()))?;
            submitted += 1;
        }

        debug!(domain = %domain, challenges = submitted, "Challenges submitted");

        let retry = self.retry_policy();
        let status = order
            .poll_ready(&retry)
            .await
            .map_err(|e| AcmeError::ChallengeFailed(e.to_string()))?;
        if !matches!(status, OrderStatus::Ready | OrderStatus::Valid) {
            return Err(AcmeError::ChallengeFailed(format!(
                "Order for {} ended as {:?}",
                domain, status
            )));
        }

        let private_key = order
            .finalize()
            .await
            .map_err(|e| AcmeError::FinalizationFailed(e.to_string()))?;
        let certificate_chain = order
            .poll_certificate(&retry)
            .await
            .map_err(|e| AcmeError::FinalizationFailed(e.to_string()))?;

        Ok((certificate_chain, private_key))
    }
}

#[async_trait]
impl IssuanceEngine for AcmeEngine {
    async fn register(&self, email: &str) -> Result<Account, AcmeError> {
        let contact = format!("mailto:{}", email);
        let builder = match &self.config.directory_root {
            Some(root) => AcmeAccount::builder_with_root(root),
            None => AcmeAccount::builder(),
        }
        .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;

        let (_account, credentials) = builder
            .create(
                &NewAccount {
                    contact: &[contact.as_str()],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.config.directory_url.clone(),
                None,
            )
            .await
            .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;

        let registration = serde_json::to_vec(&credentials)
            .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;
        let private_key = account_key_pem(&registration)?;

        info!(email = %email, directory = %self.config.directory_url, "Registered ACME account");

        Ok(Account {
            email: email.to_string(),
            registration,
            private_key,
        })
    }

    async fn obtain(&self, account: &Account, domain: &str) -> Result<Issuance, AcmeError> {
        self.issue(account, domain).await
    }

    async fn renew(&self, account: &Account, resource: &[u8]) -> Result<Issuance, AcmeError> {
        let resource: IssuanceResource = serde_json::from_slice(resource)
            .map_err(|e| AcmeError::InvalidResource(e.to_string()))?;

        info!(
            domain = %resource.domain,
            issued_at = %resource.issued_at,
            "Renewing certificate"
        );
        self.issue(account, &resource.domain).await
    }
}

/// Account key of serialized credentials, as PKCS#8 PEM
fn account_key_pem(registration: &[u8]) -> Result<Vec<u8>, AcmeError> {
    let value: serde_json::Value = serde_json::from_slice(registration)
        .map_err(|e| AcmeError::InvalidAccount(e.to_string()))?;
    let encoded = value
        .get("key_pkcs8")
        .and_then(|key| key.as_str())
        .ok_or_else(|| AcmeError::InvalidAccount("Credentials carry no account key".to_string()))?;

    let der = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| AcmeError::InvalidAccount(e.to_string()))?;
    let key = rcgen::KeyPair::try_from(der.as_slice())
        .map_err(|e| AcmeError::InvalidAccount(e.to_string()))?;

    Ok(key.serialize_pem().into_bytes())
}

/// Validate domain name
pub fn validate_domain(domain: &str) -> Result<(), AcmeError> {
    if domain.is_empty() {
        return Err(AcmeError::InvalidDomain(
            "Domain cannot be empty".to_string(),
        ));
    }

    if domain.contains(' ') {
        return Err(AcmeError::InvalidDomain(
            "Domain cannot contain spaces".to_string(),
        ));
    }

    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(AcmeError::InvalidDomain(
            "Domain cannot start or end with a dot".to_string(),
        ));
    }

    if domain.matches('*').count() > 1 || (domain.contains('*') && !domain.starts_with("*.")) {
        return Err(AcmeError::InvalidDomain(
            "Wildcard is only allowed as the leftmost label".to_string(),
        ));
    }

    Ok(())
}
