//! Issuance coordination
//!
//! Turns "give me a certificate for D" into a cached, idempotent operation:
//! the store answers whenever it can, the issuance engine is only called on a
//! miss (obtain) or after expiry (renew), and identical concurrent requests
//! share one execution.

use acmes_cert::{
    Account, AcmeError, CertError, CertificateRecord, CertificateStore, Issuance, IssuanceEngine,
    StorageError,
};
use acmes_proto::Operation;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, info};

use crate::coalesce::Coalescer;

/// Coordinator errors
///
/// Payloads are rendered messages so that one failure can be handed to every
/// coalesced caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("certificate for {0} has not been obtained")]
    NotObtained(String),

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("issuance failed: {0}")]
    Issuance(String),

    #[error("invalid certificate: {0}")]
    Parse(String),

    #[error("request aborted: {0}")]
    Aborted(String),
}

impl From<StorageError> for CoordinatorError {
    fn from(e: StorageError) -> Self {
        CoordinatorError::Store(e.to_string())
    }
}

impl From<AcmeError> for CoordinatorError {
    fn from(e: AcmeError) -> Self {
        CoordinatorError::Issuance(e.to_string())
    }
}

impl From<CertError> for CoordinatorError {
    fn from(e: CertError) -> Self {
        CoordinatorError::Parse(e.to_string())
    }
}

impl From<JoinError> for CoordinatorError {
    fn from(e: JoinError) -> Self {
        CoordinatorError::Aborted(e.to_string())
    }
}

/// Coalescing key: one execution per (operation, email, domain)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BarrierKey {
    operation: Operation,
    email: String,
    domain: String,
}

#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn CertificateStore>,
    engine: Arc<dyn IssuanceEngine>,
    certificates: Coalescer<BarrierKey, CertificateRecord, CoordinatorError>,
    accounts: Coalescer<String, Account, CoordinatorError>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn CertificateStore>, engine: Arc<dyn IssuanceEngine>) -> Self {
        Self {
            store,
            engine,
            certificates: Coalescer::new(),
            accounts: Coalescer::new(),
        }
    }

    /// Return the stored certificate for `domain`, issuing one on a miss.
    ///
    /// A stored certificate is returned as is, even when expired.
    pub async fn obtain(
        &self,
        email: &str,
        domain: &str,
    ) -> Result<CertificateRecord, CoordinatorError> {
        self.coalesced(Operation::Obtain, email, domain).await
    }

    /// Replace an expired certificate.
    ///
    /// Fails when `domain` was never obtained. While the stored certificate is
    /// still valid it is returned without contacting the engine.
    pub async fn renew(
        &self,
        email: &str,
        domain: &str,
    ) -> Result<CertificateRecord, CoordinatorError> {
        self.coalesced(Operation::Renew, email, domain).await
    }

    /// Load the account for `email`, registering it on first use
    pub async fn ensure_account(&self, email: &str) -> Result<Account, CoordinatorError> {
        let this = self.clone();
        let owned = email.to_string();
        self.accounts
            .run(email.to_string(), move || async move {
                if let Some(account) = this.store.get_account(&owned).await? {
                    return Ok(account);
                }

                info!(email = %owned, "Registering account");
                let account = this.engine.register(&owned).await?;
                this.store.save_account(&account).await?;
                Ok(account)
            })
            .await
    }

    async fn coalesced(
        &self,
        operation: Operation,
        email: &str,
        domain: &str,
    ) -> Result<CertificateRecord, CoordinatorError> {
        let domain = domain.trim();
        if domain.is_empty() {
            return Err(CoordinatorError::InvalidDomain(
                "domain cannot be empty".to_string(),
            ));
        }

        let key = BarrierKey {
            operation,
            email: email.to_string(),
            domain: domain.to_string(),
        };
        let this = self.clone();
        self.certificates
            .run(key.clone(), move || async move {
                match key.operation {
                    Operation::Obtain => this.obtain_now(&key.email, &key.domain).await,
                    Operation::Renew => this.renew_now(&key.email, &key.domain).await,
                }
            })
            .await
    }

    async fn obtain_now(
        &self,
        email: &str,
        domain: &str,
    ) -> Result<CertificateRecord, CoordinatorError> {
        debug!(domain = %domain, "Begin obtain");

        if let Some(record) = self.store.get_certificate(email, domain).await? {
            debug!(domain = %domain, not_after = %record.not_after, "Serving stored certificate");
            return Ok(record);
        }

        let account = self.ensure_account(email).await?;
        let issuance = self.engine.obtain(&account, domain).await?;
        let record = self.persist(email, domain, issuance).await?;

        info!(domain = %domain, not_after = %record.not_after, "Obtained certificate");
        Ok(record)
    }

    async fn renew_now(
        &self,
        email: &str,
        domain: &str,
    ) -> Result<CertificateRecord, CoordinatorError> {
        debug!(domain = %domain, "Begin renew");

        let Some(record) = self.store.get_certificate(email, domain).await? else {
            return Err(CoordinatorError::NotObtained(domain.to_string()));
        };

        if record.is_valid_at(Utc::now()) {
            debug!(
                domain = %domain,
                not_after = %record.not_after,
                "Certificate still valid, serving stored copy"
            );
            return Ok(record);
        }

        let account = self.ensure_account(email).await?;
        let issuance = self.engine.renew(&account, &record.resource).await?;
        let record = self.persist(email, domain, issuance).await?;

        info!(domain = %domain, not_after = %record.not_after, "Renewed certificate");
        Ok(record)
    }

    async fn persist(
        &self,
        email: &str,
        domain: &str,
        issuance: Issuance,
    ) -> Result<CertificateRecord, CoordinatorError> {
        let record = CertificateRecord::from_chain(
            email,
            domain,
            issuance.resource,
            issuance.certificate_chain,
            issuance.private_key,
        )?;
        Ok(self.store.save_certificate(&record).await?)
    }
}
