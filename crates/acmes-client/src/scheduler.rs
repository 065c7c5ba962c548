//! Background certificate renewal
//!
//! A scheduler sleeps until the served certificate's `notAfter`, asks the
//! server to renew it, and swaps the result into the resolver. Failed attempts
//! are retried after a fixed delay, indefinitely, until the handle is
//! cancelled. A renewal that comes back already expired by the local clock
//! is also retried after that delay; only the first deadline may fire at once.

use acmes_cert::tls::certified_key;
use acmes_proto::CertificateResponse;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientError;
use crate::resolver::RenewableCertResolver;

/// Delay before retrying a failed renewal
pub const RENEW_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Wall-clock source for computing renewal deadlines
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Remote side of certificate issuance
#[async_trait]
pub trait RemoteCertificates: Send + Sync {
    async fn obtain_certificate(&self, domain: &str) -> Result<CertificateResponse, ClientError>;

    async fn renew_certificate(&self, domain: &str) -> Result<CertificateResponse, ClientError>;
}

pub struct RenewalScheduler {
    remote: Arc<dyn RemoteCertificates>,
    resolver: Arc<RenewableCertResolver>,
    clock: Arc<dyn Clock>,
    retry_delay: Duration,
}

impl RenewalScheduler {
    pub fn new(remote: Arc<dyn RemoteCertificates>, resolver: Arc<RenewableCertResolver>) -> Self {
        Self {
            remote,
            resolver,
            clock: Arc::new(SystemClock),
            retry_delay: RENEW_RETRY_DELAY,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Spawn the renewal task for `domain`, first firing at `not_after`
    pub fn start(self, domain: impl Into<String>, not_after: DateTime<Utc>) -> RenewalHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(self.run(domain.into(), not_after, token.clone()));
        RenewalHandle { token, task }
    }

    async fn run(self, domain: String, not_after: DateTime<Utc>, cancel: CancellationToken) {
        let mut delay = self.until(not_after);

        loop {
            debug!(domain = %domain, delay_secs = delay.as_secs(), "Renewal armed");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.renew_once(&domain) => result,
            };

            delay = match result {
                Ok(not_after) => {
                    info!(domain = %domain, not_after = %not_after, "Certificate renewed");
                    let delay = self.until(not_after);
                    if delay.is_zero() {
                        // Already expired here: the server's clock lags ours
                        warn!(
                            domain = %domain,
                            retry_secs = self.retry_delay.as_secs(),
                            "Renewed certificate is already past notAfter"
                        );
                        self.retry_delay
                    } else {
                        delay
                    }
                }
                Err(e) => {
                    warn!(
                        domain = %domain,
                        retry_secs = self.retry_delay.as_secs(),
                        "Certificate renewal failed: {}",
                        e
                    );
                    self.retry_delay
                }
            };
        }

        debug!(domain = %domain, "Renewal cancelled");
    }

    async fn renew_once(&self, domain: &str) -> Result<DateTime<Utc>, ClientError> {
        let response = self.remote.renew_certificate(domain).await?;
        let key = certified_key(&response.cert, &response.key)
            .map_err(|e| ClientError::InvalidCertificate(e.to_string()))?;
        self.resolver.swap(key);
        Ok(response.not_after)
    }

    /// Time left until `deadline`; past deadlines are due now
    fn until(&self, deadline: DateTime<Utc>) -> Duration {
        (deadline - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Controls a running renewal task
#[derive(Debug)]
pub struct RenewalHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl RenewalHandle {
    /// Stop renewing. No remote call is made after this returns.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Renewal task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acmes_cert::{Authority, LeafProfile};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// Wall clock that follows tokio's (pausable) clock
    struct TokioClock {
        base: DateTime<Utc>,
        start: Instant,
    }

    impl TokioClock {
        fn new() -> Self {
            Self {
                base: Utc::now(),
                start: Instant::now(),
            }
        }
    }

    impl Clock for TokioClock {
        fn now(&self) -> DateTime<Utc> {
            self.base + chrono::Duration::from_std(self.start.elapsed()).unwrap()
        }
    }

    struct FakeRemote {
        authority: Authority,
        clock: Arc<TokioClock>,
        failures: AtomicUsize,
        /// Renewals report a notAfter already behind the local clock
        stale: bool,
        calls: AtomicUsize,
        events: mpsc::UnboundedSender<Instant>,
    }

    impl FakeRemote {
        fn issue(&self, domain: &str) -> CertificateResponse {
            let not_after = self.clock.now() + chrono::Duration::hours(1);
            let leaf = self
                .authority
                .issue(&LeafProfile::new(domain, vec![domain.to_string()]).expires_at(not_after))
                .unwrap();
            CertificateResponse {
                resource: Vec::new(),
                cert: leaf.cert_pem.into_bytes(),
                key: leaf.key_pem.into_bytes(),
                not_after,
            }
        }
    }

    #[async_trait]
    impl RemoteCertificates for FakeRemote {
        async fn obtain_certificate(
            &self,
            domain: &str,
        ) -> Result<CertificateResponse, ClientError> {
            Ok(self.issue(domain))
        }

        async fn renew_certificate(&self, domain: &str) -> Result<CertificateResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.events.send(Instant::now());

            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ClientError::Transport("connection refused".to_string()));
            }

            let mut response = self.issue(domain);
            if self.stale {
                response.not_after = self.clock.now() - chrono::Duration::seconds(2);
            }
            Ok(response)
        }
    }

    struct Harness {
        remote: Arc<FakeRemote>,
        resolver: Arc<RenewableCertResolver>,
        clock: Arc<TokioClock>,
        events: mpsc::UnboundedReceiver<Instant>,
    }

    fn harness(failures: usize) -> Harness {
        build_harness(failures, false)
    }

    fn build_harness(failures: usize, stale: bool) -> Harness {
        let clock = Arc::new(TokioClock::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let remote = Arc::new(FakeRemote {
            authority: Authority::generate("test ca", 1).unwrap(),
            clock: clock.clone(),
            failures: AtomicUsize::new(failures),
            stale,
            calls: AtomicUsize::new(0),
            events: tx,
        });

        let initial = remote.issue("example.com");
        let key = certified_key(&initial.cert, &initial.key).unwrap();

        Harness {
            remote,
            resolver: Arc::new(RenewableCertResolver::new(key)),
            clock,
            events: rx,
        }
    }

    impl Harness {
        fn scheduler(&self) -> RenewalScheduler {
            RenewalScheduler::new(self.remote.clone(), self.resolver.clone())
                .with_clock(self.clock.clone())
        }
    }

    fn assert_retry_gap(gap: Duration, expected: Duration) {
        assert!(gap >= expected, "gap {:?} shorter than {:?}", gap, expected);
        assert!(gap < expected + Duration::from_millis(10), "gap {:?}", gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_fires_immediately() {
        let mut h = harness(0);
        let start = Instant::now();

        let handle = h
            .scheduler()
            .start("example.com", h.clock.now() - chrono::Duration::hours(2));

        let fired_at = h.events.recv().await.unwrap();
        assert!(fired_at - start < Duration::from_millis(10));

        handle.cancel();
        handle.join().await;
        assert_eq!(h.remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_deadline() {
        let mut h = harness(0);
        let start = Instant::now();

        let handle = h
            .scheduler()
            .start("example.com", h.clock.now() + chrono::Duration::minutes(30));

        let fired_at = h.events.recv().await.unwrap();
        assert!(fired_at - start >= Duration::from_secs(30 * 60));
        assert!(fired_at - start < Duration::from_secs(30 * 60 + 1));

        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_remote_calls() {
        let h = harness(0);

        let handle = h
            .scheduler()
            .start("example.com", h.clock.now() + chrono::Duration::seconds(10));
        handle.cancel();
        assert!(handle.is_cancelled());

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(handle.is_finished());
        assert_eq!(h.remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_after_failure() {
        let mut h = harness(2);
        let start = Instant::now();

        let handle = h.scheduler().start("example.com", h.clock.now());

        let first = h.events.recv().await.unwrap();
        let second = h.events.recv().await.unwrap();
        let third = h.events.recv().await.unwrap();

        assert!(first - start < Duration::from_millis(10));
        assert_retry_gap(second - first, RENEW_RETRY_DELAY);
        assert_retry_gap(third - second, RENEW_RETRY_DELAY);

        handle.cancel();
        handle.join().await;
        assert_eq!(h.remote.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_retry_delay() {
        let mut h = harness(1);

        let handle = h
            .scheduler()
            .with_retry_delay(Duration::from_secs(5))
            .start("example.com", h.clock.now());

        let first = h.events.recv().await.unwrap();
        let second = h.events.recv().await.unwrap();
        assert_retry_gap(second - first, Duration::from_secs(5));

        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_swaps_certificate() {
        let mut h = harness(0);
        let initial = h.resolver.current();

        let handle = h.scheduler().start("example.com", h.clock.now());
        h.events.recv().await.unwrap();

        // The swap lands right after the remote call returns
        for _ in 0..10 {
            if h.resolver.current().cert[0] != initial.cert[0] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_ne!(h.resolver.current().cert[0], initial.cert[0]);

        // Re-armed for the new deadline, an hour out
        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        assert_eq!(h.remote.calls.load(Ordering::SeqCst), 1);

        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_renewal_waits_retry_delay() {
        let mut h = build_harness(0, true);
        let start = Instant::now();

        let handle = h
            .scheduler()
            .start("example.com", h.clock.now() - chrono::Duration::seconds(2));

        let first = h.events.recv().await.unwrap();
        let second = h.events.recv().await.unwrap();
        let third = h.events.recv().await.unwrap();

        assert!(first - start < Duration::from_millis(10));
        assert_retry_gap(second - first, RENEW_RETRY_DELAY);
        assert_retry_gap(third - second, RENEW_RETRY_DELAY);

        handle.cancel();
        handle.join().await;
        assert_eq!(h.remote.calls.load(Ordering::SeqCst), 3);
    }
}
