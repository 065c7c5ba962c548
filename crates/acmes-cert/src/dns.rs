//! DNS-01 challenge providers

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

use crate::acme::AcmeError;

/// Publishes and removes `_acme-challenge` TXT records
#[async_trait]
pub trait DnsProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Publish `value` as a TXT record at `fqdn`
    async fn present(&self, fqdn: &str, value: &str) -> Result<(), AcmeError>;

    /// Remove a record previously published with `present`
    async fn cleanup(&self, fqdn: &str, value: &str) -> Result<(), AcmeError>;
}

/// Settings for the built-in providers
#[derive(Debug, Clone, Default)]
pub struct DnsProviderConfig {
    /// Program run by the `exec` provider
    pub exec_path: Option<PathBuf>,
}

/// Resolve a provider by name
pub fn build_dns_provider(
    name: &str,
    config: &DnsProviderConfig,
) -> Result<Arc<dyn DnsProvider>, AcmeError> {
    match name {
        "exec" => {
            let program = config.exec_path.clone().ok_or_else(|| {
                AcmeError::DnsProvider("exec provider requires a program path".to_string())
            })?;
            Ok(Arc::new(ExecDnsProvider::new(program)))
        }
        other => Err(AcmeError::DnsProvider(format!(
            "Unknown DNS provider: {}",
            other
        ))),
    }
}

/// Runs `<program> [args..] present|cleanup <fqdn> <value>`
#[derive(Debug, Clone)]
pub struct ExecDnsProvider {
    program: PathBuf,
    args: Vec<String>,
}

impl ExecDnsProvider {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments placed before the action
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    async fn run(&self, action: &str, fqdn: &str, value: &str) -> Result<(), AcmeError> {
        debug!(
            program = %self.program.display(),
            action,
            fqdn,
            "Running DNS provider"
        );

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(action)
            .arg(fqdn)
            .arg(value)
            .output()
            .await
            .map_err(|e| {
                AcmeError::DnsProvider(format!(
                    "Failed to run {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(AcmeError::DnsProvider(format!(
                "{} {} exited with {}: {}",
                self.program.display(),
                action,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl DnsProvider for ExecDnsProvider {
    fn name(&self) -> &str {
        "exec"
    }

    async fn present(&self, fqdn: &str, value: &str) -> Result<(), AcmeError> {
        self.run("present", fqdn, value).await?;
        info!(fqdn, "Published DNS-01 record");
        Ok(())
    }

    async fn cleanup(&self, fqdn: &str, value: &str) -> Result<(), AcmeError> {
        self.run("cleanup", fqdn, value).await?;
        debug!(fqdn, "Removed DNS-01 record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_dns_provider() {
        let config = DnsProviderConfig {
            exec_path: Some(PathBuf::from("/usr/local/bin/dns-hook")),
        };
        assert_eq!(build_dns_provider("exec", &config).unwrap().name(), "exec");

        assert!(build_dns_provider("exec", &DnsProviderConfig::default()).is_err());
        assert!(build_dns_provider("route53", &config).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_provider_passes_arguments() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("calls.log");
        let script = format!("echo \"$0 $1 $2\" >> '{}'", log.display());

        let provider = ExecDnsProvider::new("/bin/sh").with_args(vec!["-c".to_string(), script]);
        provider
            .present("_acme-challenge.example.com", "token-value")
            .await
            .unwrap();
        provider
            .cleanup("_acme-challenge.example.com", "token-value")
            .await
            .unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(
            calls,
            "present _acme-challenge.example.com token-value\n\
             cleanup _acme-challenge.example.com token-value\n"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_provider_failure() {
        let provider = ExecDnsProvider::new("/bin/sh")
            .with_args(vec!["-c".to_string(), "echo nope >&2; exit 3".to_string()]);

        let err = provider.present("fqdn", "value").await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
