//! acmes - distribute ACME certificates over a mutually authenticated channel

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use acmes_cert::acme::LETS_ENCRYPT_PRODUCTION;
use acmes_cert::authority::{CHANNEL_COMMON_NAME, DEFAULT_VALIDITY_DAYS};
use acmes_cert::{
    build_dns_provider, ensure_crypto_provider, open_store, server_tls_config, AcmeConfig,
    AcmeEngine, Authority, DnsProviderConfig,
};
use acmes_server::{build_router, AcmesServer, AppState, Coordinator};

const DEFAULT_PORT: u16 = 443;

#[derive(Parser, Debug)]
#[command(name = "acmes")]
#[command(about = "Issue and renew ACME certificates for mTLS clients", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate the root CA shared by server and clients
    Ca {
        /// Common name of the root certificate
        #[arg(long, default_value = CHANNEL_COMMON_NAME)]
        cn: String,

        /// Validity in days
        #[arg(long, default_value_t = DEFAULT_VALIDITY_DAYS)]
        expires: u32,

        /// Directory receiving cert.pem and key.pem
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },

    /// Run the certificate server
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Listen port (0 selects the default)
    #[arg(long, env = "ACMES_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Root CA certificate (PEM)
    #[arg(long, env = "ACMES_CA")]
    ca: PathBuf,

    /// Root CA private key (PEM)
    #[arg(long, env = "ACMES_CAKEY")]
    cakey: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ACMES_LOG_LEVEL", default_value = "info")]
    level: String,

    /// Certificate store URI, e.g. file:///var/lib/acmes
    #[arg(long, env = "ACMES_STORE")]
    store: String,

    /// ACME account email
    #[arg(long, env = "ACMES_EMAIL")]
    email: String,

    /// DNS-01 provider name
    #[arg(long, env = "ACMES_DNS_PROVIDER")]
    provider: String,

    /// ACME directory URL
    #[arg(long, env = "ACMES_DIRECTORY", default_value = LETS_ENCRYPT_PRODUCTION)]
    directory: String,

    /// Names in the server's channel certificate (repeatable)
    #[arg(
        long = "server-name",
        env = "ACMES_SERVER_NAME",
        value_delimiter = ',',
        default_values_t = [CHANNEL_COMMON_NAME.to_string(), "localhost".to_string()]
    )]
    server_names: Vec<String>,

    /// Program run by the exec DNS provider
    #[arg(long, env = "ACMES_DNS_EXEC_PATH")]
    dns_exec_path: Option<PathBuf>,

    /// Seconds to wait for DNS propagation before validation
    #[arg(long, env = "ACMES_DNS_PROPAGATION_SECS", default_value_t = 60)]
    dns_propagation_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (required before any TLS config)
    ensure_crypto_provider();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ca { cn, expires, out } => {
            init_logging("info")?;
            generate_ca(&cn, expires, out).await
        }
        Commands::Serve(args) => {
            init_logging(&args.level)?;
            if let Err(e) = serve(args).await {
                error!("acmes server failed: {:#}", e);
                return Err(e);
            }
            Ok(())
        }
    }
}

async fn generate_ca(common_name: &str, validity_days: u32, out: PathBuf) -> Result<()> {
    let authority = Authority::generate(common_name, validity_days)
        .context("Failed to generate root certificate")?;

    authority
        .save(&out)
        .await
        .with_context(|| format!("Failed to write root certificate to {}", out.display()))?;

    info!(
        "Root certificate '{}' valid for {} days written to {}",
        common_name,
        validity_days,
        out.display()
    );
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let port = if args.port == 0 { DEFAULT_PORT } else { args.port };

    let authority = Authority::load(&args.ca, &args.cakey)
        .await
        .with_context(|| format!("Failed to load root CA from {}", args.ca.display()))?;

    let store = open_store(&args.store)
        .await
        .with_context(|| format!("Failed to open store {}", args.store))?;

    let dns = build_dns_provider(
        &args.provider,
        &DnsProviderConfig {
            exec_path: args.dns_exec_path.clone(),
        },
    )
    .context("Failed to configure DNS provider")?;

    let engine = Arc::new(AcmeEngine::new(
        AcmeConfig {
            directory_url: args.directory.clone(),
            propagation_delay: Duration::from_secs(args.dns_propagation_secs),
            ..AcmeConfig::default()
        },
        dns,
    ));

    let coordinator = Coordinator::new(store, engine);
    coordinator
        .ensure_account(&args.email)
        .await
        .with_context(|| format!("Failed to register ACME account {}", args.email))?;

    info!("ACME account ready: {}", args.email);
    info!("Directory: {}", args.directory);
    info!("DNS provider: {}", args.provider);

    let tls_config =
        server_tls_config(&authority, &args.server_names).context("Failed to build TLS config")?;

    let router = build_router(Arc::new(AppState {
        coordinator,
        email: args.email,
    }));

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server = AcmesServer::bind(bind_addr, tls_config, router).await?;

    server
        .serve_with_shutdown(async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!("Error listening for shutdown signal: {}", e),
            }
        })
        .await?;

    info!("acmes stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_version_metadata_is_never_empty() {
        assert!(!env!("GIT_TAG").is_empty());
        assert!(!env!("GIT_HASH").is_empty());
        assert!(!env!("BUILD_TIME").is_empty());

        let command = Cli::command();
        let version = command.get_version().unwrap();
        assert!(!version.trim().is_empty());
        let long_version = command.get_long_version().unwrap();
        assert!(!long_version.contains("Commit: \n"));
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }
}
