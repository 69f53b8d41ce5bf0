//! cdn-autocert - keep a Qiniu CDN domain on a valid Let's Encrypt certificate
//!
//! Issues a certificate through ACME DNS-01 when the domain has no HTTPS yet,
//! renews it when it gets close to expiry, and rebinds the domain to the new
//! certificate. Runs one cycle at startup and then on a fixed interval.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use autocert_cdn::{QiniuClient, QiniuConfig};
use autocert_cert::{
    provider_from_env, validate_domain, AcmeAuthority, AcmeConfig, FileCertificateStore,
};
use autocert_control::{DomainJob, OrchestratorConfig, RenewalOrchestrator, Scheduler, SchedulerConfig};

/// Automatic certificate renewal for a Qiniu CDN domain
#[derive(Parser, Debug)]
#[command(name = "cdn-autocert")]
#[command(about = "Issue and renew Let's Encrypt certificates for a Qiniu CDN domain", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// CDN domain to keep on HTTPS (e.g. cdn.example.com)
    domain: String,

    /// Contact address for the ACME account
    email: String,

    /// Qiniu access key
    #[arg(long, env = "QINIU_ACCESSKEY", hide_env_values = true)]
    access_key: String,

    /// Qiniu secret key
    #[arg(long, env = "QINIU_SECRETKEY", hide_env_values = true)]
    secret_key: String,

    /// DNS provider used for DNS-01 challenges; credentials come from its
    /// environment variables (CLOUDFLARE_DNS_API_TOKEN, CLOUDFLARE_ZONE_ID)
    #[arg(long, env = "DNS_PROVIDER", default_value = "cloudflare")]
    dns_provider: String,

    /// Hours between renewal checks
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u64).range(1..))]
    interval_hours: u64,

    /// Renew when the active certificate expires within this many days
    #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(i64).range(1..=89))]
    renew_before_days: i64,

    /// Directory for certificate records and the ACME account
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// ACME directory URL (defaults to Let's Encrypt)
    #[arg(long)]
    acme_directory: Option<String>,

    /// Use the Let's Encrypt staging environment
    #[arg(long)]
    staging: bool,

    /// Extra root certificate (PEM) to trust for the ACME server
    #[arg(long)]
    acme_root_ca: Option<PathBuf>,

    /// Seconds to wait for the challenge TXT record to propagate
    #[arg(long, default_value_t = 30)]
    propagation_delay_secs: u64,

    /// Qiniu API endpoint
    #[arg(long, default_value = autocert_cdn::qiniu::DEFAULT_API_HOST)]
    api_host: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run a single renewal cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (required by the ACME client)
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    );

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    validate_domain(&cli.domain).context("Invalid domain")?;

    info!("Starting cdn-autocert {}", env!("GIT_TAG"));
    info!("Domain: {}", cli.domain);

    let store_dir = cli
        .store_dir
        .clone()
        .unwrap_or_else(FileCertificateStore::default_dir);
    info!("Certificate store: {}", store_dir.display());

    let qiniu = QiniuConfig::new(cli.access_key.as_str(), cli.secret_key.as_str())
        .with_api_host(cli.api_host.as_str());
    let cdn = QiniuClient::new(qiniu).context("Failed to create Qiniu client")?;

    let dns = provider_from_env(&cli.dns_provider)
        .with_context(|| format!("Failed to configure DNS provider '{}'", cli.dns_provider))?;

    let acme_config = AcmeConfig {
        use_staging: cli.staging,
        directory_url: cli.acme_directory.clone(),
        root_ca: cli.acme_root_ca.clone(),
        account_path: store_dir.join("account.json"),
        propagation_delay: Duration::from_secs(cli.propagation_delay_secs),
        ..AcmeConfig::default()
    };
    info!("ACME directory: {}", acme_config.directory());
    let authority = AcmeAuthority::new(acme_config, dns);

    let orchestrator = RenewalOrchestrator::new(
        Arc::new(cdn),
        Arc::new(authority),
        Arc::new(FileCertificateStore::new(store_dir)),
        OrchestratorConfig {
            renew_before: chrono::Duration::days(cli.renew_before_days),
            ..OrchestratorConfig::default()
        },
    );

    let job = DomainJob::new(Arc::new(orchestrator), cli.domain.as_str(), cli.email.as_str());
    let scheduler = Scheduler::new(
        job,
        SchedulerConfig {
            interval: Duration::from_secs(cli.interval_hours * 60 * 60),
        },
    );

    if cli.once {
        scheduler.run_once().await.context("Renewal cycle failed")?;
        return Ok(());
    }

    scheduler.run_until(shutdown_signal()).await;
    info!("cdn-autocert stopped");

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

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Error listening for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!("Error listening for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received, finishing current cycle");
}
