//! certkeeper - main entry point

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use certkeeper::acme::{AcmeOrchestrator, LiveAcme};
use certkeeper::dns::{DnsResponder, DEFAULT_LISTEN};
use certkeeper::ocsp::HttpOcspFetcher;
use certkeeper::scheduler::{RenewalScheduler, TargetRunner};
use certkeeper_config::{load_targets, TargetConfig};

/// certkeeper - ACME dns-01 certificate renewal for haproxy and nginx
#[derive(Parser, Debug)]
#[command(name = "certkeeper")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Renew the configured targets
    Run {
        /// Target configuration file; repeat for several targets
        #[arg(short = 'c', long = "config", required = true, env = "CERTKEEPER_CONFIG", value_delimiter = ',')]
        config: Vec<PathBuf>,

        /// Run every target once, ignoring run intervals
        #[arg(long = "oneshot")]
        oneshot: bool,

        /// UDP address of the dns-01 responder
        #[arg(long = "dns-listen", default_value = DEFAULT_LISTEN)]
        dns_listen: SocketAddr,
    },
    /// Manage the ACME account of a target
    Account {
        #[command(subcommand)]
        action: AccountCommand,
    },
}

#[derive(Subcommand, Debug)]
enum AccountCommand {
    /// Register a new account and write the account file
    Register {
        #[arg(short = 'c', long = "config")]
        config: PathBuf,

        /// Agree to the CA's terms of service
        #[arg(long = "accept-tos")]
        accept_tos: bool,
    },
    /// Log in and show the account status
    Test {
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
    },
    /// Replace the account's contact addresses with the configured ones
    Update {
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Commands::Run {
                config,
                oneshot,
                dns_listen,
            } => run(config, oneshot, dns_listen).await,
            Commands::Account { action } => account(action).await,
        }
    })
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("certkeeper/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

fn orchestrator(http: reqwest::Client, dns_listen: SocketAddr) -> AcmeOrchestrator {
    AcmeOrchestrator::new(Arc::new(LiveAcme::new(http)), DnsResponder::new(dns_listen))
}

async fn run(config: Vec<PathBuf>, oneshot: bool, dns_listen: SocketAddr) -> Result<()> {
    let targets = load_targets(&config).context("Failed to load target configuration")?;
    for target in &targets {
        info!(
            target = %target.name(),
            mode = %target.mode,
            cert = %target.files.cert_file.display(),
            "Loaded target"
        );
    }

    let http = http_client()?;
    let orchestrator = Arc::new(orchestrator(http.clone(), dns_listen));
    let ocsp = Arc::new(HttpOcspFetcher::new(http));
    let runners = targets
        .into_iter()
        .map(|target| TargetRunner::new(target, Arc::clone(&orchestrator), ocsp.clone()))
        .collect();

    let scheduler = RenewalScheduler::new(runners).oneshot(oneshot);
    tokio::select! {
        _ = scheduler.run() => Ok(()),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            warn!("Received shutdown signal, stopping");
            Ok(())
        }
    }
}

async fn account(action: AccountCommand) -> Result<()> {
    let (AccountCommand::Register { config, .. }
    | AccountCommand::Test { config }
    | AccountCommand::Update { config }) = &action;
    let target = TargetConfig::from_file(config)
        .with_context(|| format!("Failed to load {}", config.display()))?;
    let certificate = &target.certificate;

    let dns_listen = DEFAULT_LISTEN
        .parse()
        .context("Invalid default dns listen address")?;
    let orchestrator = orchestrator(http_client()?, dns_listen);

    match action {
        AccountCommand::Register { accept_tos, .. } => {
            let uri = orchestrator
                .register_account(certificate, accept_tos || certificate.accept_acme_tos)
                .await
                .context("Account registration failed")?;
            println!("certkeeper: registered account {}", uri);
        }
        AccountCommand::Test { .. } => {
            let info = orchestrator
                .test_account(certificate)
                .await
                .context("Account login failed")?;
            println!(
                "certkeeper: account {} is {} (contacts: {})",
                info.uri,
                info.status,
                info.contacts.join(", ")
            );
        }
        AccountCommand::Update { .. } => {
            let changed = orchestrator
                .update_contacts(certificate)
                .await
                .context("Contact update failed")?;
            if changed {
                println!("certkeeper: contact addresses updated");
            } else {
                println!("certkeeper: contact addresses unchanged");
            }
        }
    }
    Ok(())
}
