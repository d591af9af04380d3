//! Gateway binary entry point
//!
//! Loads accounts from a JSON seed file, starts the background loops and
//! serves until Ctrl+C.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;

use gateway::{
    services::{HttpTokenEndpoint, InMemoryStore, PassthroughCipher, ProcessLauncher},
    traits::{AccountStore, CredentialCipher, RefreshRecordStore},
    Gateway, GatewayConfig,
};
use shared::{logging, process_debug, process_info, process_warn, ProcessRole};

/// Gateway multiplexing broker calls over per-account worker processes
#[derive(Parser)]
#[command(name = "gateway")]
#[command(about = "Routes broker API calls across isolated per-account worker processes")]
pub struct Args {
    /// JSON file with the accounts to serve
    #[arg(long, env = "GATEWAY_ACCOUNTS_FILE")]
    pub accounts: PathBuf,

    /// Path to the worker binary (overrides GATEWAY_WORKER_BINARY)
    #[arg(long)]
    pub worker_binary: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Upper bound on concurrently running workers
    #[arg(long)]
    pub max_processes: Option<usize>,

    /// Start a worker for every active account at boot
    #[arg(long)]
    pub warm: bool,

    /// Run one health check over all accounts after startup
    #[arg(long)]
    pub health_check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    ProcessRole::init_gateway();
    logging::init_tracing(Some(&args.log_level));
    logging::log_startup(ProcessRole::current(), "account gateway");

    let mut config = GatewayConfig::from_env().context("loading gateway configuration")?;
    if let Some(worker_binary) = args.worker_binary {
        config.launcher.worker_binary = worker_binary;
    }
    if let Some(max_processes) = args.max_processes {
        config.pool.max_processes = max_processes;
    }
    config.launcher.log_level = args.log_level.clone();
    config.validate().context("validating gateway configuration")?;
    process_debug!(
        ProcessRole::current(),
        "Worker binary: {}, max processes: {}",
        config.launcher.worker_binary.display(),
        config.pool.max_processes
    );

    let store = Arc::new(
        InMemoryStore::load_from_file(&args.accounts)
            .await
            .with_context(|| format!("loading accounts from {}", args.accounts.display()))?,
    );
    let accounts: Arc<dyn AccountStore> = store.clone();
    let records: Arc<dyn RefreshRecordStore> = store;
    let cipher: Arc<dyn CredentialCipher> = Arc::new(PassthroughCipher);

    let launcher = Arc::new(
        ProcessLauncher::new(Arc::clone(&accounts), Arc::clone(&cipher))
            .with_config(config.launcher.clone())
            .with_servers(config.credentials.clone()),
    );
    let endpoint = Arc::new(HttpTokenEndpoint::new(config.credentials.clone())?);

    let gateway = Gateway::new(config, accounts, records, cipher, launcher, endpoint);
    gateway.start().await;

    if args.warm {
        gateway.warm_up().await?;
    }
    if args.health_check {
        for report in gateway.coordinator().health_check_all_accounts().await? {
            if report.healthy {
                process_info!(ProcessRole::current(), "💚 {} healthy", report.account_id);
            } else {
                process_warn!(
                    ProcessRole::current(),
                    "💔 {} unhealthy: {}",
                    report.account_id,
                    report.error.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => logging::log_shutdown(ProcessRole::current(), "Received Ctrl+C signal"),
        Err(err) => logging::log_error(ProcessRole::current(), "Signal handling", &err),
    }

    gateway.shutdown().await;
    logging::log_success(ProcessRole::current(), "Gateway stopped gracefully");
    Ok(())
}
