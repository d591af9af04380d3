//! Worker binary entry point
//!
//! Spawned by the gateway, one per account. Commands arrive as frames on
//! stdin, events leave as frames on stdout, logs go to stderr.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use shared::{logging, AccountId, ProcessId, ProcessRole, SessionCredentials};
use worker::{standard_registry, HttpBrokerSession, Worker};

#[derive(Parser)]
#[command(name = "worker")]
#[command(about = "Broker worker process serving a single account")]
struct Args {
    /// Process slot id assigned by the gateway
    #[arg(long)]
    process_id: String,

    /// Account this worker is bound to
    #[arg(long)]
    account_id: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Timeout for individual broker HTTP requests, in seconds
    #[arg(long, default_value = "30")]
    request_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let account_id = AccountId::from_string(&args.account_id).context("invalid --account-id")?;
    let process_id = ProcessId::from_string(&args.process_id).context("invalid --process-id")?;

    ProcessRole::init_worker(account_id);
    logging::init_tracing(Some(&args.log_level));
    logging::log_startup(ProcessRole::current(), &format!("worker {process_id}"));

    let credentials = SessionCredentials::from_env().context("reading session credentials")?;
    if credentials.account_id != account_id {
        bail!(
            "session credentials belong to account {}, expected {}",
            credentials.account_id,
            account_id
        );
    }

    let registry = standard_registry().context("building method registry")?;
    let session = HttpBrokerSession::new(credentials, Duration::from_secs(args.request_timeout_secs))?;

    let worker = Worker::new(account_id, Arc::new(session), registry);

    if let Err(e) = worker.run(tokio::io::stdin(), tokio::io::stdout()).await {
        logging::log_error(ProcessRole::current(), "Worker loop", &e);
        return Err(e.into());
    }

    logging::log_shutdown(ProcessRole::current(), "command loop finished");
    Ok(())
}
