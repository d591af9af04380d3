//! Spawns worker binaries as child processes
//!
//! Each child gets the decrypted session for exactly one account in
//! `BROKER_SESSION`, speaks frames over stdin/stdout and logs to stderr.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};

use shared::{process_debug, process_warn, ProcessRole, SessionCredentials, SESSION_ENV_VAR};

use crate::config::{CredentialConfig, LauncherConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::traits::{AccountStore, CredentialCipher, LaunchSpec, WorkerControl, WorkerHandle, WorkerLauncher};
use crate::types::Account;

/// Launches the `worker` binary for an account
pub struct ProcessLauncher {
    store: Arc<dyn AccountStore>,
    cipher: Arc<dyn CredentialCipher>,
    config: LauncherConfig,
    servers: CredentialConfig,
}

impl ProcessLauncher {
    pub fn new(store: Arc<dyn AccountStore>, cipher: Arc<dyn CredentialCipher>) -> Self {
        Self {
            store,
            cipher,
            config: LauncherConfig::default(),
            servers: CredentialConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LauncherConfig) -> Self {
        self.config = config;
        self
    }

    /// Source of default server urls per environment
    pub fn with_servers(mut self, servers: CredentialConfig) -> Self {
        self.servers = servers;
        self
    }

    /// Decrypt an account's secrets into what the worker needs
    pub fn session_for(&self, account: &Account) -> GatewayResult<SessionCredentials> {
        let access_token = account
            .credentials
            .access_token
            .as_deref()
            .map(|token| self.cipher.decrypt(token))
            .transpose()?;

        Ok(SessionCredentials {
            account_id: account.id,
            account_number: account.account_number.clone(),
            environment: account.environment,
            server_url: account
                .server_url
                .clone()
                .unwrap_or_else(|| self.servers.server_url(account.environment).to_string()),
            client_id: account.credentials.client_id.clone(),
            private_key: self.cipher.decrypt(&account.credentials.private_key)?,
            access_token,
        })
    }

    fn command(&self, spec: &LaunchSpec, session: &SessionCredentials) -> GatewayResult<Command> {
        let mut cmd = Command::new(&self.config.worker_binary);
        cmd.arg("--process-id")
            .arg(spec.process_id.to_string())
            .arg("--account-id")
            .arg(spec.account_id.to_string())
            .arg("--log-level")
            .arg(&self.config.log_level)
            .arg("--request-timeout-secs")
            .arg(self.config.request_timeout.as_secs().max(1).to_string());

        cmd.env(SESSION_ENV_VAR, session.to_env_value()?);

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> GatewayResult<WorkerHandle> {
        let account = self
            .store
            .get_account(spec.account_id)
            .await?
            .ok_or(GatewayError::AccountNotFound {
                account_id: spec.account_id,
            })?;
        let session = self.session_for(&account)?;

        let mut child = self
            .command(spec, &session)?
            .spawn()
            .map_err(|e| GatewayError::startup(spec.account_id, format!("failed to spawn worker: {e}")))?;

        let pid = child.id();
        let commands = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::startup(spec.account_id, "worker stdin not captured"))?;
        let events = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::startup(spec.account_id, "worker stdout not captured"))?;

        process_debug!(
            ProcessRole::current(),
            "🏭 Spawned worker {} for account {} (PID: {:?})",
            spec.process_id,
            account.name,
            pid
        );

        Ok(WorkerHandle {
            pid,
            commands: Box::new(commands),
            events: Box::new(events),
            control: Box::new(ChildControl { child }),
        })
    }
}

/// `WorkerControl` over a tokio child process
pub struct ChildControl {
    child: Child,
}

impl ChildControl {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl WorkerControl for ChildControl {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    #[cfg(unix)]
    async fn terminate(&mut self) -> GatewayResult<()> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(GatewayError::communication(format!("SIGTERM to {pid} failed: {e}"))),
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&mut self) -> GatewayResult<()> {
        self.kill().await
    }

    async fn kill(&mut self) -> GatewayResult<()> {
        if let Err(e) = self.child.kill().await {
            // Already reaped children report InvalidInput
            if e.kind() != std::io::ErrorKind::InvalidInput {
                process_warn!(ProcessRole::current(), "⚠️ Failed to kill worker: {}", e);
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.child.wait()).await.is_ok()
    }
}
