//! Gateway builder and an in-process worker launcher
//!
//! Workers run the real `worker::Worker` loop on a tokio task over duplex
//! pipes, with a stub broker session in place of the HTTP client.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gateway::config::{CoordinatorConfig, CredentialConfig, PoolConfig};
use gateway::services::{HttpTokenEndpoint, InMemoryStore, PassthroughCipher, ProcessLauncher};
use gateway::traits::{AccountStore, LaunchSpec, WorkerControl, WorkerHandle};
use gateway::{Account, Gateway, GatewayConfig, GatewayError, GatewayResult, WorkerLauncher};
use shared::{AccountId, SessionCredentials};
use worker::{standard_registry, BrokerSession, Worker, WorkerError, WorkerResult};

use super::fixtures::TestFixtures;

/// Broker session answering every operation locally
pub struct StubSession {
    credentials: SessionCredentials,
    rejecting: bool,
}

#[async_trait]
impl BrokerSession for StubSession {
    async fn open(&self) -> WorkerResult<()> {
        Ok(())
    }

    async fn call(&self, operation: &str, params: Value) -> WorkerResult<Value> {
        if self.rejecting {
            return Err(WorkerError::BrokerError {
                operation: operation.to_string(),
                status: 500,
                message: "broker unavailable".to_string(),
            });
        }
        Ok(json!({
            "operation": operation,
            "params": params,
            "account_number": self.credentials.account_number,
            "access_token": self.credentials.access_token,
        }))
    }
}

/// Launches in-task workers bound to one account's decrypted session
pub struct InProcessLauncher {
    store: Arc<dyn AccountStore>,
    sessions: ProcessLauncher,
    rejecting: StdMutex<HashSet<AccountId>>,
    running: StdMutex<Vec<(AccountId, tokio::task::AbortHandle)>>,
    launches: AtomicUsize,
    next_pid: AtomicU32,
}

impl InProcessLauncher {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self {
            sessions: ProcessLauncher::new(Arc::clone(&store), Arc::new(PassthroughCipher)),
            store,
            rejecting: StdMutex::new(HashSet::new()),
            running: StdMutex::new(Vec::new()),
            launches: AtomicUsize::new(0),
            next_pid: AtomicU32::new(4000),
        }
    }

    /// Workers launched for `account_id` from now on fail every broker call
    pub fn reject_calls_for(&self, account_id: AccountId) {
        self.rejecting.lock().unwrap().insert(account_id);
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Kill the account's workers behind the pool's back
    pub fn crash(&self, account_id: AccountId) {
        for (owner, handle) in self.running.lock().unwrap().iter() {
            if *owner == account_id {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> GatewayResult<WorkerHandle> {
        let account = self
            .store
            .get_account(spec.account_id)
            .await?
            .ok_or(GatewayError::AccountNotFound {
                account_id: spec.account_id,
            })?;
        let credentials = self.sessions.session_for(&account)?;
        let rejecting = self.rejecting.lock().unwrap().contains(&spec.account_id);
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (gateway_commands, worker_commands) = tokio::io::duplex(64 * 1024);
        let (worker_events, gateway_events) = tokio::io::duplex(64 * 1024);
        let session = StubSession { credentials, rejecting };
        let registry = standard_registry().map_err(|e| GatewayError::startup(spec.account_id, e.to_string()))?;
        let worker = Worker::new(spec.account_id, Arc::new(session), registry);
        let handle = tokio::spawn(worker.run(worker_commands, worker_events));
        self.running
            .lock()
            .unwrap()
            .push((spec.account_id, handle.abort_handle()));

        Ok(WorkerHandle {
            pid: Some(self.next_pid.fetch_add(1, Ordering::SeqCst)),
            commands: Box::new(gateway_commands),
            events: Box::new(gateway_events),
            control: Box::new(TaskControl { handle }),
        })
    }
}

struct TaskControl {
    handle: JoinHandle<WorkerResult<()>>,
}

#[async_trait]
impl WorkerControl for TaskControl {
    fn is_alive(&mut self) -> bool {
        !self.handle.is_finished()
    }

    async fn terminate(&mut self) -> GatewayResult<()> {
        self.handle.abort();
        Ok(())
    }

    async fn kill(&mut self) -> GatewayResult<()> {
        self.handle.abort();
        Ok(())
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let handle = &self.handle;
        let wait = async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// A gateway wired to in-process workers and a mock token server
pub struct TestGateway {
    pub gateway: Gateway<InProcessLauncher, HttpTokenEndpoint>,
    pub store: Arc<InMemoryStore>,
    pub launcher: Arc<InProcessLauncher>,
    pub server: MockServer,
}

impl TestGateway {
    pub async fn account(&self, account_id: AccountId) -> Account {
        self.store.get_account(account_id).await.unwrap().unwrap()
    }

    pub async fn token_requests(&self) -> usize {
        self.server.received_requests().await.map_or(0, |r| r.len())
    }
}

/// Builder for test gateways with fast timings
pub struct GatewayBuilder {
    accounts: Vec<Account>,
    pool: PoolConfig,
    token_delay: Duration,
    mount_token_endpoint: bool,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            accounts: Vec::new(),
            pool: PoolConfig {
                max_processes: 8,
                startup_timeout: Duration::from_secs(2),
                ready_poll_interval: Duration::from_millis(10),
                shutdown_timeout: Duration::from_millis(200),
                heartbeat_interval: Duration::from_millis(50),
                process_timeout: Duration::from_secs(30),
                failure_threshold: 3,
                max_restarts: 3,
                restart_cooldown: Duration::from_secs(60),
                default_task_timeout: Duration::from_secs(2),
            },
            token_delay: Duration::ZERO,
            mount_token_endpoint: true,
        }
    }

    pub fn with_account(mut self, account: Account) -> Self {
        self.accounts.push(account);
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Delay every token response
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Leave the token endpoint unmounted so tests can script it
    pub fn without_token_endpoint(mut self) -> Self {
        self.mount_token_endpoint = false;
        self
    }

    pub fn pool_config(&self) -> PoolConfig {
        self.pool.clone()
    }

    pub async fn build(self) -> TestGateway {
        let server = MockServer::start().await;
        if self.mount_token_endpoint {
            Mock::given(method("POST"))
                .and(path(TestFixtures::TOKEN_PATH))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(TestFixtures::token_body())
                        .set_delay(self.token_delay),
                )
                .mount(&server)
                .await;
        }

        let accounts = self
            .accounts
            .into_iter()
            .map(|mut account| {
                account.server_url = Some(server.uri());
                account
            })
            .collect();
        let store = Arc::new(InMemoryStore::from_accounts(accounts));
        let launcher = Arc::new(InProcessLauncher::new(store.clone()));

        let config = GatewayConfig {
            pool: self.pool,
            coordinator: CoordinatorConfig {
                health_check_interval: Duration::from_secs(3600),
                health_check_timeout: Duration::from_secs(1),
                ..CoordinatorConfig::default()
            },
            credentials: CredentialConfig {
                api_timeout: Duration::from_secs(2),
                retry_delay: Duration::from_millis(10),
                default_retry_after: Duration::from_millis(10),
                scheduler_enabled: false,
                ..CredentialConfig::default()
            },
            ..GatewayConfig::default()
        };
        let endpoint = Arc::new(HttpTokenEndpoint::new(config.credentials.clone()).unwrap());
        let gateway = Gateway::new(
            config,
            store.clone(),
            store.clone(),
            Arc::new(PassthroughCipher),
            launcher.clone(),
            endpoint,
        );

        TestGateway {
            gateway,
            store,
            launcher,
            server,
        }
    }
}
