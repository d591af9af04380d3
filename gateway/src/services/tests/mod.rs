//! Service-level tests
//!
//! Each service has its own file. Fixtures shared between them live in
//! `common`: a fake launcher that runs an in-task worker over duplex pipes,
//! account builders and a scripted token endpoint.

mod account_router;

pub mod common {
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
    use tokio::sync::watch;

    use shared::{
        read_frame, write_frame, BrokerEnvironment, HeartbeatReport, TaskRequest, TaskResponse, WorkerCommand,
        WorkerEvent,
    };

    use crate::config::PoolConfig;
    use crate::error::{GatewayError, GatewayResult};
    use crate::traits::{LaunchSpec, TokenEndpoint, TokenGrant, TokenRequest, WorkerControl, WorkerHandle, WorkerLauncher};
    use crate::types::{Account, AccountType, EncryptedCredentials, MarketPermission};

    /// How a fake worker behaves from launch on
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LaunchBehavior {
        Healthy,
        /// Never sends Ready; exits only when killed
        NeverReady,
        /// Exits immediately
        CrashOnStart,
        /// Ignores the Shutdown command; needs terminate
        IgnoreShutdown,
    }

    /// Launcher whose workers are tokio tasks speaking the real frame protocol
    ///
    /// Methods are answered by prefix: `fail.*` fails, `hang.*` never
    /// answers until killed, `slow.*` answers after 100ms, `health_check`
    /// reports healthy and anything else echoes the call.
    pub struct FakeLauncher {
        behavior: StdMutex<LaunchBehavior>,
        launches: AtomicUsize,
        kills: Arc<AtomicUsize>,
        next_pid: AtomicU32,
        last_launch: StdMutex<Option<LaunchSpec>>,
    }

    impl FakeLauncher {
        pub fn new() -> Self {
            Self::with_behavior(LaunchBehavior::Healthy)
        }

        pub fn with_behavior(behavior: LaunchBehavior) -> Self {
            Self {
                behavior: StdMutex::new(behavior),
                launches: AtomicUsize::new(0),
                kills: Arc::new(AtomicUsize::new(0)),
                next_pid: AtomicU32::new(1000),
                last_launch: StdMutex::new(None),
            }
        }

        pub fn set_behavior(&self, behavior: LaunchBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        pub fn launch_count(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        /// Forced terminations (terminate or kill) across all workers
        pub fn kill_count(&self) -> usize {
            self.kills.load(Ordering::SeqCst)
        }

        pub fn last_launch(&self) -> Option<LaunchSpec> {
            self.last_launch.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> GatewayResult<WorkerHandle> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            *self.last_launch.lock().unwrap() = Some(spec.clone());
            let behavior = *self.behavior.lock().unwrap();
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);

            let (gateway_commands, worker_commands) = tokio::io::duplex(64 * 1024);
            let (worker_events, gateway_events) = tokio::io::duplex(64 * 1024);
            let alive = Arc::new(AtomicBool::new(true));
            let (kill_tx, kill_rx) = watch::channel(false);
            let (exited_tx, exited_rx) = watch::channel(false);

            tokio::spawn(run_fake_worker(
                worker_commands,
                worker_events,
                behavior,
                pid,
                Arc::clone(&alive),
                kill_rx,
                exited_tx,
            ));

            Ok(WorkerHandle {
                pid: Some(pid),
                commands: Box::new(gateway_commands),
                events: Box::new(gateway_events),
                control: Box::new(FakeControl {
                    alive,
                    kill: kill_tx,
                    exited: exited_rx,
                    kills: Arc::clone(&self.kills),
                }),
            })
        }
    }

    pub struct FakeControl {
        alive: Arc<AtomicBool>,
        kill: watch::Sender<bool>,
        exited: watch::Receiver<bool>,
        kills: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerControl for FakeControl {
        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn terminate(&mut self) -> GatewayResult<()> {
            self.kill().await
        }

        async fn kill(&mut self) -> GatewayResult<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.kill.send_replace(true);
            Ok(())
        }

        async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
            let exited = &mut self.exited;
            let wait = async {
                loop {
                    if *exited.borrow_and_update() {
                        return true;
                    }
                    if exited.changed().await.is_err() {
                        return *exited.borrow();
                    }
                }
            };
            tokio::time::timeout(timeout, wait).await.unwrap_or(false)
        }
    }

    async fn run_fake_worker(
        mut commands: DuplexStream,
        mut events: DuplexStream,
        behavior: LaunchBehavior,
        pid: u32,
        alive: Arc<AtomicBool>,
        mut killed: watch::Receiver<bool>,
        exited: watch::Sender<bool>,
    ) {
        match behavior {
            LaunchBehavior::CrashOnStart => {}
            LaunchBehavior::NeverReady => {
                until_killed(&mut killed).await;
            }
            LaunchBehavior::Healthy | LaunchBehavior::IgnoreShutdown => {
                if write_frame(&mut events, &WorkerEvent::Ready { pid }).await.is_ok() {
                    serve(&mut commands, &mut events, behavior, &mut killed).await;
                }
            }
        }
        alive.store(false, Ordering::SeqCst);
        exited.send_replace(true);
    }

    /// Resolves on kill, or when the control side is dropped
    async fn until_killed(killed: &mut watch::Receiver<bool>) {
        while !*killed.borrow_and_update() {
            if killed.changed().await.is_err() {
                return;
            }
        }
    }

    async fn serve(
        commands: &mut (impl AsyncRead + Unpin),
        events: &mut (impl AsyncWrite + Unpin),
        behavior: LaunchBehavior,
        killed: &mut watch::Receiver<bool>,
    ) {
        let mut task_count = 0u64;
        loop {
            let command = tokio::select! {
                command = read_frame::<_, WorkerCommand>(commands) => command,
                _ = until_killed(killed) => return,
            };
            let event = match command {
                Ok(Some(WorkerCommand::Task(request))) => {
                    task_count += 1;
                    tokio::select! {
                        response = answer(request) => WorkerEvent::TaskResult(response),
                        _ = until_killed(killed) => return,
                    }
                }
                Ok(Some(WorkerCommand::Heartbeat { .. })) => WorkerEvent::Heartbeat(HeartbeatReport {
                    task_count,
                    initialized: true,
                    timestamp: Utc::now(),
                }),
                Ok(Some(WorkerCommand::Shutdown)) if behavior == LaunchBehavior::IgnoreShutdown => continue,
                _ => return,
            };
            if write_frame(events, &event).await.is_err() {
                return;
            }
        }
    }

    async fn answer(request: TaskRequest) -> TaskResponse {
        let elapsed = Duration::from_millis(1);
        let method = request.method.as_str();
        if method.starts_with("fail.") {
            TaskResponse::failure(request.task_id, format!("{method} rejected by broker"), elapsed)
        } else if method.starts_with("hang.") {
            std::future::pending::<()>().await;
            unreachable!()
        } else if method.starts_with("slow.") {
            tokio::time::sleep(Duration::from_millis(100)).await;
            TaskResponse::success(request.task_id, json!({ "method": method }), elapsed)
        } else if method == "health_check" {
            TaskResponse::success(request.task_id, json!({ "status": "healthy" }), elapsed)
        } else {
            TaskResponse::success(
                request.task_id,
                json!({ "method": method, "args": request.args, "kwargs": request.kwargs }),
                elapsed,
            )
        }
    }

    /// Pool settings small enough for tests
    pub fn fast_pool_config() -> PoolConfig {
        PoolConfig {
            max_processes: 8,
            startup_timeout: Duration::from_millis(500),
            ready_poll_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(50),
            process_timeout: Duration::from_secs(30),
            failure_threshold: 3,
            max_restarts: 3,
            restart_cooldown: Duration::from_secs(60),
            default_task_timeout: Duration::from_secs(2),
        }
    }

    pub fn credentials(token: Option<&str>) -> EncryptedCredentials {
        EncryptedCredentials {
            client_id: "client-id".to_string(),
            private_key: "private-key".to_string(),
            access_token: token.map(str::to_string),
            refresh_token: None,
        }
    }

    /// Active production account holding a token valid for two hours
    pub fn production_account(name: &str) -> Account {
        let mut account = Account::new(
            name,
            format!("U{name}"),
            BrokerEnvironment::Production,
            AccountType::Standard,
            credentials(Some("access-token")),
        );
        account.token_expires_at = Some(Utc::now() + ChronoDuration::hours(2));
        account.market_permissions = vec![MarketPermission::UsStock];
        account
    }

    pub fn sandbox_account(name: &str, account_type: AccountType) -> Account {
        let mut account = production_account(name);
        account.environment = BrokerEnvironment::Sandbox;
        account.account_type = account_type;
        account
    }

    /// Token endpoint replaying scripted results and counting calls
    pub struct ScriptedEndpoint {
        script: StdMutex<VecDeque<GatewayResult<TokenGrant>>>,
        requests: StdMutex<Vec<TokenRequest>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedEndpoint {
        /// Grants `token-N` for every call unless scripted otherwise
        pub fn new() -> Self {
            Self::with_delay(Duration::ZERO)
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                script: StdMutex::new(VecDeque::new()),
                requests: StdMutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                delay,
            }
        }

        pub fn push(&self, result: GatewayResult<TokenGrant>) {
            self.script.lock().unwrap().push_back(result);
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn peak_concurrency(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }

        pub fn requests(&self) -> Vec<TokenRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    pub fn grant(token: &str) -> TokenGrant {
        TokenGrant {
            access_token: token.to_string(),
            refresh_token: Some(format!("{token}-refresh")),
            expires_in: Some(7200),
            status_code: 200,
            response_time_ms: 5,
        }
    }

    #[async_trait]
    impl TokenEndpoint for ScriptedEndpoint {
        async fn request_token(&self, request: &TokenRequest) -> GatewayResult<TokenGrant> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.requests.lock().unwrap().push(request.clone());
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = self.script.lock().unwrap().pop_front();

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            scripted.unwrap_or_else(|| Ok(grant(&format!("token-{n}"))))
        }

        async fn probe_token(&self, _server_url: &str, access_token: &str) -> GatewayResult<bool> {
            if access_token == "probe-error" {
                return Err(GatewayError::TokenRefresh {
                    status: Some(500),
                    message: "profile endpoint down".to_string(),
                });
            }
            Ok(access_token != "revoked")
        }
    }
}
