//! Per-account worker process pool
//!
//! One isolated worker process per account. Work for an account is serialized
//! by a per-account gate; the pool state (process table, worker links and the
//! restart bookkeeping) sits behind one mutex that is never held across a
//! worker round trip.

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use shared::{
    process_debug, process_error, process_info, process_warn, read_frame, write_frame, AccountId, ProcessId,
    ProcessRole, TaskRequest, TaskResponse, WorkerCommand, WorkerEvent,
};

use crate::config::PoolConfig;
use crate::core::process_table::{ProcessRecord, ProcessStatus, ProcessTable};
use crate::error::{GatewayError, GatewayResult};
use crate::traits::{LaunchSpec, WorkerControl, WorkerLauncher};
use crate::types::chrono_duration;

/// Bound on writing a heartbeat probe to a worker
const PROBE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct PoolState {
    table: ProcessTable,
    links: HashMap<ProcessId, Arc<WorkerLink>>,
    /// Automatic restart times per account, pruned to the cooldown window
    restart_log: HashMap<AccountId, VecDeque<Instant>>,
    /// Accounts whose process needs a restart on the next monitor tick
    restart_queue: HashSet<AccountId>,
}

struct LinkIo {
    commands: Box<dyn AsyncWrite + Send + Unpin>,
    responses: mpsc::Receiver<TaskResponse>,
}

/// Channel to one running worker
struct WorkerLink {
    io: Mutex<LinkIo>,
    control: Mutex<Box<dyn WorkerControl>>,
    reader: JoinHandle<()>,
}

impl WorkerLink {
    /// Send a task and wait for its response, skipping leftovers from
    /// earlier timed-out tasks
    async fn round_trip(&self, request: TaskRequest) -> GatewayResult<TaskResponse> {
        let mut guard = self.io.lock().await;
        let io = &mut *guard;
        let task_id = request.task_id;

        write_frame(&mut io.commands, &WorkerCommand::Task(request))
            .await
            .map_err(|e| GatewayError::communication(format!("failed to send task: {e}")))?;

        loop {
            match io.responses.recv().await {
                Some(response) if response.task_id == task_id => return Ok(response),
                Some(stale) => {
                    process_debug!(ProcessRole::current(), "Discarding stale response for task {}", stale.task_id);
                }
                None => return Err(GatewayError::communication("worker event stream closed")),
            }
        }
    }

    async fn send(&self, command: &WorkerCommand) -> GatewayResult<()> {
        let mut io = self.io.lock().await;
        write_frame(&mut io.commands, command).await?;
        Ok(())
    }
}

impl Drop for WorkerLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct Monitor {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

/// Pool of per-account worker processes
pub struct WorkerPool<L: WorkerLauncher> {
    launcher: Arc<L>,
    config: PoolConfig,
    state: Arc<Mutex<PoolState>>,
    gates: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
    monitor: Mutex<Option<Monitor>>,
}

impl<L: WorkerLauncher + 'static> WorkerPool<L> {
    pub fn new(launcher: Arc<L>) -> Self {
        Self {
            launcher,
            config: PoolConfig::default(),
            state: Arc::new(Mutex::new(PoolState::default())),
            gates: Mutex::new(HashMap::new()),
            monitor: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Process id for the account's healthy worker, spawning one if needed
    pub async fn get_or_create_process(&self, account_id: AccountId) -> GatewayResult<ProcessId> {
        let _gate = self.lock_gate(account_id).await;
        self.ensure_process(account_id).await
    }

    /// Run one method on the account's worker
    ///
    /// `timeout` defaults to the pool's task timeout. A timeout or a broken
    /// channel marks the worker Error and queues it for restart.
    pub async fn execute_task(
        &self,
        account_id: AccountId,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> GatewayResult<Value> {
        let timeout = timeout.unwrap_or(self.config.default_task_timeout);
        let _gate = self.lock_gate(account_id).await;
        let process_id = self.ensure_process(account_id).await?;

        let request = TaskRequest::new(method, args, kwargs, timeout);
        let link = {
            let mut state = self.state.lock().await;
            let link = state
                .links
                .get(&process_id)
                .cloned()
                .ok_or_else(|| GatewayError::communication(format!("no link for process {process_id}")))?;
            if let Some(record) = state.table.get_mut(&process_id) {
                record.begin_task(request.task_id, Utc::now());
            }
            link
        };

        process_debug!(
            ProcessRole::current(),
            "📤 Task {} {} → account {}",
            request.task_id,
            method,
            account_id.short()
        );

        match tokio::time::timeout(timeout, link.round_trip(request)).await {
            Ok(Ok(response)) if response.success => {
                let mut state = self.state.lock().await;
                if let Some(record) = state.table.get_mut(&process_id) {
                    record.finish_task(Utc::now());
                    record.error_count = 0;
                }
                Ok(response.result.unwrap_or(Value::Null))
            }
            Ok(Ok(response)) => {
                let message = response.error.unwrap_or_else(|| "unknown worker error".to_string());
                let tripped = {
                    let mut state = self.state.lock().await;
                    match state.table.get_mut(&process_id) {
                        Some(record) => {
                            record.finish_task(Utc::now());
                            record.error_count += 1;
                            record.last_error = Some(message.clone());
                            record.error_count >= self.config.failure_threshold
                        }
                        None => false,
                    }
                };
                if tripped {
                    process_warn!(
                        ProcessRole::current(),
                        "⚡ Account {} hit {} consecutive failures, restarting worker",
                        account_id.short(),
                        self.config.failure_threshold
                    );
                    if let Err(e) = self.restart_locked(account_id, true).await {
                        process_error!(ProcessRole::current(), "❌ Circuit-breaker restart failed: {}", e);
                    }
                }
                Err(GatewayError::TaskExecution {
                    account_id,
                    method: method.to_string(),
                    message,
                })
            }
            Ok(Err(e)) => {
                self.mark_failed(account_id, process_id, e.to_string()).await;
                Err(e)
            }
            Err(_) => {
                self.mark_failed(account_id, process_id, format!("{method} timed out after {timeout:?}"))
                    .await;
                Err(GatewayError::TaskTimeout {
                    account_id,
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Replace the account's worker; false when it had none
    pub async fn restart_process(&self, account_id: AccountId) -> GatewayResult<bool> {
        let _gate = self.lock_gate(account_id).await;
        self.restart_locked(account_id, false).await
    }

    /// Shut the account's worker down; false when it had none
    pub async fn remove_process(&self, account_id: AccountId) -> GatewayResult<bool> {
        let _gate = self.lock_gate(account_id).await;
        self.remove_locked(account_id).await
    }

    /// Force-kill the account's worker without waiting for its gate
    ///
    /// Used for tasks stuck inside a worker: the in-flight call fails once
    /// the event stream closes and the monitor restarts the process.
    pub async fn kill_process(&self, account_id: AccountId) -> GatewayResult<bool> {
        let link = {
            let state = self.state.lock().await;
            state
                .table
                .for_account(&account_id)
                .and_then(|record| state.links.get(&record.process_id).cloned())
        };
        match link {
            Some(link) => {
                link.control.lock().await.kill().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn get_status(&self, account_id: AccountId) -> Option<ProcessRecord> {
        self.state.lock().await.table.for_account(&account_id).cloned()
    }

    pub async fn get_all(&self) -> Vec<ProcessRecord> {
        self.state.lock().await.table.records().cloned().collect()
    }

    /// Processes counting against `max_processes`
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.table.live_count()
    }

    /// Start the health monitor
    pub async fn start(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let pool = Arc::clone(self);
        let interval = self.config.heartbeat_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.check_processes().await,
                    _ = stopped.changed() => break,
                }
            }
        });

        *monitor = Some(Monitor { handle, stop });
        process_info!(
            ProcessRole::current(),
            "🩺 Worker monitor started (every {:?})",
            interval
        );
    }

    /// Stop the monitor and shut every worker down
    pub async fn stop(&self) {
        if let Some(monitor) = self.monitor.lock().await.take() {
            let _ = monitor.stop.send(true);
            let _ = monitor.handle.await;
        }

        let accounts: Vec<AccountId> = {
            let state = self.state.lock().await;
            state.table.records().map(|r| r.account_id).collect()
        };
        for account_id in accounts {
            if let Err(e) = self.remove_process(account_id).await {
                process_error!(ProcessRole::current(), "❌ Failed to stop worker for {}: {}", account_id, e);
            }
        }
        process_info!(ProcessRole::current(), "🛑 Worker pool stopped");
    }

    /// One monitor pass: drain queued restarts, restart dead or silent
    /// workers and probe the idle ones
    pub async fn check_processes(&self) {
        let queued: Vec<AccountId> = {
            let mut state = self.state.lock().await;
            state.restart_queue.drain().collect()
        };
        for account_id in queued {
            let _gate = self.lock_gate(account_id).await;
            let still_failed = matches!(
                self.state.lock().await.table.for_account(&account_id).map(|r| r.status),
                Some(ProcessStatus::Error)
            );
            if still_failed {
                self.monitor_restart(account_id, "failed task").await;
            }
        }

        let ready: Vec<AccountId> = {
            let state = self.state.lock().await;
            state
                .table
                .records()
                .filter(|r| r.status == ProcessStatus::Ready)
                .map(|r| r.account_id)
                .collect()
        };
        for account_id in ready {
            // A held gate means a task is running; that task reports its own failures
            let Some(_gate) = self.try_lock_gate(account_id).await else {
                continue;
            };
            self.check_ready_process(account_id).await;
        }
    }

    async fn check_ready_process(&self, account_id: AccountId) {
        let (record, link) = {
            let state = self.state.lock().await;
            let Some(record) = state.table.for_account(&account_id).cloned() else {
                return;
            };
            let Some(link) = state.links.get(&record.process_id).cloned() else {
                return;
            };
            (record, link)
        };
        if record.status != ProcessStatus::Ready {
            return;
        }

        if !link.control.lock().await.is_alive() {
            self.monitor_restart(account_id, "process exited").await;
            return;
        }

        if record.heartbeat_age(Utc::now()) > chrono_duration(self.config.process_timeout) {
            self.monitor_restart(account_id, "heartbeat timeout").await;
            return;
        }

        let probe = WorkerCommand::Heartbeat { timestamp: Utc::now() };
        match tokio::time::timeout(PROBE_WRITE_TIMEOUT, link.send(&probe)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.monitor_restart(account_id, &format!("heartbeat send failed: {e}")).await,
            Err(_) => self.monitor_restart(account_id, "heartbeat send timed out").await,
        }
    }

    async fn monitor_restart(&self, account_id: AccountId, reason: &str) {
        process_warn!(
            ProcessRole::current(),
            "🔄 Restarting worker for account {}: {}",
            account_id.short(),
            reason
        );
        if let Err(e) = self.restart_locked(account_id, true).await {
            process_error!(ProcessRole::current(), "❌ Restart for {} failed: {}", account_id.short(), e);
        }
    }

    async fn gate(&self, account_id: AccountId) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().await;
        Arc::clone(gates.entry(account_id).or_default())
    }

    async fn lock_gate(&self, account_id: AccountId) -> OwnedMutexGuard<()> {
        self.gate(account_id).await.lock_owned().await
    }

    async fn try_lock_gate(&self, account_id: AccountId) -> Option<OwnedMutexGuard<()>> {
        self.gate(account_id).await.try_lock_owned().ok()
    }

    async fn mark_failed(&self, account_id: AccountId, process_id: ProcessId, reason: String) {
        process_warn!(
            ProcessRole::current(),
            "⚠️ Worker for account {} marked failed: {}",
            account_id.short(),
            reason
        );
        let mut state = self.state.lock().await;
        if let Some(record) = state.table.get_mut(&process_id) {
            record.status = ProcessStatus::Error;
            record.current_task_id = None;
            record.task_started_at = None;
            record.last_error = Some(reason);
        }
        state.restart_queue.insert(account_id);
    }

    /// Healthy process for the account, replacing anything else. Gate held.
    async fn ensure_process(&self, account_id: AccountId) -> GatewayResult<ProcessId> {
        let existing = {
            let state = self.state.lock().await;
            state.table.for_account(&account_id).map(|record| {
                let linked = state.links.contains_key(&record.process_id);
                (record.process_id, record.status, record.restart_count, linked)
            })
        };

        match existing {
            Some((process_id, status, _, true)) if status.is_healthy() => Ok(process_id),
            Some((process_id, status, restart_count, _)) => {
                process_info!(
                    ProcessRole::current(),
                    "♻️ Replacing {:?} worker for account {}",
                    status,
                    account_id.short()
                );
                self.shutdown_process(process_id).await;
                self.spawn_process(account_id, process_id, restart_count + 1).await
            }
            None => self.spawn_process(account_id, ProcessId::new(), 0).await,
        }
    }

    /// Gate held. `automatic` restarts are bounded by the restart budget.
    async fn restart_locked(&self, account_id: AccountId, automatic: bool) -> GatewayResult<bool> {
        let Some((process_id, restart_count)) = ({
            let state = self.state.lock().await;
            state
                .table
                .for_account(&account_id)
                .map(|r| (r.process_id, r.restart_count))
        }) else {
            return Ok(false);
        };

        if automatic && !self.take_restart_budget(account_id).await {
            process_warn!(
                ProcessRole::current(),
                "🧯 Account {} exceeded {} restarts within {:?}, removing worker",
                account_id.short(),
                self.config.max_restarts,
                self.config.restart_cooldown
            );
            self.shutdown_process(process_id).await;
            return Ok(false);
        }

        self.shutdown_process(process_id).await;
        self.spawn_process(account_id, process_id, restart_count + 1).await?;
        Ok(true)
    }

    async fn take_restart_budget(&self, account_id: AccountId) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let log = state.restart_log.entry(account_id).or_default();
        while log
            .front()
            .is_some_and(|at| now.duration_since(*at) > self.config.restart_cooldown)
        {
            log.pop_front();
        }
        if log.len() >= self.config.max_restarts as usize {
            return false;
        }
        log.push_back(now);
        true
    }

    /// Gate held
    async fn remove_locked(&self, account_id: AccountId) -> GatewayResult<bool> {
        let process_id = {
            let state = self.state.lock().await;
            state.table.for_account(&account_id).map(|r| r.process_id)
        };
        match process_id {
            Some(process_id) => {
                self.shutdown_process(process_id).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Launch a worker and wait for it to report ready. Gate held.
    async fn spawn_process(
        &self,
        account_id: AccountId,
        process_id: ProcessId,
        restart_count: u32,
    ) -> GatewayResult<ProcessId> {
        {
            let mut state = self.state.lock().await;
            if state.table.live_count() >= self.config.max_processes {
                return Err(GatewayError::Capacity {
                    max: self.config.max_processes,
                });
            }
            state
                .table
                .insert(ProcessRecord::starting(process_id, account_id, restart_count));
        }

        let spec = LaunchSpec { process_id, account_id };
        let handle = match self.launcher.launch(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.deregister(process_id).await;
                return Err(match e {
                    GatewayError::ProcessStartup { .. } => e,
                    other => GatewayError::startup(account_id, other.to_string()),
                });
            }
        };

        let (responses_tx, responses_rx) = mpsc::channel(16);
        let (ready_tx, ready_rx) = oneshot::channel();
        let reader = tokio::spawn(read_events(
            handle.events,
            Arc::clone(&self.state),
            process_id,
            restart_count,
            ready_tx,
            responses_tx,
        ));
        let mut control = handle.control;

        let ready = tokio::time::timeout(
            self.config.startup_timeout,
            wait_for_ready(ready_rx, &mut control, self.config.ready_poll_interval),
        )
        .await;

        let pid = match ready {
            Ok(Ok(pid)) => pid,
            failed => {
                let reason = match failed {
                    Ok(Err(reason)) => reason,
                    _ => format!("no ready message within {:?}", self.config.startup_timeout),
                };
                reader.abort();
                let _ = control.kill().await;
                self.deregister(process_id).await;
                process_error!(
                    ProcessRole::current(),
                    "❌ Worker for account {} failed to start: {}",
                    account_id.short(),
                    reason
                );
                return Err(GatewayError::startup(account_id, reason));
            }
        };

        let link = Arc::new(WorkerLink {
            io: Mutex::new(LinkIo {
                commands: handle.commands,
                responses: responses_rx,
            }),
            control: Mutex::new(control),
            reader,
        });

        {
            let mut state = self.state.lock().await;
            let Some(record) = state.table.get_mut(&process_id) else {
                drop(state);
                let _ = link.control.lock().await.kill().await;
                return Err(GatewayError::startup(account_id, "deregistered during startup"));
            };
            record.status = ProcessStatus::Ready;
            record.pid = handle.pid.or(Some(pid));
            record.last_heartbeat = Utc::now();
            state.links.insert(process_id, link);
        }

        process_info!(
            ProcessRole::current(),
            "✅ Worker {} ready for account {} (PID: {})",
            process_id,
            account_id.short(),
            pid
        );
        Ok(process_id)
    }

    /// Graceful shutdown escalating to terminate then kill; the process
    /// leaves every tracking map in one step whichever path succeeded
    async fn shutdown_process(&self, process_id: ProcessId) {
        let link = {
            let mut state = self.state.lock().await;
            if let Some(record) = state.table.get_mut(&process_id) {
                record.status = ProcessStatus::Stopping;
            }
            state.links.get(&process_id).cloned()
        };

        if let Some(link) = link {
            let wait = self.config.shutdown_timeout;
            let _ = tokio::time::timeout(wait, link.send(&WorkerCommand::Shutdown)).await;

            let mut control = link.control.lock().await;
            if !control.wait_for_exit(wait).await {
                process_debug!(ProcessRole::current(), "Worker {} ignored shutdown, terminating", process_id);
                let _ = control.terminate().await;
                if !control.wait_for_exit(wait).await {
                    process_warn!(ProcessRole::current(), "🔨 Worker {} ignored SIGTERM, killing", process_id);
                    let _ = control.kill().await;
                    let _ = control.wait_for_exit(wait).await;
                }
            }
        }

        self.deregister(process_id).await;
    }

    async fn deregister(&self, process_id: ProcessId) {
        let mut state = self.state.lock().await;
        state.table.remove(&process_id);
        state.links.remove(&process_id);
    }
}

async fn wait_for_ready(
    mut ready: oneshot::Receiver<u32>,
    control: &mut Box<dyn WorkerControl>,
    poll: Duration,
) -> Result<u32, String> {
    loop {
        tokio::select! {
            result = &mut ready => {
                return result.map_err(|_| "event stream closed before ready".to_string());
            }
            _ = tokio::time::sleep(poll) => {
                if !control.is_alive() {
                    return Err("process exited during startup".to_string());
                }
            }
        }
    }
}

/// Forward worker events until the stream closes
async fn read_events(
    mut events: Box<dyn AsyncRead + Send + Unpin>,
    state: Arc<Mutex<PoolState>>,
    process_id: ProcessId,
    generation: u32,
    ready: oneshot::Sender<u32>,
    responses: mpsc::Sender<TaskResponse>,
) {
    let mut ready = Some(ready);
    loop {
        match read_frame::<_, WorkerEvent>(&mut events).await {
            Ok(Some(WorkerEvent::Ready { pid })) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(pid);
                }
            }
            Ok(Some(WorkerEvent::Heartbeat(report))) => {
                let mut state = state.lock().await;
                if let Some(record) = state.table.get_mut(&process_id) {
                    if record.restart_count == generation {
                        record.last_heartbeat = Utc::now();
                    }
                }
                process_debug!(
                    ProcessRole::current(),
                    "💓 Worker {} heartbeat ({} tasks)",
                    process_id,
                    report.task_count
                );
            }
            Ok(Some(WorkerEvent::TaskResult(response))) => {
                if responses.send(response).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                process_warn!(ProcessRole::current(), "⚠️ Worker {} event stream error: {}", process_id, e);
                break;
            }
        }
    }
    process_debug!(ProcessRole::current(), "Worker {} event stream ended", process_id);
}
