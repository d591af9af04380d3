//! Worker runtime: owns one broker session and serves framed commands
//!
//! The runtime is generic over its byte streams so the binary can run it on
//! stdin/stdout while tests drive it over in-memory pipes.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};

use shared::{
    process_debug, process_error, process_info, read_frame, write_frame, AccountId, HeartbeatReport,
    ProcessRole, TaskRequest, TaskResponse, WorkerCommand, WorkerEvent,
};

use crate::core::{Call, MethodRegistry, HEALTH_CHECK};
use crate::error::{WorkerError, WorkerResult};
use crate::traits::BrokerSession;

/// Per-account worker with dependency injection
pub struct Worker {
    account_id: AccountId,
    session: Arc<dyn BrokerSession>,
    registry: MethodRegistry,
    task_count: u64,
    initialized: bool,
    started_at: Instant,
}

impl Worker {
    /// Create new worker instance
    pub fn new(account_id: AccountId, session: Arc<dyn BrokerSession>, registry: MethodRegistry) -> Self {
        Self {
            account_id,
            session,
            registry,
            task_count: 0,
            initialized: false,
            started_at: Instant::now(),
        }
    }

    pub fn task_count(&self) -> u64 {
        self.task_count
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Open the session, report ready and serve commands until shutdown or EOF
    pub async fn run<R, W>(mut self, mut commands: R, mut events: W) -> WorkerResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.session.open().await?;
        self.initialized = true;

        write_frame(&mut events, &WorkerEvent::Ready { pid: std::process::id() }).await?;
        process_info!(
            ProcessRole::current(),
            "✅ Worker ready for account {} with {} methods",
            self.account_id,
            self.registry.len()
        );

        loop {
            let command: Option<WorkerCommand> = read_frame(&mut commands).await?;

            match command {
                Some(WorkerCommand::Task(request)) => {
                    let response = self.execute(request).await;
                    write_frame(&mut events, &WorkerEvent::TaskResult(response)).await?;
                }
                Some(WorkerCommand::Heartbeat { .. }) => {
                    write_frame(&mut events, &WorkerEvent::Heartbeat(self.heartbeat())).await?;
                }
                Some(WorkerCommand::Shutdown) => {
                    process_info!(ProcessRole::current(), "🛑 Shutdown requested after {} tasks", self.task_count);
                    break;
                }
                None => {
                    process_info!(ProcessRole::current(), "🔌 Command channel closed, exiting");
                    break;
                }
            }
        }

        self.initialized = false;
        Ok(())
    }

    /// Execute one task; never fails, failures become unsuccessful responses
    pub async fn execute(&mut self, request: TaskRequest) -> TaskResponse {
        let started = Instant::now();
        let task_id = request.task_id;
        process_debug!(ProcessRole::current(), "Processing task {}: {}", task_id, request.method);

        let outcome = tokio::time::timeout(request.timeout(), self.dispatch(request)).await;

        match outcome {
            Ok(Ok(result)) => {
                self.task_count += 1;
                TaskResponse::success(task_id, result, started.elapsed())
            }
            Ok(Err(e)) => {
                process_error!(ProcessRole::current(), "❌ Task {} failed: {}", task_id, e);
                TaskResponse::failure(task_id, e.to_string(), started.elapsed())
            }
            Err(_) => {
                process_error!(ProcessRole::current(), "⏰ Task {} exceeded its deadline", task_id);
                TaskResponse::failure(task_id, "task deadline exceeded inside worker", started.elapsed())
            }
        }
    }

    async fn dispatch(&self, request: TaskRequest) -> WorkerResult<Value> {
        if !self.initialized {
            return Err(WorkerError::NotInitialized);
        }

        if request.method == HEALTH_CHECK {
            return Ok(self.health_report());
        }

        let handler = self.registry.resolve(&request.method)?;
        let call = Call::new(request.method, request.args, request.kwargs);
        handler.handle(self.session.as_ref(), call).await
    }

    fn heartbeat(&self) -> HeartbeatReport {
        HeartbeatReport {
            task_count: self.task_count,
            initialized: self.initialized,
            timestamp: Utc::now(),
        }
    }

    fn health_report(&self) -> Value {
        json!({
            "account_id": self.account_id.to_string(),
            "pid": std::process::id(),
            "initialized": self.initialized,
            "task_count": self.task_count,
            "methods": self.registry.len(),
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}
