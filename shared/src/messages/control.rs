//! Frame envelopes for the gateway ↔ worker channel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{TaskRequest, TaskResponse};

/// Sent by the gateway on the worker's stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Execute one method call
    Task(TaskRequest),
    /// Liveness probe; answered with `WorkerEvent::Heartbeat`
    Heartbeat { timestamp: DateTime<Utc> },
    /// Finish the current task and exit
    Shutdown,
}

/// Sent by the worker on its stdout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerEvent {
    /// Session established, ready for tasks
    Ready { pid: u32 },
    Heartbeat(HeartbeatReport),
    TaskResult(TaskResponse),
}

/// Worker self-report attached to heartbeat replies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub task_count: u64,
    pub initialized: bool,
    pub timestamp: DateTime<Utc>,
}
