//! Per-process task metrics and the rolling task history
//!
//! Tracks task counts, an exponential moving average of execution time and
//! a bounded history log pruned on a retention horizon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use shared::{AccountId, ProcessId};

use crate::core::process_table::ProcessStatus;
use crate::types::chrono_duration;

/// Counters and latency for one worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub process_id: ProcessId,
    pub account_id: AccountId,
    /// Restart count of the process these counters describe
    pub generation: u32,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    /// Exponential moving average in milliseconds
    pub avg_execution_time_ms: f64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl ProcessMetrics {
    pub fn new(process_id: ProcessId, account_id: AccountId, generation: u32) -> Self {
        Self {
            process_id,
            account_id,
            generation,
            total_tasks: 0,
            successful_tasks: 0,
            failed_tasks: 0,
            avg_execution_time_ms: 0.0,
            started_at: Utc::now(),
            uptime_secs: 0,
            last_error: None,
            last_error_at: None,
        }
    }

    /// Fold one finished task into the counters
    pub fn record_task(&mut self, success: bool, execution_time_ms: f64, error: Option<&str>, alpha: f64) {
        self.total_tasks += 1;
        if success {
            self.successful_tasks += 1;
        } else {
            self.failed_tasks += 1;
            self.last_error = error.map(str::to_string);
            self.last_error_at = Some(Utc::now());
        }

        if self.total_tasks == 1 {
            self.avg_execution_time_ms = execution_time_ms;
        } else {
            self.avg_execution_time_ms = alpha * execution_time_ms + (1.0 - alpha) * self.avg_execution_time_ms;
        }
    }

    pub fn refresh_uptime(&mut self, now: DateTime<Utc>) {
        self.uptime_secs = (now - self.started_at).num_seconds().max(0) as u64;
    }

    /// Percentage of tasks that succeeded; 0 before any task ran
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.successful_tasks as f64 / self.total_tasks as f64 * 100.0
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.failed_tasks as f64 / self.total_tasks as f64 * 100.0
    }
}

/// One completed API call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub account_id: AccountId,
    pub method: String,
    pub success: bool,
    pub execution_time_ms: f64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Bounded, time-windowed log of completed calls
#[derive(Debug)]
pub struct TaskHistory {
    entries: VecDeque<TaskHistoryEntry>,
    capacity: usize,
    retention: Duration,
}

impl TaskHistory {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            retention,
        }
    }

    pub fn push(&mut self, entry: TaskHistoryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Drop entries older than the retention horizon, returning how many went
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono_duration(self.retention);
        let before = self.entries.len();
        while self.entries.front().is_some_and(|e| e.timestamp < cutoff) {
            self.entries.pop_front();
        }
        before - self.entries.len()
    }

    /// Oldest first
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &TaskHistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Pool-wide snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_processes: usize,
    pub status_counts: BTreeMap<ProcessStatus, usize>,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub success_rate: f64,
    /// Mean of the per-process averages
    pub avg_execution_time_ms: f64,
    pub history_len: usize,
    pub timestamp: DateTime<Utc>,
}

impl SystemMetrics {
    pub fn collect<'a>(
        statuses: impl IntoIterator<Item = ProcessStatus>,
        metrics: impl IntoIterator<Item = &'a ProcessMetrics>,
        history_len: usize,
    ) -> Self {
        let mut status_counts = BTreeMap::new();
        let mut total_processes = 0;
        for status in statuses {
            *status_counts.entry(status).or_insert(0) += 1;
            total_processes += 1;
        }

        let (mut total, mut ok, mut failed, mut latency_sum, mut sampled) = (0, 0, 0, 0.0, 0usize);
        for m in metrics {
            total += m.total_tasks;
            ok += m.successful_tasks;
            failed += m.failed_tasks;
            if m.total_tasks > 0 {
                latency_sum += m.avg_execution_time_ms;
                sampled += 1;
            }
        }

        Self {
            total_processes,
            status_counts,
            total_tasks: total,
            successful_tasks: ok,
            failed_tasks: failed,
            success_rate: if total > 0 { ok as f64 / total as f64 * 100.0 } else { 0.0 },
            avg_execution_time_ms: if sampled > 0 { latency_sum / sampled as f64 } else { 0.0 },
            history_len,
            timestamp: Utc::now(),
        }
    }
}
