//! Worker process bookkeeping
//!
//! Pure state: the pool wraps a `ProcessTable` in its mutex and performs all
//! I/O outside of it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use shared::{AccountId, ProcessId};

/// Lifecycle state of a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProcessStatus {
    Starting,
    Ready,
    Busy,
    Error,
    Stopping,
    Stopped,
}

impl ProcessStatus {
    /// Counts against the pool's capacity; a failed worker's OS process
    /// lives until it is shut down
    pub fn is_live(&self) -> bool {
        !matches!(self, ProcessStatus::Stopped)
    }

    /// Can accept or is executing work
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProcessStatus::Ready | ProcessStatus::Busy)
    }
}

/// Everything the gateway tracks about one worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub process_id: ProcessId,
    pub account_id: AccountId,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Consecutive failed tasks
    pub error_count: u32,
    pub current_task_id: Option<Uuid>,
    pub task_started_at: Option<DateTime<Utc>>,
    /// Times this process slot has been restarted
    pub restart_count: u32,
    pub last_error: Option<String>,
}

impl ProcessRecord {
    pub fn starting(process_id: ProcessId, account_id: AccountId, restart_count: u32) -> Self {
        let now = Utc::now();
        Self {
            process_id,
            account_id,
            pid: None,
            status: ProcessStatus::Starting,
            created_at: now,
            last_heartbeat: now,
            error_count: 0,
            current_task_id: None,
            task_started_at: None,
            restart_count,
            last_error: None,
        }
    }

    pub fn begin_task(&mut self, task_id: Uuid, now: DateTime<Utc>) {
        self.status = ProcessStatus::Busy;
        self.current_task_id = Some(task_id);
        self.task_started_at = Some(now);
    }

    /// Back to Ready after a task completed, successfully or not
    pub fn finish_task(&mut self, now: DateTime<Utc>) {
        self.status = ProcessStatus::Ready;
        self.current_task_id = None;
        self.task_started_at = None;
        self.last_heartbeat = now;
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }

    /// How long the current task has been running
    pub fn busy_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match self.status {
            ProcessStatus::Busy => self.task_started_at.map(|started| now - started),
            _ => None,
        }
    }
}

/// Process records indexed by process id and by account
#[derive(Debug, Default)]
pub struct ProcessTable {
    records: HashMap<ProcessId, ProcessRecord>,
    by_account: HashMap<AccountId, ProcessId>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; an account maps to at most one process
    pub fn insert(&mut self, record: ProcessRecord) {
        if let Some(previous) = self.by_account.insert(record.account_id, record.process_id) {
            if previous != record.process_id {
                self.records.remove(&previous);
            }
        }
        self.records.insert(record.process_id, record);
    }

    /// Remove from both indexes at once
    pub fn remove(&mut self, process_id: &ProcessId) -> Option<ProcessRecord> {
        let record = self.records.remove(process_id)?;
        if self.by_account.get(&record.account_id) == Some(process_id) {
            self.by_account.remove(&record.account_id);
        }
        Some(record)
    }

    pub fn get(&self, process_id: &ProcessId) -> Option<&ProcessRecord> {
        self.records.get(process_id)
    }

    pub fn get_mut(&mut self, process_id: &ProcessId) -> Option<&mut ProcessRecord> {
        self.records.get_mut(process_id)
    }

    pub fn for_account(&self, account_id: &AccountId) -> Option<&ProcessRecord> {
        self.by_account.get(account_id).and_then(|id| self.records.get(id))
    }

    pub fn for_account_mut(&mut self, account_id: &AccountId) -> Option<&mut ProcessRecord> {
        let id = self.by_account.get(account_id)?;
        self.records.get_mut(id)
    }

    /// Processes counting against capacity
    pub fn live_count(&self) -> usize {
        self.records.values().filter(|r| r.status.is_live()).count()
    }

    pub fn records(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_process_per_account() {
        let mut table = ProcessTable::new();
        let account = AccountId::new();
        let first = ProcessId::new();
        let second = ProcessId::new();

        table.insert(ProcessRecord::starting(first, account, 0));
        table.insert(ProcessRecord::starting(second, account, 0));

        assert_eq!(table.len(), 1);
        assert_eq!(table.for_account(&account).unwrap().process_id, second);
        assert!(table.get(&first).is_none());
    }

    #[test]
    fn test_remove_clears_both_indexes() {
        let mut table = ProcessTable::new();
        let account = AccountId::new();
        let process = ProcessId::new();
        table.insert(ProcessRecord::starting(process, account, 0));

        let removed = table.remove(&process).unwrap();

        assert_eq!(removed.account_id, account);
        assert!(table.for_account(&account).is_none());
        assert!(table.is_empty());
        assert!(table.remove(&process).is_none());
    }

    #[test]
    fn test_live_count_includes_failed_workers() {
        let mut table = ProcessTable::new();
        for status in [ProcessStatus::Ready, ProcessStatus::Busy, ProcessStatus::Error, ProcessStatus::Stopped] {
            let mut record = ProcessRecord::starting(ProcessId::new(), AccountId::new(), 0);
            record.status = status;
            table.insert(record);
        }

        assert_eq!(table.live_count(), 3);
    }

    #[test]
    fn test_task_timing() {
        let now = Utc::now();
        let mut record = ProcessRecord::starting(ProcessId::new(), AccountId::new(), 0);
        record.begin_task(Uuid::new_v4(), now - chrono::Duration::seconds(90));

        assert_eq!(record.busy_for(now).unwrap().num_seconds(), 90);

        record.finish_task(now);
        assert!(record.busy_for(now).is_none());
        assert_eq!(record.status, ProcessStatus::Ready);
    }
}
