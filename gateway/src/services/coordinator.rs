//! Pool coordinator: account validation, metrics and health around the pool

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use shared::{process_debug, process_error, process_info, process_warn, AccountId, ProcessId, ProcessRole};

use crate::config::CoordinatorConfig;
use crate::core::metrics::{ProcessMetrics, SystemMetrics, TaskHistory, TaskHistoryEntry};
use crate::core::process_table::ProcessRecord;
use crate::error::{GatewayError, GatewayResult};
use crate::services::worker_pool::WorkerPool;
use crate::traits::{AccountStore, WorkerLauncher};
use crate::types::{chrono_duration, AccountFilter};

/// Worker method every worker answers without touching the broker
pub const HEALTH_CHECK_METHOD: &str = "health_check";

/// Outcome of probing one account's worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub account_id: AccountId,
    pub healthy: bool,
    pub details: Option<Value>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

struct Loops {
    handles: Vec<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

pub struct PoolCoordinator<L: WorkerLauncher> {
    pool: Arc<WorkerPool<L>>,
    store: Arc<dyn AccountStore>,
    config: CoordinatorConfig,
    metrics: Mutex<HashMap<ProcessId, ProcessMetrics>>,
    history: Mutex<TaskHistory>,
    loops: Mutex<Option<Loops>>,
}

impl<L: WorkerLauncher + 'static> PoolCoordinator<L> {
    pub fn new(pool: Arc<WorkerPool<L>>, store: Arc<dyn AccountStore>) -> Self {
        Self::with_config(pool, store, CoordinatorConfig::default())
    }

    pub fn with_config(pool: Arc<WorkerPool<L>>, store: Arc<dyn AccountStore>, config: CoordinatorConfig) -> Self {
        let history = TaskHistory::new(config.history_capacity, config.metrics_retention);
        Self {
            pool,
            store,
            config,
            metrics: Mutex::new(HashMap::new()),
            history: Mutex::new(history),
            loops: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool<L>> {
        &self.pool
    }

    /// Execute a broker method on the account's worker and record the outcome
    pub async fn execute_api_call(
        &self,
        account_id: AccountId,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> GatewayResult<Value> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(GatewayError::AccountNotFound { account_id })?;
        if !account.is_active() {
            return Err(GatewayError::AccountInactive {
                account_id,
                status: account.status.to_string(),
            });
        }

        let process_id = self.pool.get_or_create_process(account_id).await?;
        let generation = self
            .pool
            .get_status(account_id)
            .await
            .map_or(0, |record| record.restart_count);
        let started = Instant::now();
        let result = self.pool.execute_task(account_id, method, args, kwargs, timeout).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let error = result.as_ref().err().map(ToString::to_string);
        {
            let mut metrics = self.metrics.lock().await;
            let entry = metrics
                .entry(process_id)
                .or_insert_with(|| ProcessMetrics::new(process_id, account_id, generation));
            if entry.generation != generation {
                *entry = ProcessMetrics::new(process_id, account_id, generation);
            }
            entry.record_task(result.is_ok(), elapsed_ms, error.as_deref(), self.config.ema_alpha);
        }
        // The call itself may have restarted the worker
        self.rebuild_restarted_metrics(&self.pool.get_all().await).await;
        self.history.lock().await.push(TaskHistoryEntry {
            account_id,
            method: method.to_string(),
            success: result.is_ok(),
            execution_time_ms: elapsed_ms,
            error,
            timestamp: Utc::now(),
        });

        match &result {
            Ok(_) => process_debug!(
                ProcessRole::current(),
                "✅ {} on {} in {:.1}ms",
                method,
                account.name,
                elapsed_ms
            ),
            Err(e) => process_warn!(ProcessRole::current(), "⚠️ {} on {} failed: {}", method, account.name, e),
        }
        result
    }

    /// Start counters over for processes restarted since they were built
    async fn rebuild_restarted_metrics(&self, records: &[ProcessRecord]) {
        let mut metrics = self.metrics.lock().await;
        for record in records {
            if let Some(entry) = metrics.get_mut(&record.process_id) {
                if entry.generation != record.restart_count {
                    *entry = ProcessMetrics::new(record.process_id, record.account_id, record.restart_count);
                }
            }
        }
    }

    /// Probe the account's worker with the built-in health method
    pub async fn health_check_account(&self, account_id: AccountId) -> HealthReport {
        let outcome = self
            .pool
            .execute_task(
                account_id,
                HEALTH_CHECK_METHOD,
                Vec::new(),
                Map::new(),
                Some(self.config.health_check_timeout),
            )
            .await;

        let (healthy, details, error) = match outcome {
            Ok(details) => (true, Some(details), None),
            Err(e) => (false, None, Some(e.to_string())),
        };
        HealthReport {
            account_id,
            healthy,
            details,
            error,
            timestamp: Utc::now(),
        }
    }

    /// Probe every active account concurrently; failures stay per-account
    pub async fn health_check_all_accounts(&self) -> GatewayResult<Vec<HealthReport>> {
        let accounts = self.store.list_accounts(AccountFilter::active()).await?;
        let reports = join_all(accounts.iter().map(|a| self.health_check_account(a.id))).await;

        let unhealthy = reports.iter().filter(|r| !r.healthy).count();
        if unhealthy > 0 {
            process_warn!(
                ProcessRole::current(),
                "🩺 {}/{} accounts unhealthy",
                unhealthy,
                reports.len()
            );
        }
        Ok(reports)
    }

    pub async fn get_system_metrics(&self) -> SystemMetrics {
        let records = self.pool.get_all().await;
        self.rebuild_restarted_metrics(&records).await;
        let statuses: Vec<_> = records.into_iter().map(|r| r.status).collect();
        let history_len = self.history.lock().await.len();
        let metrics = self.metrics.lock().await;
        SystemMetrics::collect(statuses, metrics.values(), history_len)
    }

    /// Restart the account's worker and start its metrics over
    pub async fn restart_account_process(&self, account_id: AccountId) -> GatewayResult<bool> {
        let restarted = self.pool.restart_process(account_id).await?;
        if let Some(record) = self.pool.get_status(account_id).await {
            self.metrics
                .lock()
                .await
                .insert(
                    record.process_id,
                    ProcessMetrics::new(record.process_id, account_id, record.restart_count),
                );
        }
        if restarted {
            process_info!(ProcessRole::current(), "🔄 Restarted worker for account {}", account_id.short());
        }
        Ok(restarted)
    }

    /// Metrics for one process, or all of them
    pub async fn get_process_metrics(&self, process_id: Option<ProcessId>) -> Vec<ProcessMetrics> {
        self.rebuild_restarted_metrics(&self.pool.get_all().await).await;
        let metrics = self.metrics.lock().await;
        match process_id {
            Some(id) => metrics.get(&id).cloned().into_iter().collect(),
            None => metrics.values().cloned().collect(),
        }
    }

    pub async fn get_account_process_status(&self, account_id: AccountId) -> Option<ProcessRecord> {
        self.pool.get_status(account_id).await
    }

    pub async fn get_all_process_status(&self) -> Vec<ProcessRecord> {
        self.pool.get_all().await
    }

    /// Newest first
    pub async fn task_history(&self, limit: Option<usize>) -> Vec<TaskHistoryEntry> {
        let history = self.history.lock().await;
        let entries = history.entries().rev().cloned();
        match limit {
            Some(limit) => entries.take(limit).collect(),
            None => entries.collect(),
        }
    }

    /// One health pass: uptime, error-rate restarts, stuck tasks, scale advice
    pub async fn run_health_cycle(&self) {
        let now = Utc::now();
        let records = self.pool.get_all().await;
        self.rebuild_restarted_metrics(&records).await;

        let noisy: Vec<AccountId> = {
            let mut metrics = self.metrics.lock().await;
            for m in metrics.values_mut() {
                m.refresh_uptime(now);
            }
            metrics
                .values()
                .filter(|m| {
                    m.total_tasks > self.config.min_tasks_for_error_rate
                        && m.error_rate() > self.config.restart_error_rate
                })
                .filter(|m| records.iter().any(|r| r.process_id == m.process_id))
                .map(|m| m.account_id)
                .collect()
        };
        for account_id in noisy {
            process_warn!(
                ProcessRole::current(),
                "📉 Error rate above {}% for account {}, restarting",
                self.config.restart_error_rate,
                account_id.short()
            );
            if let Err(e) = self.restart_account_process(account_id).await {
                process_error!(ProcessRole::current(), "❌ Restart of {} failed: {}", account_id.short(), e);
            }
        }

        let stuck_after = chrono_duration(self.config.stuck_task_threshold);
        for record in &records {
            if record.busy_for(now).is_some_and(|busy| busy > stuck_after) {
                process_warn!(
                    ProcessRole::current(),
                    "⏳ Task {:?} stuck on account {}, killing worker",
                    record.current_task_id,
                    record.account_id.short()
                );
                if let Err(e) = self.pool.kill_process(record.account_id).await {
                    process_error!(ProcessRole::current(), "❌ Kill of stuck worker failed: {}", e);
                }
            }
        }

        if self.config.auto_scale_enabled {
            let live = self.pool.active_count().await;
            if live < self.config.min_processes {
                process_info!(
                    ProcessRole::current(),
                    "📊 {} live workers, below the minimum of {}",
                    live,
                    self.config.min_processes
                );
            }
        }
    }

    /// Prune old history and metrics of processes that no longer exist
    pub async fn run_cleanup(&self) -> usize {
        let pruned = self.history.lock().await.prune(Utc::now());
        let live: Vec<ProcessId> = self.pool.get_all().await.into_iter().map(|r| r.process_id).collect();
        self.metrics.lock().await.retain(|id, _| live.contains(id));
        if pruned > 0 {
            process_debug!(ProcessRole::current(), "🧹 Pruned {} task history entries", pruned);
        }
        pruned
    }

    /// Start the health and cleanup loops
    pub async fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock().await;
        if loops.is_some() {
            return;
        }
        let (stop, stopped) = watch::channel(false);

        let health = {
            let coordinator = Arc::clone(self);
            let mut stopped = stopped.clone();
            let every = self.config.health_check_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => coordinator.run_health_cycle().await,
                        _ = stopped.changed() => break,
                    }
                }
            })
        };

        let cleanup = {
            let coordinator = Arc::clone(self);
            let mut stopped = stopped;
            let every = self.config.cleanup_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            coordinator.run_cleanup().await;
                        }
                        _ = stopped.changed() => break,
                    }
                }
            })
        };

        *loops = Some(Loops {
            handles: vec![health, cleanup],
            stop,
        });
        process_info!(ProcessRole::current(), "🩺 Pool coordinator loops started");
    }

    pub async fn stop(&self) {
        if let Some(loops) = self.loops.lock().await.take() {
            let _ = loops.stop.send(true);
            for handle in loops.handles {
                let _ = handle.await;
            }
        }
    }
}
