//! Gateway configuration
//!
//! Defaults cover every knob; `from_env` overlays `GATEWAY_*` variables
//! (after loading a `.env` file when present) and validates the result.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use shared::BrokerEnvironment;

use crate::error::{GatewayError, GatewayResult};

/// Worker pool tuning
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_processes: usize,
    pub startup_timeout: Duration,
    /// Liveness poll while waiting for a worker's ready message
    pub ready_poll_interval: Duration,
    /// Bound on each shutdown escalation step
    pub shutdown_timeout: Duration,
    /// Monitor tick and heartbeat probe interval
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a worker counts as hung
    pub process_timeout: Duration,
    /// Consecutive task failures that trigger a restart
    pub failure_threshold: u32,
    /// Automatic restarts allowed per account within `restart_cooldown`
    pub max_restarts: u32,
    pub restart_cooldown: Duration,
    pub default_task_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_processes: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            startup_timeout: Duration::from_secs(30),
            ready_poll_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            process_timeout: Duration::from_secs(300),
            failure_threshold: 3,
            max_restarts: 3,
            restart_cooldown: Duration::from_secs(60),
            default_task_timeout: Duration::from_secs(30),
        }
    }
}

/// How worker processes are launched
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub worker_binary: PathBuf,
    pub log_level: String,
    pub request_timeout: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            worker_binary: PathBuf::from("worker"),
            log_level: "info".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Pool coordinator health and metrics settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub metrics_retention: Duration,
    pub cleanup_interval: Duration,
    pub history_capacity: usize,
    /// Weight of the newest sample in the latency average
    pub ema_alpha: f64,
    pub auto_scale_enabled: bool,
    pub min_processes: usize,
    /// Busy time after which a task is considered stuck
    pub stuck_task_threshold: Duration,
    /// Error rate (percent) above which a process is restarted
    pub restart_error_rate: f64,
    /// Tasks a process must have run before its error rate counts
    pub min_tasks_for_error_rate: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(10),
            metrics_retention: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
            history_capacity: 10_000,
            ema_alpha: 0.1,
            auto_scale_enabled: true,
            min_processes: 1,
            stuck_task_threshold: Duration::from_secs(300),
            restart_error_rate: 50.0,
            min_tasks_for_error_rate: 10,
        }
    }
}

/// Account router thresholds
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Accounts at or above this error count are skipped for trading
    pub trading_error_threshold: u32,
    /// Accounts at or above this error count are skipped for everything else
    pub data_error_threshold: u32,
    /// Latency samples kept per account
    pub latency_window: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            trading_error_threshold: 5,
            data_error_threshold: 10,
            latency_window: 100,
        }
    }
}

/// Credential lifecycle and token endpoint settings
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub production_url: String,
    pub sandbox_url: String,
    pub token_path: String,
    pub profile_path: String,
    pub api_timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub default_retry_after: Duration,
    /// Tokens expiring within this window are refreshed
    pub refresh_threshold: Duration,
    pub default_expires_in: Duration,
    pub max_retries: u32,
    pub bulk_concurrency: usize,
    pub scheduler_interval: Duration,
    pub scheduler_error_backoff: Duration,
    pub scheduler_enabled: bool,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            production_url: "https://openapi.tigerbrokers.com".to_string(),
            sandbox_url: "https://openapi-sandbox.tigerbrokers.com".to_string(),
            token_path: "/oauth2/token".to_string(),
            profile_path: "/account/profile".to_string(),
            api_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            default_retry_after: Duration::from_secs(60),
            refresh_threshold: Duration::from_secs(3600),
            default_expires_in: Duration::from_secs(3600),
            max_retries: 3,
            bulk_concurrency: 3,
            scheduler_interval: Duration::from_secs(900),
            scheduler_error_backoff: Duration::from_secs(300),
            scheduler_enabled: true,
        }
    }
}

impl CredentialConfig {
    /// Default broker server for an environment
    pub fn server_url(&self, environment: BrokerEnvironment) -> &str {
        match environment {
            BrokerEnvironment::Production => &self.production_url,
            BrokerEnvironment::Sandbox => &self.sandbox_url,
        }
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub pool: PoolConfig,
    pub launcher: LauncherConfig,
    pub coordinator: CoordinatorConfig,
    pub router: RouterConfig,
    pub credentials: CredentialConfig,
}

impl GatewayConfig {
    /// Defaults overlaid with `GATEWAY_*` environment variables
    pub fn from_env() -> GatewayResult<Self> {
        dotenv::dotenv().ok();
        let mut config = Self::default();

        let pool = &mut config.pool;
        pool.max_processes = env_or("GATEWAY_MAX_PROCESSES", pool.max_processes)?;
        pool.startup_timeout = env_secs("GATEWAY_STARTUP_TIMEOUT_SECS", pool.startup_timeout)?;
        pool.shutdown_timeout = env_secs("GATEWAY_SHUTDOWN_TIMEOUT_SECS", pool.shutdown_timeout)?;
        pool.heartbeat_interval = env_secs("GATEWAY_HEARTBEAT_INTERVAL_SECS", pool.heartbeat_interval)?;
        pool.process_timeout = env_secs("GATEWAY_PROCESS_TIMEOUT_SECS", pool.process_timeout)?;
        pool.failure_threshold = env_or("GATEWAY_FAILURE_THRESHOLD", pool.failure_threshold)?;
        pool.max_restarts = env_or("GATEWAY_MAX_RESTARTS", pool.max_restarts)?;
        pool.restart_cooldown = env_secs("GATEWAY_RESTART_COOLDOWN_SECS", pool.restart_cooldown)?;
        pool.default_task_timeout = env_secs("GATEWAY_TASK_TIMEOUT_SECS", pool.default_task_timeout)?;

        let launcher = &mut config.launcher;
        if let Ok(path) = std::env::var("GATEWAY_WORKER_BINARY") {
            launcher.worker_binary = PathBuf::from(path);
        }
        launcher.log_level = env_or("GATEWAY_WORKER_LOG_LEVEL", launcher.log_level.clone())?;

        let coordinator = &mut config.coordinator;
        coordinator.health_check_interval =
            env_secs("GATEWAY_HEALTH_CHECK_INTERVAL_SECS", coordinator.health_check_interval)?;
        coordinator.metrics_retention = env_secs("GATEWAY_METRICS_RETENTION_SECS", coordinator.metrics_retention)?;
        coordinator.auto_scale_enabled = env_or("GATEWAY_AUTO_SCALE", coordinator.auto_scale_enabled)?;
        coordinator.min_processes = env_or("GATEWAY_MIN_PROCESSES", coordinator.min_processes)?;

        let credentials = &mut config.credentials;
        credentials.production_url = env_or("GATEWAY_PRODUCTION_URL", credentials.production_url.clone())?;
        credentials.sandbox_url = env_or("GATEWAY_SANDBOX_URL", credentials.sandbox_url.clone())?;
        credentials.api_timeout = env_secs("GATEWAY_API_TIMEOUT_SECS", credentials.api_timeout)?;
        credentials.max_attempts = env_or("GATEWAY_API_RETRIES", credentials.max_attempts)?;
        credentials.refresh_threshold = env_secs("GATEWAY_REFRESH_THRESHOLD_SECS", credentials.refresh_threshold)?;
        credentials.bulk_concurrency = env_or("GATEWAY_REFRESH_CONCURRENCY", credentials.bulk_concurrency)?;
        credentials.scheduler_interval = env_secs("GATEWAY_REFRESH_INTERVAL_SECS", credentials.scheduler_interval)?;
        credentials.scheduler_enabled = env_or("GATEWAY_REFRESH_SCHEDULER", credentials.scheduler_enabled)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> GatewayResult<()> {
        if self.pool.max_processes == 0 {
            return Err(GatewayError::config("max_processes must be at least 1"));
        }
        if self.pool.failure_threshold == 0 {
            return Err(GatewayError::config("failure_threshold must be at least 1"));
        }
        if self.pool.startup_timeout.is_zero() || self.pool.heartbeat_interval.is_zero() {
            return Err(GatewayError::config("startup_timeout and heartbeat_interval must be non-zero"));
        }
        if self.pool.process_timeout <= self.pool.heartbeat_interval {
            return Err(GatewayError::config("process_timeout must exceed heartbeat_interval"));
        }
        if !(0.0..=1.0).contains(&self.coordinator.ema_alpha) || self.coordinator.ema_alpha == 0.0 {
            return Err(GatewayError::config("ema_alpha must be in (0, 1]"));
        }
        if self.router.latency_window == 0 {
            return Err(GatewayError::config("latency_window must be at least 1"));
        }
        if self.credentials.max_attempts == 0 || self.credentials.bulk_concurrency == 0 {
            return Err(GatewayError::config("max_attempts and bulk_concurrency must be at least 1"));
        }
        for url in [&self.credentials.production_url, &self.credentials.sandbox_url] {
            url::Url::parse(url).map_err(|e| GatewayError::config(format!("invalid server url '{url}': {e}")))?;
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> GatewayResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| GatewayError::config(format!("{name} has invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &str, default: Duration) -> GatewayResult<Duration> {
    env_or(name, default.as_secs()).map(Duration::from_secs)
}
