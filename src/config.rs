//! Configuration for the runlog binary.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use runlog_shipper::{
    circuit::CircuitConfig,
    retry::{BackoffConfig, BackoffStrategy},
    warehouse::{WarehouseConfig, TARGET_PLACEHOLDER},
    ShipperConfig, TableNames,
};
use serde::{Deserialize, Serialize};

/// Default configuration file, read from the working directory if present.
pub const CONFIG_FILE: &str = "runlog.toml";

/// Prefix for environment overrides, e.g. `RUNLOG_BATCH_SIZE`.
pub const ENV_PREFIX: &str = "RUNLOG_";

/// Complete binary configuration with defaults, file, and environment
/// overrides.
///
/// Sources in priority order:
/// 1. `RUNLOG_*` environment variables
/// 2. `runlog.toml`
/// 3. Built-in defaults
///
/// Durations are plain integers with their unit in the field name so that
/// every field can be overridden from the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Tenant scope written into every record as `org_slug`.
    #[serde(default = "default_scope")]
    pub scope: String,

    // Warehouse
    /// Insert URL containing `{target}`.
    #[serde(default)]
    pub warehouse_endpoint: String,
    /// Bearer token for the warehouse.
    #[serde(default)]
    pub warehouse_token: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_warehouse_timeout")]
    pub warehouse_timeout_seconds: u64,

    // Tables
    /// Target for pipeline start and end records.
    #[serde(default = "default_pipeline_runs_table")]
    pub pipeline_runs_table: String,
    /// Target for step start and end records.
    #[serde(default = "default_step_runs_table")]
    pub step_runs_table: String,
    /// Target for state transition records.
    #[serde(default = "default_state_transitions_table")]
    pub state_transitions_table: String,

    // Shipping
    /// Records per flush per category.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between worker flush cycles.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_seconds: u64,
    /// Write attempts per batch.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Concurrent flush workers.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Capacity of each category queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Milliseconds a producer waits for queue space.
    #[serde(default = "default_enqueue_timeout")]
    pub enqueue_timeout_ms: u64,
    /// Seconds a worker waits for one flush cycle.
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_seconds: u64,
    /// Seconds `stop()` waits for workers to exit. At least
    /// `flush_timeout_seconds`.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    // Retry
    /// Base retry delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Maximum retry delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Jitter factor for retry delays (0.0 to 1.0).
    #[serde(default = "default_jitter_factor")]
    pub retry_jitter_factor: f64,
    /// How retry delays grow.
    #[serde(default = "default_backoff_strategy")]
    pub retry_strategy: BackoffStrategy,

    // Circuit breaker
    /// Consecutive failed batches that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub circuit_failure_threshold: u32,
    /// Seconds the circuit stays open before a probe.
    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown_seconds: u64,

    // Logging
    /// Tracing filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Config {
    /// Loads configuration from defaults, `runlog.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result fails
    /// validation.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Same as [`Config::load`] with an explicit file path.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result fails
    /// validation.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Shipper configuration derived from these settings.
    pub fn to_shipper_config(&self) -> ShipperConfig {
        ShipperConfig {
            batch_size: self.batch_size,
            flush_interval: Duration::from_secs(self.flush_interval_seconds),
            max_retries: self.max_retries,
            num_workers: self.num_workers,
            queue_capacity: self.queue_capacity,
            enqueue_timeout: Duration::from_millis(self.enqueue_timeout_ms),
            flush_timeout: Duration::from_secs(self.flush_timeout_seconds),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
                jitter_factor: self.retry_jitter_factor,
                strategy: self.retry_strategy,
            },
            circuit: CircuitConfig {
                failure_threshold: self.circuit_failure_threshold,
                cooldown: Duration::from_secs(self.circuit_cooldown_seconds),
            },
            tables: TableNames {
                pipeline_runs: self.pipeline_runs_table.clone(),
                step_runs: self.step_runs_table.clone(),
                state_transitions: self.state_transitions_table.clone(),
            },
        }
    }

    /// Warehouse sink configuration derived from these settings.
    pub fn to_warehouse_config(&self) -> WarehouseConfig {
        WarehouseConfig {
            endpoint: self.warehouse_endpoint.clone(),
            auth_token: self.warehouse_token.clone(),
            timeout: Duration::from_secs(self.warehouse_timeout_seconds),
            ..WarehouseConfig::default()
        }
    }

    /// Validates configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.scope.trim().is_empty() {
            anyhow::bail!("scope must not be empty");
        }

        if self.warehouse_endpoint.is_empty() {
            anyhow::bail!("warehouse_endpoint must be set");
        }

        if !self.warehouse_endpoint.contains(TARGET_PLACEHOLDER) {
            anyhow::bail!("warehouse_endpoint must contain {TARGET_PLACEHOLDER}");
        }

        if self.warehouse_timeout_seconds == 0 {
            anyhow::bail!("warehouse_timeout_seconds must be greater than 0");
        }

        if self.flush_interval_seconds == 0 {
            anyhow::bail!("flush_interval_seconds must be greater than 0");
        }

        self.to_shipper_config().validate().context("invalid shipper settings")?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            warehouse_endpoint: String::new(),
            warehouse_token: None,
            warehouse_timeout_seconds: default_warehouse_timeout(),
            pipeline_runs_table: default_pipeline_runs_table(),
            step_runs_table: default_step_runs_table(),
            state_transitions_table: default_state_transitions_table(),
            batch_size: default_batch_size(),
            flush_interval_seconds: default_flush_interval(),
            max_retries: default_max_retries(),
            num_workers: default_num_workers(),
            queue_capacity: default_queue_capacity(),
            enqueue_timeout_ms: default_enqueue_timeout(),
            flush_timeout_seconds: default_flush_timeout(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_jitter_factor: default_jitter_factor(),
            retry_strategy: default_backoff_strategy(),
            circuit_failure_threshold: default_failure_threshold(),
            circuit_cooldown_seconds: default_circuit_cooldown(),
            log_filter: default_log_filter(),
        }
    }
}

fn default_scope() -> String {
    "default".to_string()
}

fn default_warehouse_timeout() -> u64 {
    30
}

fn default_pipeline_runs_table() -> String {
    TableNames::default().pipeline_runs
}

fn default_step_runs_table() -> String {
    TableNames::default().step_runs
}

fn default_state_transitions_table() -> String {
    TableNames::default().state_transitions
}

fn default_batch_size() -> usize {
    runlog_shipper::DEFAULT_BATCH_SIZE
}

fn default_flush_interval() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_num_workers() -> usize {
    runlog_shipper::DEFAULT_WORKER_COUNT
}

fn default_queue_capacity() -> usize {
    runlog_shipper::DEFAULT_QUEUE_CAPACITY
}

fn default_enqueue_timeout() -> u64 {
    5_000
}

fn default_flush_timeout() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    90
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_backoff_strategy() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_cooldown() -> u64 {
    60
}

fn default_log_filter() -> String {
    "info,runlog=debug".to_string()
}
