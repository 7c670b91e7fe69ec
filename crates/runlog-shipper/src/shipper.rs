//! Shipper orchestrator: ingestion API, flush cycle and lifecycle.
//!
//! A [`Shipper`] is created once per tenant scope. Producers call the
//! `record_*` methods; records land in one bounded queue per
//! [`Category`]. Workers started by [`Shipper::start`] periodically run the
//! flush cycle, which drains each queue and writes the batch through the
//! circuit breaker and batch writer. [`Shipper::stop`] cancels the workers
//! and drains whatever is left.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use runlog_core::{
    payload::duration_ms,
    Category, Clock, IntoLogRecord, LifecycleEvent, LogRecord, PipelineEnd, PipelineStart,
    RealClock, StateTransition, StepEnd, StepStart,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    circuit::{Admission, CircuitBreaker, CircuitConfig},
    error::{Result, ShipperError},
    introspection::{LostCounters, QueueDepth, QueueDepths, ShipperStats},
    queue::BoundedQueue,
    retry::BackoffConfig,
    sink::Sink,
    worker_pool::WorkerPool,
    writer::{BatchWriter, FlushBatch, WriteOutcome},
};

/// Queue utilization above which a flush cycle warns.
pub const UTILIZATION_WARNING_PCT: f64 = 80.0;

/// Sink target names per category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNames {
    /// Target for pipeline start and end records.
    pub pipeline_runs: String,
    /// Target for step start and end records.
    pub step_runs: String,
    /// Target for state transition records.
    pub state_transitions: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            pipeline_runs: "pipeline_runs".to_string(),
            step_runs: "step_runs".to_string(),
            state_transitions: "state_transitions".to_string(),
        }
    }
}

impl TableNames {
    /// Target `category` is written to.
    pub fn target(&self, category: Category) -> &str {
        match category {
            Category::PipelineStart | Category::PipelineEnd => &self.pipeline_runs,
            Category::StepStart | Category::StepEnd => &self.step_runs,
            Category::StateTransition => &self.state_transitions,
        }
    }
}

/// Static shipper configuration, injected at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipperConfig {
    /// Records per flush per category.
    pub batch_size: usize,
    /// Pause between a worker's flush cycles.
    pub flush_interval: Duration,
    /// Write attempts per batch, including the first one.
    pub max_retries: u32,
    /// Number of flush workers.
    pub num_workers: usize,
    /// Capacity of each category queue.
    pub queue_capacity: usize,
    /// Longest a producer waits for queue space.
    pub enqueue_timeout: Duration,
    /// Longest a worker waits on one flush cycle before abandoning it.
    pub flush_timeout: Duration,
    /// Longest `stop` waits for workers to exit.
    pub shutdown_timeout: Duration,
    /// Retry delays.
    pub backoff: BackoffConfig,
    /// Breaker thresholds.
    pub circuit: CircuitConfig,
    /// Sink targets.
    pub tables: TableNames,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_secs(5),
            max_retries: 3,
            num_workers: crate::DEFAULT_WORKER_COUNT,
            queue_capacity: crate::DEFAULT_QUEUE_CAPACITY,
            enqueue_timeout: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(90),
            backoff: BackoffConfig::default(),
            circuit: CircuitConfig::default(),
            tables: TableNames::default(),
        }
    }
}

impl ShipperConfig {
    /// Rejects values the shipper cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ShipperError::configuration("batch_size must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(ShipperError::configuration("queue_capacity must be greater than zero"));
        }
        if self.num_workers == 0 {
            return Err(ShipperError::configuration("num_workers must be greater than zero"));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(ShipperError::configuration(
                "circuit failure_threshold must be greater than zero",
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_factor) {
            return Err(ShipperError::configuration("backoff jitter_factor must be within [0, 1]"));
        }
        if self.shutdown_timeout < self.flush_timeout {
            return Err(ShipperError::configuration(
                "shutdown_timeout must be at least flush_timeout so in-flight flushes can finish",
            ));
        }
        if self.backoff.base_delay > self.backoff.max_delay {
            return Err(ShipperError::configuration(
                "backoff base_delay must not exceed max_delay",
            ));
        }
        for category in Category::ALL {
            if self.tables.target(category).trim().is_empty() {
                return Err(ShipperError::configuration(format!(
                    "table name for {category} must not be empty"
                )));
            }
        }
        Ok(())
    }
}

/// What one flush cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Batches the sink accepted.
    pub batches_written: u64,
    /// Records in those batches.
    pub records_written: u64,
    /// Batches given up on.
    pub batches_failed: u64,
    /// Records in those batches, now counted as lost.
    pub records_lost: u64,
    /// Whether an open circuit cut the cycle short.
    pub short_circuited: bool,
}

impl FlushReport {
    /// Whether the cycle moved any records out of the queues.
    pub fn made_progress(&self) -> bool {
        self.records_written + self.records_lost > 0
    }

    fn absorb(&mut self, other: Self) {
        self.batches_written += other.batches_written;
        self.records_written += other.records_written;
        self.batches_failed += other.batches_failed;
        self.records_lost += other.records_lost;
        self.short_circuited |= other.short_circuited;
    }
}

/// State shared between the shipper handle and its workers.
#[derive(Debug)]
pub(crate) struct ShipperCore {
    id: Uuid,
    scope: String,
    config: ShipperConfig,
    queues: Vec<BoundedQueue>,
    breaker: CircuitBreaker,
    writer: BatchWriter,
    lost: LostCounters,
    stats: ShipperStats,
    running: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl ShipperCore {
    fn queue(&self, category: Category) -> &BoundedQueue {
        &self.queues[category.index()]
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn config(&self) -> &ShipperConfig {
        &self.config
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    async fn enqueue(&self, record: LogRecord) -> Result<()> {
        let category = record.category;
        let timeout = self.config.enqueue_timeout;

        if let Err(enqueue_error) = self.queue(category).enqueue(record, timeout).await {
            if category.is_critical() {
                warn!(
                    shipper_id = %self.id,
                    category = %category,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    error = %enqueue_error,
                    "critical record rejected, queue full"
                );
                return Err(ShipperError::backpressure_timeout(category, timeout));
            }

            self.lost.add(category, 1);
            warn!(
                shipper_id = %self.id,
                category = %category,
                lost_count = self.lost.get(category),
                "best-effort record dropped, queue full"
            );
            return Ok(());
        }

        ShipperStats::incr(&self.stats.records_enqueued, 1);
        Ok(())
    }

    /// Queues above [`UTILIZATION_WARNING_PCT`], as `(category, pct)`.
    pub(crate) fn high_utilization(&self) -> Vec<(Category, f64)> {
        self.queues
            .iter()
            .map(|queue| (queue.category(), queue.utilization_pct()))
            .filter(|(_, utilization_pct)| *utilization_pct > UTILIZATION_WARNING_PCT)
            .collect()
    }

    fn warn_on_high_utilization(&self) {
        for (category, utilization_pct) in self.high_utilization() {
            let queue = self.queue(category);
            warn!(
                shipper_id = %self.id,
                category = %category,
                size = queue.len(),
                capacity = queue.capacity(),
                utilization_pct,
                "queue utilization high, producers are outpacing flushes"
            );
        }
    }

    /// One pass over every category in fixed order.
    pub(crate) async fn flush_cycle(&self) -> FlushReport {
        let mut report = FlushReport::default();
        self.warn_on_high_utilization();

        for category in Category::ALL {
            let queue = self.queue(category);
            if queue.is_empty() {
                continue;
            }

            let admission = self.breaker.admit().await;
            let _probe = match admission {
                Admission::Rejected => {
                    debug!(shipper_id = %self.id, "circuit open, skipping flush cycle");
                    report.short_circuited = true;
                    break;
                },
                Admission::Probe(ticket) => Some(self.breaker.hold_probe(ticket)),
                Admission::Admitted => None,
            };

            let records = queue.drain(self.config.batch_size).await;
            if records.is_empty() {
                continue;
            }

            let batch = FlushBatch::from_records(category, self.config.tables.target(category), records);
            let outcome = if admission.is_probe() {
                self.writer.write_once(&batch).await
            } else {
                self.writer.write(&batch).await
            };
            let oldest_age_ms = batch
                .oldest_enqueued_at
                .map(|enqueued_at| duration_ms(enqueued_at, self.clock.now_utc()));

            let batch_size = batch.len() as u64;
            match outcome {
                WriteOutcome::Written { .. } => {
                    self.breaker.record_success().await;
                    ShipperStats::incr(&self.stats.batches_written, 1);
                    ShipperStats::incr(&self.stats.records_written, batch_size);
                    report.batches_written += 1;
                    report.records_written += batch_size;
                    debug!(
                        shipper_id = %self.id,
                        category = %category,
                        batch_size,
                        oldest_age_ms,
                        "batch written"
                    );
                },
                WriteOutcome::Failed { attempts, error } => {
                    self.breaker.record_failure().await;
                    self.lost.add(category, batch_size);
                    ShipperStats::incr(&self.stats.batches_failed, 1);
                    report.batches_failed += 1;
                    report.records_lost += batch_size;
                    error!(
                        shipper_id = %self.id,
                        category = %category,
                        target = %batch.target,
                        batch_size,
                        attempts,
                        oldest_age_ms,
                        probe = admission.is_probe(),
                        error_kind = error.kind(),
                        error = %error,
                        "batch write failed, records lost"
                    );
                },
            }
        }

        ShipperStats::incr(&self.stats.flush_cycles, 1);
        report
    }

    /// Runs a flush cycle as its own task and waits at most `flush_timeout`
    /// for it. A flush that overruns keeps running in the background.
    pub(crate) async fn guarded_flush(self: &Arc<Self>, worker_id: usize) {
        let core = Arc::clone(self);
        let flush = tokio::spawn(async move { core.flush_cycle().await });

        match tokio::time::timeout(self.config.flush_timeout, flush).await {
            Ok(Ok(report)) => {
                if report.made_progress() {
                    debug!(
                        shipper_id = %self.id,
                        worker_id,
                        records_written = report.records_written,
                        records_lost = report.records_lost,
                        "flush cycle completed"
                    );
                }
            },
            Ok(Err(join_error)) => {
                error!(
                    shipper_id = %self.id,
                    worker_id,
                    error = %join_error,
                    "flush cycle task panicked"
                );
            },
            Err(_elapsed) => {
                ShipperStats::incr(&self.stats.flushes_abandoned, 1);
                warn!(
                    shipper_id = %self.id,
                    worker_id,
                    timeout_ms = u64::try_from(self.config.flush_timeout.as_millis()).unwrap_or(u64::MAX),
                    "flush cycle exceeded timeout, abandoned"
                );
            },
        }
    }

    /// Flushes until every queue is empty or a cycle moves nothing.
    async fn drain_all(&self) -> FlushReport {
        let mut total = FlushReport::default();
        loop {
            if self.queues.iter().all(BoundedQueue::is_empty) {
                break;
            }
            let report = self.flush_cycle().await;
            total.absorb(report);
            if !report.made_progress() {
                break;
            }
        }
        total
    }

    async fn snapshot(&self) -> QueueDepths {
        let queues = self
            .queues
            .iter()
            .map(|queue| QueueDepth {
                category: queue.category(),
                size: queue.len(),
                capacity: queue.capacity(),
                utilization_pct: queue.utilization_pct(),
                lost_count: self.lost.get(queue.category()),
            })
            .collect();

        QueueDepths {
            queues,
            total_lost: self.lost.total(),
            circuit: self.breaker.snapshot().await,
            running: self.running.load(Ordering::Acquire),
            stats: self.stats.snapshot(),
        }
    }
}

/// Tenant-scoped audit log shipper.
///
/// ```no_run
/// use std::sync::Arc;
///
/// use runlog_core::PipelineStart;
/// use runlog_shipper::{memory::MemorySink, Shipper, ShipperConfig};
///
/// # async fn example() -> runlog_shipper::Result<()> {
/// let shipper = Shipper::new("acme", ShipperConfig::default(), Arc::new(MemorySink::new()))?;
/// shipper.start().await?;
///
/// shipper
///     .record_pipeline_start(PipelineStart {
///         run_id: "run-1".into(),
///         pipeline_id: "billing_sync".into(),
///         trigger_type: "scheduler".into(),
///         trigger_by: "cron".into(),
///         parameters: None,
///     })
///     .await?;
///
/// shipper.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Shipper {
    core: Arc<ShipperCore>,
    workers: Mutex<Option<WorkerPool>>,
}

impl Shipper {
    /// Creates a stopped shipper on the real clock.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if `config` is invalid.
    pub fn new(scope: impl Into<String>, config: ShipperConfig, sink: Arc<dyn Sink>) -> Result<Self> {
        Self::with_clock(scope, config, sink, Arc::new(RealClock::new()))
    }

    /// Creates a stopped shipper reading time from `clock`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if `config` is invalid.
    pub fn with_clock(
        scope: impl Into<String>,
        config: ShipperConfig,
        sink: Arc<dyn Sink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let queues = Category::ALL
            .iter()
            .map(|category| BoundedQueue::new(*category, config.queue_capacity, Arc::clone(&clock)))
            .collect();
        let breaker = CircuitBreaker::new(config.circuit.clone(), Arc::clone(&clock));
        let writer = BatchWriter::new(
            sink,
            config.backoff.to_policy(config.max_retries),
            Arc::clone(&clock),
        );

        let core = ShipperCore {
            id: Uuid::new_v4(),
            scope: scope.into(),
            config,
            queues,
            breaker,
            writer,
            lost: LostCounters::new(),
            stats: ShipperStats::default(),
            running: AtomicBool::new(false),
            clock,
        };

        Ok(Self { core: Arc::new(core), workers: Mutex::new(None) })
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<ShipperCore> {
        &self.core
    }

    /// Unique id of this shipper instance, used in logs.
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// Tenant scope written into every record.
    pub fn scope(&self) -> &str {
        &self.core.scope
    }

    /// Configuration the shipper was built with.
    pub fn config(&self) -> &ShipperConfig {
        &self.core.config
    }

    /// Whether workers are running.
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Spawns the flush workers. A no-op, with a warning, when already
    /// running.
    ///
    /// # Errors
    ///
    /// Currently never fails; the signature leaves room for spawn
    /// validation.
    pub async fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            warn!(shipper_id = %self.core.id, "shipper already running, ignoring start");
            return Ok(());
        }

        let mut pool = WorkerPool::new(Arc::clone(&self.core), CancellationToken::new());
        pool.spawn_workers();
        *workers = Some(pool);
        drop(workers);

        self.core.running.store(true, Ordering::Release);
        info!(
            shipper_id = %self.core.id,
            scope = %self.core.scope,
            num_workers = self.core.config.num_workers,
            "shipper started"
        );
        Ok(())
    }

    /// Cancels the workers, waits for them within `shutdown_timeout`, then
    /// drains the queues with synchronous flush cycles.
    ///
    /// The terminal drain runs even when the shipper was never started or
    /// when worker shutdown fails. The shipper can be started again
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers did not exit in time, or
    /// `WorkerPanic` if one of them panicked. Queues are drained either way.
    pub async fn stop(&self) -> Result<()> {
        let pool = self.workers.lock().await.take();
        self.core.running.store(false, Ordering::Release);

        let shutdown = match pool {
            Some(pool) => pool.shutdown_graceful(self.core.config.shutdown_timeout).await,
            None => Ok(()),
        };

        let report = self.core.drain_all().await;
        let remaining: usize = self.core.queues.iter().map(BoundedQueue::len).sum();
        if remaining > 0 {
            warn!(
                shipper_id = %self.core.id,
                remaining,
                short_circuited = report.short_circuited,
                "records left in queues after terminal flush"
            );
        }

        info!(
            shipper_id = %self.core.id,
            records_written = report.records_written,
            records_lost = report.records_lost,
            total_lost = self.core.lost.total(),
            "shipper stopped"
        );
        shutdown
    }

    /// Runs one flush cycle now, with the same semantics as a
    /// worker-triggered cycle.
    pub async fn flush(&self) -> FlushReport {
        self.core.flush_cycle().await
    }

    /// Snapshot of queue depths, lost counts, breaker state and throughput.
    pub async fn queue_depths(&self) -> QueueDepths {
        self.core.snapshot().await
    }

    async fn submit<E: IntoLogRecord>(&self, event: E) -> Result<()> {
        let record = event.into_log_record(&self.core.scope, self.core.clock.now_utc());
        self.core.enqueue(record).await
    }

    /// Records that a pipeline run started.
    ///
    /// # Errors
    ///
    /// Returns `BackpressureTimeout` if the queue stayed full for
    /// `enqueue_timeout`.
    pub async fn record_pipeline_start(&self, event: PipelineStart) -> Result<()> {
        self.submit(event).await
    }

    /// Records that a pipeline run finished.
    ///
    /// # Errors
    ///
    /// Returns `BackpressureTimeout` if the queue stayed full for
    /// `enqueue_timeout`.
    pub async fn record_pipeline_end(&self, event: PipelineEnd) -> Result<()> {
        self.submit(event).await
    }

    /// Records that a step started.
    ///
    /// # Errors
    ///
    /// Returns `BackpressureTimeout` if the queue stayed full for
    /// `enqueue_timeout`.
    pub async fn record_step_start(&self, event: StepStart) -> Result<()> {
        self.submit(event).await
    }

    /// Records that a step finished.
    ///
    /// # Errors
    ///
    /// Returns `BackpressureTimeout` if the queue stayed full for
    /// `enqueue_timeout`.
    pub async fn record_step_end(&self, event: StepEnd) -> Result<()> {
        self.submit(event).await
    }

    /// Records a state transition. Best effort: on backpressure the record
    /// is dropped, logged and counted as lost.
    pub async fn record_state_transition(&self, event: StateTransition) {
        if let Err(e) = self.submit(event).await {
            error!(
                shipper_id = %self.core.id,
                category = %Category::StateTransition,
                error = %e,
                "best-effort record failed to enqueue"
            );
        }
    }

    /// Records any lifecycle event, applying its category's backpressure
    /// policy.
    ///
    /// # Errors
    ///
    /// Returns `BackpressureTimeout` for critical categories whose queue
    /// stayed full for `enqueue_timeout`.
    pub async fn record(&self, event: LifecycleEvent) -> Result<()> {
        let record = event.into_log_record(&self.core.scope, self.core.clock.now_utc());
        self.core.enqueue(record).await
    }
}
