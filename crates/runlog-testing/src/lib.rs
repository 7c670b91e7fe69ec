//! Test harness and fixtures for the runlog shipper.
//!
//! [`ShipperHarness`] wires a [`Shipper`] to an in-memory sink and a
//! deterministic clock, so tests can inject sink failures, advance time and
//! run flush cycles by hand.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use runlog_core::{Category, Clock, RealClock};
pub use runlog_core::TestClock;
use runlog_shipper::{
    circuit::CircuitConfig, memory::MemorySink, retry::BackoffConfig, FlushReport, Shipper,
    ShipperConfig, SinkError,
};

pub mod fixtures;

pub use fixtures::RunFixture;

/// Configuration tuned for deterministic tests: no enqueue waiting, one
/// write attempt, no jitter, one worker with a long interval.
pub fn test_config() -> ShipperConfig {
    ShipperConfig {
        batch_size: 100,
        flush_interval: Duration::from_secs(3600),
        max_retries: 1,
        num_workers: 1,
        queue_capacity: 100,
        enqueue_timeout: Duration::ZERO,
        flush_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(10),
        backoff: BackoffConfig { jitter_factor: 0.0, ..BackoffConfig::default() },
        circuit: CircuitConfig { failure_threshold: 5, cooldown: Duration::from_secs(60) },
        ..ShipperConfig::default()
    }
}

/// Shipper wired to a [`MemorySink`] and a [`TestClock`].
pub struct ShipperHarness {
    /// Shipper under test.
    pub shipper: Shipper,
    /// Sink the shipper writes to.
    pub sink: MemorySink,
    /// Clock the shipper reads, unless built with a real clock.
    pub clock: TestClock,
}

impl ShipperHarness {
    /// Harness with [`test_config`].
    ///
    /// # Errors
    ///
    /// Returns an error if the shipper rejects the configuration.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Starts a harness builder.
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder { scope: "test-org".to_string(), config: test_config(), real_clock: false }
    }

    /// Runs one flush cycle now.
    pub async fn run_flush_cycle(&self) -> FlushReport {
        self.shipper.flush().await
    }

    /// Advances the shipper's clock.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Fails the next `count` sink writes with a 503.
    pub async fn fail_next_writes(&self, count: usize) {
        self.sink.fail_next(count, SinkError::server_error(503, "service unavailable")).await;
    }

    /// Lost records for `category`.
    pub async fn lost(&self, category: Category) -> u64 {
        self.shipper.queue_depths().await.lost(category)
    }

    /// Records buffered across all queues.
    pub async fn buffered(&self) -> usize {
        self.shipper.queue_depths().await.total_buffered()
    }
}

/// Builder for [`ShipperHarness`].
pub struct HarnessBuilder {
    scope: String,
    config: ShipperConfig,
    real_clock: bool,
}

impl HarnessBuilder {
    /// Tenant scope written into records.
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ShipperConfig) -> Self {
        self.config = config;
        self
    }

    /// Records per flush per category.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Capacity of each queue.
    #[must_use]
    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.config.queue_capacity = queue_capacity;
        self
    }

    /// How long producers wait for queue space.
    #[must_use]
    pub fn enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.config.enqueue_timeout = timeout;
        self
    }

    /// Write attempts per batch.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// Breaker threshold and cooldown.
    #[must_use]
    pub fn circuit(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.config.circuit = CircuitConfig { failure_threshold, cooldown };
        self
    }

    /// Worker count and interval.
    #[must_use]
    pub fn workers(mut self, num_workers: usize, flush_interval: Duration) -> Self {
        self.config.num_workers = num_workers;
        self.config.flush_interval = flush_interval;
        self
    }

    /// Flush guard and worker shutdown timeouts.
    #[must_use]
    pub fn timeouts(mut self, flush_timeout: Duration, shutdown_timeout: Duration) -> Self {
        self.config.flush_timeout = flush_timeout;
        self.config.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Drives the shipper from the real clock.
    ///
    /// Needed for tests that start workers: [`TestClock::sleep`] returns
    /// immediately, which would make workers flush back to back.
    #[must_use]
    pub fn real_clock(mut self) -> Self {
        self.real_clock = true;
        self
    }

    /// Builds the harness.
    ///
    /// # Errors
    ///
    /// Returns an error if the shipper rejects the configuration.
    pub fn build(self) -> Result<ShipperHarness> {
        let sink = MemorySink::new();
        let clock = TestClock::new();
        let shipper_clock: Arc<dyn Clock> =
            if self.real_clock { Arc::new(RealClock::new()) } else { Arc::new(clock.clone()) };

        let shipper = Shipper::with_clock(self.scope, self.config, Arc::new(sink.clone()), shipper_clock)
            .context("failed to build shipper for test harness")?;

        Ok(ShipperHarness { shipper, sink, clock })
    }
}
