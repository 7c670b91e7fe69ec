//! Batch writer: one drained batch, one logical sink write.
//!
//! The writer owns the retry loop. It knows nothing about queues or the
//! circuit breaker; the flush cycle decides what to do with the outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use runlog_core::{Category, Clock, IdempotencyToken, LogRecord, Payload};
use tracing::{debug, warn};

use crate::{
    retry::{BackoffPolicy, RetryContext, RetryDecision},
    sink::{Sink, SinkError},
};

/// Records drained from one category queue in one flush pass.
///
/// `rows[i]` and `tokens[i]` belong to the same record; drain order is
/// preserved.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    /// Category the records were drained from.
    pub category: Category,
    /// Sink target the batch is written to.
    pub target: String,
    /// Payloads in drain order.
    pub rows: Vec<Payload>,
    /// Idempotency tokens matching `rows`.
    pub tokens: Vec<IdempotencyToken>,
    /// Enqueue time of the oldest record in the batch.
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
}

impl FlushBatch {
    /// Splits drained records into parallel row and token lists.
    pub fn from_records(category: Category, target: impl Into<String>, records: Vec<LogRecord>) -> Self {
        let oldest_enqueued_at = records.iter().filter_map(|r| r.enqueued_at).min();
        let (tokens, rows) =
            records.into_iter().map(|record| (record.idempotency_token, record.payload)).unzip();
        Self { category, target: target.into(), rows, tokens, oldest_enqueued_at }
    }

    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Result of writing one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The sink accepted the batch.
    Written {
        /// Attempts used, including the successful one
        attempts: u32,
    },
    /// Every allowed attempt failed, or the error was not retryable.
    Failed {
        /// Attempts made
        attempts: u32,
        /// Error from the last attempt
        error: SinkError,
    },
}

impl WriteOutcome {
    /// Whether the batch was persisted.
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

/// Writes batches to a sink with bounded retry and backoff.
#[derive(Debug, Clone)]
pub struct BatchWriter {
    sink: Arc<dyn Sink>,
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl BatchWriter {
    /// Creates a writer over `sink`.
    pub fn new(sink: Arc<dyn Sink>, policy: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { sink, policy, clock }
    }

    /// Writes `batch`, retrying transient failures up to the policy's
    /// attempt limit.
    pub async fn write(&self, batch: &FlushBatch) -> WriteOutcome {
        self.write_with_limit(batch, self.policy.max_attempts).await
    }

    /// Writes `batch` with a single attempt. Used for circuit probes.
    pub async fn write_once(&self, batch: &FlushBatch) -> WriteOutcome {
        self.write_with_limit(batch, 1).await
    }

    async fn write_with_limit(&self, batch: &FlushBatch, max_attempts: u32) -> WriteOutcome {
        let policy = BackoffPolicy { max_attempts: max_attempts.max(1), ..self.policy.clone() };
        let mut attempt = 0_u32;

        loop {
            attempt += 1;

            let error = match self.sink.write_batch(&batch.target, &batch.rows, &batch.tokens).await
            {
                Ok(()) => {
                    debug!(
                        category = %batch.category,
                        target = %batch.target,
                        batch_size = batch.len(),
                        attempt,
                        "batch written"
                    );
                    return WriteOutcome::Written { attempts: attempt };
                },
                Err(error) => error,
            };

            match RetryContext::new(attempt, &error, &policy).decide_retry() {
                RetryDecision::Retry { delay } => {
                    warn!(
                        category = %batch.category,
                        target = %batch.target,
                        batch_size = batch.len(),
                        attempt,
                        error_kind = error.kind(),
                        error = %error,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "batch write failed, retrying"
                    );
                    self.clock.sleep(delay).await;
                },
                RetryDecision::GiveUp { reason } => {
                    debug!(
                        category = %batch.category,
                        target = %batch.target,
                        attempt,
                        reason = %reason,
                        "giving up on batch"
                    );
                    return WriteOutcome::Failed { attempts: attempt, error };
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use runlog_core::{PayloadBuilder, TestClock};

    use super::*;
    use crate::sink::memory::MemorySink;

    fn record(id: &str) -> LogRecord {
        LogRecord {
            category: Category::PipelineEnd,
            idempotency_token: IdempotencyToken::for_phase(id, "end"),
            payload: PayloadBuilder::new().text("pipeline_logging_id", id).build(),
            enqueued_at: None,
        }
    }

    fn writer(sink: &MemorySink, clock: &TestClock, max_attempts: u32) -> BatchWriter {
        let policy = BackoffPolicy { max_attempts, jitter_factor: 0.0, ..BackoffPolicy::default() };
        BatchWriter::new(Arc::new(sink.clone()), policy, Arc::new(clock.clone()))
    }

    fn batch(ids: &[&str]) -> FlushBatch {
        FlushBatch::from_records(
            Category::PipelineEnd,
            "pipeline_runs",
            ids.iter().map(|id| record(id)).collect(),
        )
    }

    #[test]
    fn batch_keeps_rows_and_tokens_aligned() {
        let batch = batch(&["a", "b"]);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.tokens[1].as_str(), "b_end");
        assert_eq!(batch.rows[1]["pipeline_logging_id"], "b");
    }

    #[tokio::test]
    async fn transient_failure_is_retried_with_backoff() {
        let sink = MemorySink::new();
        let clock = TestClock::new();
        sink.fail_next(2, SinkError::server_error(503, "busy")).await;

        let outcome = writer(&sink, &clock, 3).write(&batch(&["a"])).await;

        assert_eq!(outcome, WriteOutcome::Written { attempts: 3 });
        assert_eq!(clock.elapsed(), Duration::from_secs(2 + 4));
        assert_eq!(sink.row_count().await, 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_report_last_error() {
        let sink = MemorySink::new();
        let clock = TestClock::new();
        sink.fail_always(SinkError::network("refused")).await;

        let outcome = writer(&sink, &clock, 2).write(&batch(&["a", "b"])).await;

        assert_eq!(outcome, WriteOutcome::Failed { attempts: 2, error: SinkError::network("refused") });
        assert_eq!(sink.call_count().await, 2);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let sink = MemorySink::new();
        let clock = TestClock::new();
        sink.fail_always(SinkError::client_error(400, "bad schema")).await;

        let outcome = writer(&sink, &clock, 5).write(&batch(&["a"])).await;

        assert!(matches!(outcome, WriteOutcome::Failed { attempts: 1, .. }));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn write_once_never_retries() {
        let sink = MemorySink::new();
        let clock = TestClock::new();
        sink.fail_next(1, SinkError::timeout(5)).await;

        let outcome = writer(&sink, &clock, 5).write_once(&batch(&["a"])).await;

        assert!(!outcome.is_written());
        assert_eq!(sink.call_count().await, 1);
    }
}
