//! Bounded per-category record queues.
//!
//! Producers enqueue with a timeout and get a distinguishable
//! [`EnqueueError::Full`] when the queue stays full. Workers drain without
//! waiting. The receiving half sits behind a mutex, so concurrent drains are
//! serialized and never hand out the same record twice.

use std::{sync::Arc, time::Duration};

use runlog_core::{Category, Clock, LogRecord};
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::SendTimeoutError, error::TrySendError},
    Mutex,
};

/// Why a record could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The queue stayed full for the whole enqueue timeout.
    #[error("queue full")]
    Full,
    /// The receiving side is gone.
    #[error("queue closed")]
    Closed,
}

/// FIFO queue of [`LogRecord`]s with a fixed capacity.
#[derive(Debug)]
pub struct BoundedQueue {
    category: Category,
    sender: mpsc::Sender<LogRecord>,
    receiver: Mutex<mpsc::Receiver<LogRecord>>,
    clock: Arc<dyn Clock>,
}

impl BoundedQueue {
    /// Creates a queue holding at most `capacity` records (minimum 1).
    pub fn new(category: Category, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self { category, sender, receiver: Mutex::new(receiver), clock }
    }

    /// Category this queue buffers.
    pub fn category(&self) -> Category {
        self.category
    }

    /// Queues `record`, waiting at most `timeout` for space.
    ///
    /// A zero timeout never waits. Sets `enqueued_at` on the record.
    pub async fn enqueue(&self, mut record: LogRecord, timeout: Duration) -> Result<(), EnqueueError> {
        record.enqueued_at = Some(self.clock.now_utc());

        if timeout.is_zero() {
            return self.sender.try_send(record).map_err(|error| match error {
                TrySendError::Full(_) => EnqueueError::Full,
                TrySendError::Closed(_) => EnqueueError::Closed,
            });
        }

        self.sender.send_timeout(record, timeout).await.map_err(|error| match error {
            SendTimeoutError::Timeout(_) => EnqueueError::Full,
            SendTimeoutError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Removes and returns up to `max` records in FIFO order without waiting
    /// for more to arrive.
    pub async fn drain(&self, max: usize) -> Vec<LogRecord> {
        let mut receiver = self.receiver.lock().await;
        let mut batch = Vec::with_capacity(max.min(receiver.len()));
        while batch.len() < max {
            match receiver.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }
        batch
    }

    /// Records currently buffered.
    pub fn len(&self) -> usize {
        self.sender.max_capacity().saturating_sub(self.sender.capacity())
    }

    /// Whether the queue holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered records.
    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    /// Fill level as a percentage of capacity.
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization_pct(&self) -> f64 {
        self.len() as f64 * 100.0 / self.capacity() as f64
    }
}

#[cfg(test)]
mod tests {
    use runlog_core::{IdempotencyToken, Payload, TestClock};

    use super::*;

    fn queue(capacity: usize) -> BoundedQueue {
        BoundedQueue::new(Category::StepEnd, capacity, Arc::new(TestClock::new()))
    }

    fn record(id: &str) -> LogRecord {
        LogRecord {
            category: Category::StepEnd,
            idempotency_token: IdempotencyToken::for_phase(id, "end"),
            payload: Payload::new(),
            enqueued_at: None,
        }
    }

    #[tokio::test]
    async fn zero_timeout_rejects_when_full() {
        let queue = queue(2);

        assert!(queue.enqueue(record("a"), Duration::ZERO).await.is_ok());
        assert!(queue.enqueue(record("b"), Duration::ZERO).await.is_ok());
        assert_eq!(queue.enqueue(record("c"), Duration::ZERO).await, Err(EnqueueError::Full));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn timed_enqueue_succeeds_once_space_frees() {
        let queue = Arc::new(queue(1));
        queue.enqueue(record("a"), Duration::ZERO).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(record("b"), Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        let drained = queue.drain(1).await;

        assert_eq!(drained.len(), 1);
        assert!(producer.await.unwrap().is_ok());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn timed_enqueue_times_out_when_nothing_drains() {
        let queue = queue(1);
        queue.enqueue(record("a"), Duration::ZERO).await.unwrap();

        let result = queue.enqueue(record("b"), Duration::from_millis(20)).await;

        assert_eq!(result, Err(EnqueueError::Full));
    }

    #[tokio::test]
    async fn drain_is_fifo_and_bounded() {
        let queue = queue(10);
        for id in ["a", "b", "c", "d"] {
            queue.enqueue(record(id), Duration::ZERO).await.unwrap();
        }

        let first = queue.drain(3).await;
        let rest = queue.drain(3).await;

        let tokens: Vec<&str> = first.iter().map(|r| r.idempotency_token.as_str()).collect();
        assert_eq!(tokens, vec!["a_end", "b_end", "c_end"]);
        assert_eq!(rest.len(), 1);
        assert!(queue.drain(3).await.is_empty());
    }

    #[tokio::test]
    async fn enqueue_stamps_enqueued_at_and_tracks_utilization() {
        let queue = queue(4);
        queue.enqueue(record("a"), Duration::ZERO).await.unwrap();

        assert!((queue.utilization_pct() - 25.0).abs() < f64::EPSILON);
        let drained = queue.drain(1).await;
        assert!(drained[0].enqueued_at.is_some());
        assert!(queue.is_empty());
    }
}
