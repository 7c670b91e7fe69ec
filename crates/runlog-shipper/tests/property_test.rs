//! Property-based tests for queue and retry invariants.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{sync::Arc, time::Duration};

use proptest::prelude::*;
use runlog_core::{Category, IdempotencyToken, LogRecord, Payload, TestClock};
use runlog_shipper::{
    queue::BoundedQueue,
    retry::{BackoffPolicy, BackoffStrategy, RetryContext, RetryDecision},
    SinkError,
};

fn record(index: usize) -> LogRecord {
    LogRecord {
        category: Category::StepStart,
        idempotency_token: IdempotencyToken::for_phase(&format!("step-{index}"), "start"),
        payload: Payload::new(),
        enqueued_at: None,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

proptest! {
    #[test]
    fn drains_return_every_record_once_in_order(
        capacity in 1usize..64,
        count in 0usize..128,
        batch_size in 1usize..32,
    ) {
        let drained = runtime().block_on(async {
            let queue = BoundedQueue::new(Category::StepStart, capacity, Arc::new(TestClock::new()));
            let mut accepted = Vec::new();
            for index in 0..count {
                if queue.enqueue(record(index), Duration::ZERO).await.is_ok() {
                    accepted.push(index);
                }
            }

            let mut drained = Vec::new();
            loop {
                let batch = queue.drain(batch_size).await;
                assert!(batch.len() <= batch_size);
                if batch.is_empty() {
                    break;
                }
                drained.extend(batch);
            }
            (accepted, drained)
        });

        let (accepted, drained) = drained;
        prop_assert_eq!(accepted.len(), count.min(capacity));
        let tokens: Vec<String> = drained.iter().map(|r| r.idempotency_token.to_string()).collect();
        let expected: Vec<String> = accepted.iter().map(|i| format!("step-{i}_start")).collect();
        prop_assert_eq!(tokens, expected);
    }

    #[test]
    fn retry_delays_never_exceed_max_delay(
        attempt in 1u32..40,
        base_ms in 1u64..5_000,
        max_ms in 5_000u64..120_000,
        jitter in 0.0f64..=1.0,
    ) {
        let policy = BackoffPolicy {
            max_attempts: 50,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter_factor: jitter,
            strategy: BackoffStrategy::Exponential,
        };
        let error = SinkError::server_error(503, "busy");

        match RetryContext::new(attempt, &error, &policy).decide_retry() {
            RetryDecision::Retry { delay } => prop_assert!(delay <= policy.max_delay),
            RetryDecision::GiveUp { reason } => prop_assert!(false, "unexpected give up: {}", reason),
        }
    }

    #[test]
    fn attempts_are_bounded_by_policy(max_attempts in 1u32..20, attempt in 1u32..40) {
        let policy = BackoffPolicy { max_attempts, jitter_factor: 0.0, ..BackoffPolicy::default() };
        let error = SinkError::network("reset");

        let decision = RetryContext::new(attempt, &error, &policy).decide_retry();

        prop_assert_eq!(matches!(decision, RetryDecision::GiveUp { .. }), attempt >= max_attempts);
    }
}
