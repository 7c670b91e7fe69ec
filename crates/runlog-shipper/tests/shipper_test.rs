//! Integration tests for shipper delivery guarantees.
//!
//! Covers idempotent delivery, backpressure policies, circuit breaking,
//! drain-on-stop, flush and shutdown timeouts, FIFO ordering and concurrent
//! flush disjointness.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{collections::HashSet, sync::Arc, time::Duration};

use runlog_core::{Category, RunStatus, StateTransition};
use runlog_shipper::{circuit::CircuitState, ShipperError, SinkError};
use runlog_testing::{
    fixtures::{pipeline_end, pipeline_start, state_transition, step_end},
    RunFixture, ShipperHarness,
};

#[tokio::test]
async fn duplicate_tokens_persist_once() {
    let harness = ShipperHarness::new().unwrap();

    for _ in 0..3 {
        harness.shipper.record_pipeline_start(pipeline_start("run-1")).await.unwrap();
    }
    harness.run_flush_cycle().await;
    harness.shipper.record_pipeline_start(pipeline_start("run-1")).await.unwrap();
    harness.run_flush_cycle().await;

    assert_eq!(harness.sink.tokens("pipeline_runs").await.len(), 1);
    assert_eq!(harness.sink.call_count().await, 2);
}

#[tokio::test]
async fn retried_batch_is_not_duplicated() {
    let harness = ShipperHarness::builder().max_retries(3).build().unwrap();
    harness.sink.fail_next(1, SinkError::rows_rejected(vec!["transient".into()])).await;

    harness.shipper.record_pipeline_start(pipeline_start("run-7")).await.unwrap();
    let report = harness.run_flush_cycle().await;

    assert_eq!(report.records_written, 1);
    assert_eq!(harness.sink.row_count().await, 1);
    assert_eq!(harness.sink.call_count().await, 2);
}

#[tokio::test]
async fn critical_enqueue_fails_when_queue_full() {
    let harness = ShipperHarness::builder().queue_capacity(2).enqueue_timeout(Duration::ZERO).build().unwrap();

    let first = harness.shipper.record_pipeline_start(pipeline_start("run-1")).await;
    let second = harness.shipper.record_pipeline_start(pipeline_start("run-2")).await;
    let third = harness.shipper.record_pipeline_start(pipeline_start("run-3")).await;

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert!(matches!(
        third,
        Err(ShipperError::BackpressureTimeout { category: Category::PipelineStart, timeout_ms: 0 })
    ));
    assert_eq!(harness.lost(Category::PipelineStart).await, 0);
}

#[tokio::test]
async fn best_effort_enqueue_drops_and_counts() {
    let harness = ShipperHarness::builder().queue_capacity(2).enqueue_timeout(Duration::ZERO).build().unwrap();

    for run in ["run-1", "run-2", "run-3"] {
        harness.shipper.record_state_transition(state_transition(run, "PENDING", "RUNNING")).await;
    }

    let depths = harness.shipper.queue_depths().await;
    assert_eq!(depths.lost(Category::StateTransition), 1);
    assert_eq!(depths.total_lost, 1);
    assert_eq!(depths.queue(Category::StateTransition).unwrap().size, 2);
}

#[tokio::test]
async fn backpressure_on_one_category_leaves_others_untouched() {
    let harness = ShipperHarness::builder().queue_capacity(1).build().unwrap();

    harness.shipper.record_pipeline_start(pipeline_start("run-1")).await.unwrap();
    let started = chrono::Utc::now();

    assert!(harness.shipper.record_pipeline_start(pipeline_start("run-2")).await.is_err());
    harness
        .shipper
        .record_pipeline_end(pipeline_end("run-1", RunStatus::Completed, started))
        .await
        .unwrap();
}

#[tokio::test]
async fn circuit_opens_after_threshold_and_probes_after_cooldown() {
    let cooldown = Duration::from_secs(60);
    let harness = ShipperHarness::builder().circuit(5, cooldown).max_retries(1).build().unwrap();
    harness.sink.fail_always(SinkError::server_error(503, "down")).await;

    for index in 0..5 {
        harness.shipper.record_pipeline_start(pipeline_start(&format!("run-{index}"))).await.unwrap();
        harness.run_flush_cycle().await;
    }
    assert_eq!(harness.sink.call_count().await, 5);
    assert_eq!(harness.shipper.queue_depths().await.circuit.state, CircuitState::Open);

    harness.shipper.record_pipeline_start(pipeline_start("run-5")).await.unwrap();
    let sixth = harness.run_flush_cycle().await;

    assert!(sixth.short_circuited);
    assert_eq!(harness.sink.call_count().await, 5);

    harness.advance_time(cooldown + Duration::from_secs(1));
    harness.sink.heal().await;
    harness.run_flush_cycle().await;

    assert_eq!(harness.sink.call_count().await, 6);
    assert_eq!(harness.shipper.queue_depths().await.circuit.state, CircuitState::Closed);
}

#[tokio::test]
async fn failed_probe_keeps_circuit_open() {
    let cooldown = Duration::from_secs(30);
    let harness = ShipperHarness::builder().circuit(1, cooldown).max_retries(3).build().unwrap();
    harness.sink.fail_always(SinkError::network("refused")).await;

    harness.shipper.record_step_end(step_end("s-1", "r-1", 0, RunStatus::Completed, chrono::Utc::now())).await.unwrap();
    harness.run_flush_cycle().await;
    let calls_after_open = harness.sink.call_count().await;

    harness.advance_time(cooldown);
    harness.shipper.record_step_end(step_end("s-2", "r-1", 1, RunStatus::Completed, chrono::Utc::now())).await.unwrap();
    harness.run_flush_cycle().await;

    assert_eq!(harness.sink.call_count().await, calls_after_open + 1);
    let depths = harness.shipper.queue_depths().await;
    assert_eq!(depths.circuit.state, CircuitState::Open);
    assert_eq!(depths.circuit.cooldown_remaining_ms, Some(30_000));
    assert_eq!(depths.lost(Category::StepEnd), 2);
}

async fn open_circuit_with_hung_sink(harness: &Arc<ShipperHarness>) -> tokio::task::JoinHandle<()> {
    harness.fail_next_writes(1).await;
    harness.shipper.record_pipeline_start(pipeline_start("run-1")).await.unwrap();
    harness.run_flush_cycle().await;
    assert_eq!(harness.shipper.queue_depths().await.circuit.state, CircuitState::Open);

    harness.sink.set_latency(Duration::from_secs(3600)).await;
    harness.advance_time(Duration::from_secs(60));
    harness.shipper.record_pipeline_start(pipeline_start("run-2")).await.unwrap();

    let hung = {
        let harness = Arc::clone(harness);
        tokio::spawn(async move {
            harness.run_flush_cycle().await;
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.buffered().await, 0);
    hung
}

#[tokio::test]
async fn aborted_half_open_flush_frees_the_breaker() {
    let harness = Arc::new(ShipperHarness::builder().circuit(1, Duration::from_secs(60)).build().unwrap());
    let hung = open_circuit_with_hung_sink(&harness).await;

    hung.abort();
    assert!(hung.await.unwrap_err().is_cancelled());

    harness.sink.set_latency(Duration::ZERO).await;
    harness.shipper.record_pipeline_start(pipeline_start("run-3")).await.unwrap();
    let report = harness.run_flush_cycle().await;

    assert!(!report.short_circuited);
    assert_eq!(report.records_written, 1);
    assert_eq!(harness.shipper.queue_depths().await.circuit.state, CircuitState::Closed);
    assert_eq!(harness.sink.tokens("pipeline_runs").await.len(), 1);
}

#[tokio::test]
async fn hung_half_open_write_is_superseded_after_cooldown() {
    let harness = Arc::new(ShipperHarness::builder().circuit(1, Duration::from_secs(60)).build().unwrap());
    let hung = open_circuit_with_hung_sink(&harness).await;

    harness.sink.set_latency(Duration::ZERO).await;
    harness.shipper.record_pipeline_start(pipeline_start("run-3")).await.unwrap();
    let blocked = harness.run_flush_cycle().await;
    assert!(blocked.short_circuited);
    assert_eq!(harness.buffered().await, 1);

    harness.advance_time(Duration::from_secs(60));
    let report = harness.run_flush_cycle().await;

    assert!(!report.short_circuited);
    assert_eq!(report.records_written, 1);
    assert_eq!(harness.shipper.queue_depths().await.circuit.state, CircuitState::Closed);

    hung.abort();
}

#[tokio::test]
async fn overlong_flush_is_abandoned_but_still_lands() {
    let harness = ShipperHarness::builder()
        .workers(1, Duration::from_millis(20))
        .timeouts(Duration::from_millis(50), Duration::from_secs(5))
        .real_clock()
        .build()
        .unwrap();
    harness.sink.set_latency(Duration::from_millis(300)).await;
    harness.shipper.start().await.unwrap();

    harness.shipper.record_pipeline_start(pipeline_start("run-1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(harness.shipper.queue_depths().await.stats.flushes_abandoned >= 1);
    assert_eq!(harness.sink.row_count().await, 0);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while harness.sink.row_count().await == 0 {
        assert!(tokio::time::Instant::now() < deadline, "abandoned flush never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    harness.shipper.stop().await.unwrap();

    assert_eq!(harness.sink.row_count().await, 1);
    assert_eq!(harness.sink.call_count().await, 1);
}

#[tokio::test]
async fn stop_waits_for_in_flight_flush() {
    let harness = ShipperHarness::builder()
        .workers(1, Duration::from_millis(20))
        .timeouts(Duration::from_secs(2), Duration::from_secs(3))
        .real_clock()
        .build()
        .unwrap();
    harness.sink.set_latency(Duration::from_millis(300)).await;
    harness.shipper.start().await.unwrap();

    harness.shipper.record_pipeline_start(pipeline_start("run-1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.buffered().await, 0);

    harness.shipper.stop().await.unwrap();

    assert_eq!(harness.sink.row_count().await, 1);
    assert_eq!(harness.sink.call_count().await, 1);
    assert_eq!(harness.shipper.queue_depths().await.stats.flushes_abandoned, 0);
}

#[tokio::test]
async fn repeated_transition_edges_both_persist() {
    let harness = ShipperHarness::new().unwrap();

    harness.shipper.record_state_transition(state_transition("run-1", "PENDING", "RUNNING")).await;
    harness.shipper.record_state_transition(state_transition("run-1", "RUNNING", "PENDING")).await;
    harness.advance_time(Duration::from_secs(1));
    harness.shipper.record_state_transition(state_transition("run-1", "PENDING", "RUNNING")).await;
    harness.run_flush_cycle().await;

    let tokens = harness.sink.tokens("state_transitions").await;
    let pending_to_running =
        tokens.iter().filter(|token| token.as_str().starts_with("run-1_PENDING_RUNNING_")).count();
    assert_eq!(tokens.len(), 3);
    assert_eq!(pending_to_running, 2);
}

#[tokio::test]
async fn replayed_transition_with_same_time_persists_once() {
    let harness = ShipperHarness::new().unwrap();
    let occurred_at = chrono::Utc::now();

    for _ in 0..2 {
        let event = StateTransition {
            occurred_at: Some(occurred_at),
            ..state_transition("run-1", "PENDING", "RUNNING")
        };
        harness.shipper.record_state_transition(event).await;
        harness.advance_time(Duration::from_secs(5));
    }
    harness.run_flush_cycle().await;

    assert_eq!(harness.sink.tokens("state_transitions").await.len(), 1);
}

#[tokio::test]
async fn stop_without_start_drains_queues() {
    let harness = ShipperHarness::new().unwrap();

    for run in ["run-1", "run-2", "run-3"] {
        harness.shipper.record_pipeline_start(pipeline_start(run)).await.unwrap();
    }
    harness.shipper.stop().await.unwrap();

    assert_eq!(harness.sink.rows("pipeline_runs").await.len(), 3);
    assert_eq!(harness.buffered().await, 0);
}

#[tokio::test]
async fn stop_drains_more_than_one_batch() {
    let harness = ShipperHarness::builder().batch_size(2).build().unwrap();

    for event in RunFixture::new().steps(3).events() {
        harness.shipper.record(event).await.unwrap();
    }
    harness.shipper.stop().await.unwrap();

    assert_eq!(harness.sink.row_count().await, 10);
}

#[tokio::test]
async fn stop_after_start_drains_with_running_workers() {
    let harness = ShipperHarness::builder()
        .workers(2, Duration::from_secs(3600))
        .real_clock()
        .build()
        .unwrap();
    harness.shipper.start().await.unwrap();

    for run in ["run-1", "run-2", "run-3"] {
        harness.shipper.record_pipeline_start(pipeline_start(run)).await.unwrap();
    }
    harness.shipper.stop().await.unwrap();

    assert!(!harness.shipper.is_running());
    assert_eq!(harness.sink.row_count().await, 3);
}

#[tokio::test]
async fn batch_preserves_fifo_order_within_category() {
    let harness = ShipperHarness::new().unwrap();

    harness.shipper.record_pipeline_start(pipeline_start("run-a")).await.unwrap();
    harness.shipper.record_pipeline_start(pipeline_start("run-b")).await.unwrap();
    harness.run_flush_cycle().await;

    let calls = harness.sink.calls().await;
    let tokens: Vec<&str> = calls[0].tokens.iter().map(|t| t.as_str()).collect();
    assert_eq!(tokens, vec!["run-a_start", "run-b_start"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_flushes_never_double_process() {
    let harness = Arc::new(ShipperHarness::builder().batch_size(10).build().unwrap());
    harness.sink.set_latency(Duration::from_millis(5)).await;

    let expected: HashSet<String> = (0..10).map(|i| format!("run-{i}_start")).collect();
    for i in 0..10 {
        harness.shipper.record_pipeline_start(pipeline_start(&format!("run-{i}"))).await.unwrap();
    }

    let first = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move { harness.run_flush_cycle().await })
    };
    let second = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move { harness.run_flush_cycle().await })
    };
    let reports = [first.await.unwrap(), second.await.unwrap()];

    let sent: Vec<String> = harness
        .sink
        .calls()
        .await
        .into_iter()
        .flat_map(|call| call.tokens)
        .map(|token| token.to_string())
        .collect();
    let unique: HashSet<String> = sent.iter().cloned().collect();

    assert_eq!(sent.len(), 10);
    assert_eq!(unique, expected);
    assert_eq!(reports.iter().map(|r| r.records_written).sum::<u64>(), 10);
}

#[tokio::test]
async fn snapshot_reports_utilization_and_totals() {
    let harness = ShipperHarness::builder().queue_capacity(4).build().unwrap();

    for run in ["run-1", "run-2", "run-3"] {
        harness.shipper.record_pipeline_start(pipeline_start(run)).await.unwrap();
    }

    let depths = harness.shipper.queue_depths().await;
    let queue = depths.queue(Category::PipelineStart).unwrap();

    assert_eq!(queue.size, 3);
    assert_eq!(queue.capacity, 4);
    assert!((queue.utilization_pct - 75.0).abs() < f64::EPSILON);
    assert_eq!(depths.queues.len(), Category::ALL.len());
    assert_eq!(depths.stats.records_enqueued, 3);
    assert!(!depths.running);

    let json = serde_json::to_value(&depths).unwrap();
    assert_eq!(json["queues"][0]["category"], "pipeline_start");
}
