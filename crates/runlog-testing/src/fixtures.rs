//! Lifecycle event fixtures with sensible defaults.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use runlog_core::{
    Attributes, EntityType, LifecycleEvent, PipelineEnd, PipelineStart, RunStatus,
    StateTransition, StepEnd, StepStart,
};
use serde_json::json;
use uuid::Uuid;

/// Fresh unique run id.
pub fn run_id() -> String {
    format!("run-{}", Uuid::new_v4().simple())
}

/// Fresh unique step id.
pub fn step_id() -> String {
    format!("step-{}", Uuid::new_v4().simple())
}

/// Parameters map resembling a billing sync run.
pub fn sample_parameters() -> Attributes {
    let mut parameters = Attributes::new();
    parameters.insert("provider".into(), json!("openai"));
    parameters.insert("window_start".into(), json!("2024-03-01T00:00:00+00:00"));
    parameters.insert("dry_run".into(), json!(false));
    parameters
}

/// A `PipelineStart` for `run_id`.
pub fn pipeline_start(run_id: &str) -> PipelineStart {
    PipelineStart {
        run_id: run_id.to_string(),
        pipeline_id: "billing_sync".to_string(),
        trigger_type: "scheduler".to_string(),
        trigger_by: "cron".to_string(),
        parameters: None,
    }
}

/// A `PipelineEnd` for `run_id` that started `started_at`.
pub fn pipeline_end(run_id: &str, status: RunStatus, started_at: DateTime<Utc>) -> PipelineEnd {
    PipelineEnd {
        run_id: run_id.to_string(),
        pipeline_id: "billing_sync".to_string(),
        status,
        started_at,
        trigger_type: "scheduler".to_string(),
        trigger_by: "cron".to_string(),
        error_message: (status == RunStatus::Failed).then(|| "provider returned 503".to_string()),
        parameters: None,
    }
}

/// A `StepStart` for `step_id` in `run_id`.
pub fn step_start(step_id: &str, run_id: &str, step_index: u32) -> StepStart {
    StepStart {
        step_id: step_id.to_string(),
        run_id: run_id.to_string(),
        step_name: format!("step_{step_index}"),
        step_type: "bq_query".to_string(),
        step_index,
        metadata: None,
    }
}

/// A `StepEnd` for `step_id` in `run_id`.
pub fn step_end(
    step_id: &str,
    run_id: &str,
    step_index: u32,
    status: RunStatus,
    started_at: DateTime<Utc>,
) -> StepEnd {
    StepEnd {
        step_id: step_id.to_string(),
        run_id: run_id.to_string(),
        step_name: format!("step_{step_index}"),
        step_type: "bq_query".to_string(),
        step_index,
        status,
        started_at,
        rows_processed: Some(1_000),
        error_message: None,
        metadata: None,
    }
}

/// A pipeline-level `StateTransition` for `run_id`.
pub fn state_transition(run_id: &str, from_state: &str, to_state: &str) -> StateTransition {
    StateTransition {
        run_id: run_id.to_string(),
        from_state: from_state.to_string(),
        to_state: to_state.to_string(),
        entity_type: EntityType::Pipeline,
        entity_id: None,
        reason: None,
        metadata: None,
        occurred_at: None,
    }
}

/// Builds the full event sequence of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunFixture {
    run_id: String,
    steps: u32,
    status: RunStatus,
    started_at: DateTime<Utc>,
}

impl RunFixture {
    /// A successful run with one step, started now.
    pub fn new() -> Self {
        Self { run_id: run_id(), steps: 1, status: RunStatus::Completed, started_at: Utc::now() }
    }

    /// Uses `run_id` instead of a generated one.
    #[must_use]
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Number of steps in the run.
    #[must_use]
    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    /// Final status of the run and its last step.
    #[must_use]
    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }

    /// Events in the order a pipeline engine would report them.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        let run_id = self.run_id.as_str();
        let mut events = vec![
            LifecycleEvent::StateTransition(state_transition(run_id, "PENDING", "RUNNING")),
            LifecycleEvent::PipelineStart(pipeline_start(run_id)),
        ];

        for index in 0..self.steps {
            let step_id = format!("{run_id}-step-{index}");
            let step_started = self.started_at + ChronoDuration::seconds(i64::from(index));
            let status = if index + 1 == self.steps { self.status } else { RunStatus::Completed };
            events.push(LifecycleEvent::StepStart(step_start(&step_id, run_id, index)));
            events.push(LifecycleEvent::StepEnd(step_end(&step_id, run_id, index, status, step_started)));
        }

        events.push(LifecycleEvent::PipelineEnd(pipeline_end(run_id, self.status, self.started_at)));
        events.push(LifecycleEvent::StateTransition(state_transition(
            run_id,
            "RUNNING",
            self.status.as_str(),
        )));
        events
    }
}

impl Default for RunFixture {
    fn default() -> Self {
        Self::new()
    }
}
