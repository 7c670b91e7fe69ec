//! Lifecycle events and the log records they become.
//!
//! Producers describe what happened with one of the typed lifecycle events
//! ([`PipelineStart`], [`PipelineEnd`], [`StepStart`], [`StepEnd`],
//! [`StateTransition`]). Each event converts into a [`LogRecord`]: a
//! [`Category`] that selects a queue and sink target, a deterministic
//! [`IdempotencyToken`], and a normalized [`Payload`].
//!
//! # Idempotency tokens
//!
//! ```text
//! PipelineStart    {run_id}_start
//! PipelineEnd      {run_id}_end
//! StepStart        {step_id}_start
//! StepEnd          {step_id}_end
//! StateTransition  {entity_id}_{from_state}_{to_state}
//! ```
//!
//! Two records with the same token always describe the same logical event,
//! which lets the sink deduplicate repeated writes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::{duration_ms, Attributes, Payload, PayloadBuilder};

/// Kind of lifecycle record. Selects the queue and the sink target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// A pipeline run began.
    PipelineStart,
    /// A pipeline run finished.
    PipelineEnd,
    /// A step within a run began.
    StepStart,
    /// A step within a run finished.
    StepEnd,
    /// A run or step moved between states.
    StateTransition,
}

impl Category {
    /// Every category, in flush order.
    pub const ALL: [Self; 5] =
        [Self::PipelineStart, Self::PipelineEnd, Self::StepStart, Self::StepEnd, Self::StateTransition];

    /// Position of this category in [`Category::ALL`].
    pub const fn index(self) -> usize {
        match self {
            Self::PipelineStart => 0,
            Self::PipelineEnd => 1,
            Self::StepStart => 2,
            Self::StepEnd => 3,
            Self::StateTransition => 4,
        }
    }

    /// Whether losing a record of this category under backpressure must be
    /// reported to the producer.
    ///
    /// Run and step outcomes are the authoritative audit trail; state
    /// transitions are high-volume diagnostic detail.
    pub const fn is_critical(self) -> bool {
        !matches!(self, Self::StateTransition)
    }

    /// Stable lowercase name used in logs and snapshots.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PipelineStart => "pipeline_start",
            Self::PipelineEnd => "pipeline_end",
            Self::StepStart => "step_start",
            Self::StepEnd => "step_end",
            Self::StateTransition => "state_transition",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic identifier of a logical event, used by the sink to
/// deduplicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    /// Token for `entity_id` at lifecycle `phase`, e.g. `"run-42_end"`.
    pub fn for_phase(entity_id: &str, phase: &str) -> Self {
        Self(format!("{entity_id}_{phase}"))
    }

    /// Token for a state change of `entity_id` that happened at
    /// `transition_time`, e.g. `"run-42_PENDING_RUNNING_1717228800000000"`.
    ///
    /// The microsecond timestamp keeps repeated edges of one entity (a step
    /// retried through `PENDING -> RUNNING` twice) distinct.
    pub fn for_transition(
        entity_id: &str,
        from_state: &str,
        to_state: &str,
        transition_time: DateTime<Utc>,
    ) -> Self {
        Self(format!(
            "{entity_id}_{from_state}_{to_state}_{}",
            transition_time.timestamp_micros()
        ))
    }

    /// The token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome status of a run or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Queued but not started.
    Pending,
    /// In progress.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped by a user or the scheduler.
    Cancelled,
    /// Not executed.
    Skipped,
    /// Exceeded its time budget.
    Timeout,
}

impl RunStatus {
    /// Column value written to the sink.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Skipped => "SKIPPED",
            Self::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a state transition applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    /// A whole pipeline run.
    Pipeline,
    /// A single step of a run.
    Step,
}

impl EntityType {
    /// Column value written to the sink.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pipeline => "PIPELINE",
            Self::Step => "STEP",
        }
    }
}

/// A normalized record ready to be queued and shipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    /// Queue and target selector.
    pub category: Category,
    /// Sink deduplication key.
    pub idempotency_token: IdempotencyToken,
    /// Normalized field values.
    pub payload: Payload,
    /// When the record entered its queue. `None` until enqueued.
    pub enqueued_at: Option<DateTime<Utc>>,
}

/// Conversion from a typed lifecycle event into a [`LogRecord`].
pub trait IntoLogRecord {
    /// Category every record built from this event belongs to.
    const CATEGORY: Category;

    /// Deterministic token for this event. `now` is the time the event is
    /// being recorded, used only by events that carry no identifying time
    /// of their own.
    fn idempotency_token(&self, now: DateTime<Utc>) -> IdempotencyToken;

    /// Normalized payload. `scope` is the tenant the shipper writes for and
    /// `now` is the time the event is being recorded.
    fn into_payload(self, scope: &str, now: DateTime<Utc>) -> Payload;

    /// Builds the full record.
    fn into_log_record(self, scope: &str, now: DateTime<Utc>) -> LogRecord
    where
        Self: Sized,
    {
        let idempotency_token = self.idempotency_token(now);
        LogRecord {
            category: Self::CATEGORY,
            idempotency_token,
            payload: self.into_payload(scope, now),
            enqueued_at: None,
        }
    }
}

/// A pipeline run began.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStart {
    /// Unique id of this run.
    pub run_id: String,
    /// Pipeline definition being run.
    pub pipeline_id: String,
    /// What started the run (`api`, `scheduler`, `manual`, ...).
    pub trigger_type: String,
    /// Who or what triggered it.
    pub trigger_by: String,
    /// Run parameters.
    #[serde(default)]
    pub parameters: Option<Attributes>,
}

impl IntoLogRecord for PipelineStart {
    const CATEGORY: Category = Category::PipelineStart;

    fn idempotency_token(&self, _now: DateTime<Utc>) -> IdempotencyToken {
        IdempotencyToken::for_phase(&self.run_id, "start")
    }

    fn into_payload(self, scope: &str, now: DateTime<Utc>) -> Payload {
        PayloadBuilder::new()
            .text("pipeline_logging_id", self.run_id)
            .text("org_slug", scope)
            .text("pipeline_id", self.pipeline_id)
            .text("status", RunStatus::Running.as_str())
            .text("trigger_type", self.trigger_type)
            .text("trigger_by", self.trigger_by)
            .timestamp("start_time", now)
            .attributes("parameters", self.parameters)
            .build()
    }
}

/// A pipeline run finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEnd {
    /// Unique id of this run.
    pub run_id: String,
    /// Pipeline definition that ran.
    pub pipeline_id: String,
    /// Final status.
    pub status: RunStatus,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// What started the run.
    pub trigger_type: String,
    /// Who or what triggered it.
    pub trigger_by: String,
    /// Failure description, if any.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Run parameters.
    #[serde(default)]
    pub parameters: Option<Attributes>,
}

impl IntoLogRecord for PipelineEnd {
    const CATEGORY: Category = Category::PipelineEnd;

    fn idempotency_token(&self, _now: DateTime<Utc>) -> IdempotencyToken {
        IdempotencyToken::for_phase(&self.run_id, "end")
    }

    fn into_payload(self, scope: &str, now: DateTime<Utc>) -> Payload {
        PayloadBuilder::new()
            .text("pipeline_logging_id", self.run_id)
            .text("org_slug", scope)
            .text("pipeline_id", self.pipeline_id)
            .text("status", self.status.as_str())
            .text("trigger_type", self.trigger_type)
            .text("trigger_by", self.trigger_by)
            .timestamp("start_time", self.started_at)
            .timestamp("end_time", now)
            .integer("duration_ms", duration_ms(self.started_at, now))
            .optional_text("error_message", self.error_message)
            .attributes("parameters", self.parameters)
            .build()
    }
}

/// A step within a run began.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStart {
    /// Unique id of this step execution.
    pub step_id: String,
    /// Run the step belongs to.
    pub run_id: String,
    /// Human-readable step name.
    pub step_name: String,
    /// Step implementation kind.
    pub step_type: String,
    /// Zero-based position of the step in the pipeline.
    pub step_index: u32,
    /// Step metadata.
    #[serde(default)]
    pub metadata: Option<Attributes>,
}

impl IntoLogRecord for StepStart {
    const CATEGORY: Category = Category::StepStart;

    fn idempotency_token(&self, _now: DateTime<Utc>) -> IdempotencyToken {
        IdempotencyToken::for_phase(&self.step_id, "start")
    }

    fn into_payload(self, scope: &str, now: DateTime<Utc>) -> Payload {
        PayloadBuilder::new()
            .text("step_logging_id", self.step_id)
            .text("pipeline_logging_id", self.run_id)
            .text("org_slug", scope)
            .text("step_name", self.step_name)
            .text("step_type", self.step_type)
            .integer("step_index", self.step_index)
            .text("status", RunStatus::Running.as_str())
            .timestamp("start_time", now)
            .attributes("metadata", self.metadata)
            .build()
    }
}

/// A step within a run finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEnd {
    /// Unique id of this step execution.
    pub step_id: String,
    /// Run the step belongs to.
    pub run_id: String,
    /// Human-readable step name.
    pub step_name: String,
    /// Step implementation kind.
    pub step_type: String,
    /// Zero-based position of the step in the pipeline.
    pub step_index: u32,
    /// Final status.
    pub status: RunStatus,
    /// When the step began.
    pub started_at: DateTime<Utc>,
    /// Rows the step read or wrote, when it tracks them.
    #[serde(default)]
    pub rows_processed: Option<u64>,
    /// Failure description, if any.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Step metadata.
    #[serde(default)]
    pub metadata: Option<Attributes>,
}

impl IntoLogRecord for StepEnd {
    const CATEGORY: Category = Category::StepEnd;

    fn idempotency_token(&self, _now: DateTime<Utc>) -> IdempotencyToken {
        IdempotencyToken::for_phase(&self.step_id, "end")
    }

    fn into_payload(self, scope: &str, now: DateTime<Utc>) -> Payload {
        PayloadBuilder::new()
            .text("step_logging_id", self.step_id)
            .text("pipeline_logging_id", self.run_id)
            .text("org_slug", scope)
            .text("step_name", self.step_name)
            .text("step_type", self.step_type)
            .integer("step_index", self.step_index)
            .text("status", self.status.as_str())
            .timestamp("start_time", self.started_at)
            .timestamp("end_time", now)
            .integer("duration_ms", duration_ms(self.started_at, now))
            .optional_count("rows_processed", self.rows_processed)
            .optional_text("error_message", self.error_message)
            .attributes("metadata", self.metadata)
            .build()
    }
}

/// A run or step moved from one state to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Run the entity belongs to.
    pub run_id: String,
    /// State before the transition.
    pub from_state: String,
    /// State after the transition.
    pub to_state: String,
    /// Whether this is a run or a step transition.
    pub entity_type: EntityType,
    /// Step id for step transitions. Defaults to the run id.
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Why the transition happened.
    #[serde(default)]
    pub reason: Option<String>,
    /// Extra context.
    #[serde(default)]
    pub metadata: Option<Attributes>,
    /// When the transition happened. Defaults to the time it is recorded.
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl StateTransition {
    fn entity_key(&self) -> &str {
        self.entity_id.as_deref().unwrap_or(&self.run_id)
    }

    fn transition_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.occurred_at.unwrap_or(now)
    }
}

impl IntoLogRecord for StateTransition {
    const CATEGORY: Category = Category::StateTransition;

    fn idempotency_token(&self, now: DateTime<Utc>) -> IdempotencyToken {
        IdempotencyToken::for_transition(
            self.entity_key(),
            &self.from_state,
            &self.to_state,
            self.transition_time(now),
        )
    }

    fn into_payload(self, scope: &str, now: DateTime<Utc>) -> Payload {
        let entity_id = self.entity_key().to_string();
        let transition_time = self.transition_time(now);
        PayloadBuilder::new()
            .text("pipeline_logging_id", self.run_id)
            .text("org_slug", scope)
            .text("entity_type", self.entity_type.as_str())
            .text("entity_id", entity_id)
            .text("from_state", self.from_state)
            .text("to_state", self.to_state)
            .timestamp("transition_time", transition_time)
            .optional_text("reason", self.reason)
            .attributes("metadata", self.metadata)
            .build()
    }
}

/// Any lifecycle event, tagged by `kind` when serialized.
///
/// ```json
/// {"kind": "pipeline_start", "run_id": "r-1", "pipeline_id": "billing_sync",
///  "trigger_type": "scheduler", "trigger_by": "cron"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// See [`PipelineStart`].
    PipelineStart(PipelineStart),
    /// See [`PipelineEnd`].
    PipelineEnd(PipelineEnd),
    /// See [`StepStart`].
    StepStart(StepStart),
    /// See [`StepEnd`].
    StepEnd(StepEnd),
    /// See [`StateTransition`].
    StateTransition(StateTransition),
}

impl LifecycleEvent {
    /// Category of the wrapped event.
    pub const fn category(&self) -> Category {
        match self {
            Self::PipelineStart(_) => Category::PipelineStart,
            Self::PipelineEnd(_) => Category::PipelineEnd,
            Self::StepStart(_) => Category::StepStart,
            Self::StepEnd(_) => Category::StepEnd,
            Self::StateTransition(_) => Category::StateTransition,
        }
    }

    /// Builds the record for the wrapped event.
    pub fn into_log_record(self, scope: &str, now: DateTime<Utc>) -> LogRecord {
        match self {
            Self::PipelineStart(event) => event.into_log_record(scope, now),
            Self::PipelineEnd(event) => event.into_log_record(scope, now),
            Self::StepStart(event) => event.into_log_record(scope, now),
            Self::StepEnd(event) => event.into_log_record(scope, now),
            Self::StateTransition(event) => event.into_log_record(scope, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, secs).unwrap()
    }

    #[test]
    fn category_index_matches_flush_order() {
        for (position, category) in Category::ALL.iter().enumerate() {
            assert_eq!(category.index(), position);
        }
    }

    #[test]
    fn only_state_transitions_are_best_effort() {
        let best_effort: Vec<Category> =
            Category::ALL.into_iter().filter(|c| !c.is_critical()).collect();
        assert_eq!(best_effort, vec![Category::StateTransition]);
    }

    #[test]
    fn pipeline_end_payload_carries_duration_and_status() {
        let event = PipelineEnd {
            run_id: "run-7".into(),
            pipeline_id: "gcp_billing".into(),
            status: RunStatus::Failed,
            started_at: at(0),
            trigger_type: "scheduler".into(),
            trigger_by: "cron".into(),
            error_message: Some("quota exceeded".into()),
            parameters: None,
        };

        let record = event.into_log_record("acme", at(12));

        assert_eq!(record.category, Category::PipelineEnd);
        assert_eq!(record.idempotency_token.as_str(), "run-7_end");
        assert_eq!(record.payload["status"], json!("FAILED"));
        assert_eq!(record.payload["duration_ms"], json!(12_000));
        assert_eq!(record.payload["end_time"], json!("2024-06-01T08:00:12.000000Z"));
        assert_eq!(record.payload["org_slug"], json!("acme"));
        assert!(record.enqueued_at.is_none());
    }

    #[test]
    fn step_transition_token_uses_step_id() {
        let event = StateTransition {
            run_id: "run-1".into(),
            from_state: "RUNNING".into(),
            to_state: "COMPLETED".into(),
            entity_type: EntityType::Step,
            entity_id: Some("step-3".into()),
            reason: None,
            metadata: None,
            occurred_at: Some(at(5)),
        };

        assert_eq!(event.idempotency_token(at(9)).as_str(), "step-3_RUNNING_COMPLETED_1717228805000000");
    }

    #[test]
    fn repeated_transition_edges_get_distinct_tokens() {
        let transition = |occurred_at| StateTransition {
            run_id: "run-1".into(),
            from_state: "RUNNING".into(),
            to_state: "PAUSED".into(),
            entity_type: EntityType::Pipeline,
            entity_id: None,
            reason: None,
            metadata: None,
            occurred_at,
        };

        let first = transition(Some(at(1))).into_log_record("acme", at(30));
        let second = transition(Some(at(20))).into_log_record("acme", at(30));
        let resent = transition(Some(at(1))).into_log_record("acme", at(45));

        assert_ne!(first.idempotency_token, second.idempotency_token);
        assert_eq!(first.idempotency_token, resent.idempotency_token);
        assert_eq!(first.payload["transition_time"], json!("2024-06-01T08:00:01.000000Z"));
    }

    #[test]
    fn lifecycle_event_deserializes_from_tagged_json() {
        let line = r#"{"kind":"step_start","step_id":"s-1","run_id":"r-1",
            "step_name":"extract","step_type":"bq_query","step_index":0}"#;

        let event: LifecycleEvent = serde_json::from_str(line).unwrap();

        assert_eq!(event.category(), Category::StepStart);
        let record = event.into_log_record("acme", at(1));
        assert_eq!(record.idempotency_token.as_str(), "s-1_start");
        assert_eq!(record.payload["metadata"], serde_json::Value::Null);
    }
}
