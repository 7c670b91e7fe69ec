//! Record model for pipeline lifecycle audit logs.
//!
//! Defines the typed lifecycle events producers report, the normalized
//! [`LogRecord`] the shipper queues and writes, and the [`Clock`]
//! abstraction every time-dependent component reads from.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod payload;
pub mod records;
pub mod time;

pub use payload::{Attributes, Payload, PayloadBuilder, TIMESTAMP_FORMAT};
pub use records::{
    Category, EntityType, IdempotencyToken, IntoLogRecord, LifecycleEvent, LogRecord, PipelineEnd,
    PipelineStart, RunStatus, StateTransition, StepEnd, StepStart,
};
pub use time::{Clock, RealClock, TestClock};
