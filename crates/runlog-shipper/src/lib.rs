//! Bounded, circuit-protected shipper for pipeline audit records.
//!
//! Pipelines report lifecycle events through a [`Shipper`]. Records are
//! buffered in one bounded queue per category and written to a [`Sink`] in
//! batches by a small pool of periodic workers.
//!
//! # Architecture
//!
//! 1. **Ingestion** - `record_*` builds a normalized record and enqueues it,
//!    waiting at most `enqueue_timeout` for space
//! 2. **Backpressure** - critical categories return
//!    [`ShipperError::BackpressureTimeout`]; state transitions are dropped
//!    and counted
//! 3. **Flush cycle** - workers drain each queue in fixed order, gated by a
//!    shared [`circuit::CircuitBreaker`]
//! 4. **Batch write** - the [`writer::BatchWriter`] retries transient sink
//!    failures with exponential backoff, then gives up and counts the batch
//!    as lost
//!
//! Failed batches are never re-enqueued. Loss under a sustained sink outage
//! is bounded and visible through [`Shipper::queue_depths`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use runlog_shipper::{
//!     warehouse::{WarehouseConfig, WarehouseSink},
//!     Shipper, ShipperConfig,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sink = WarehouseSink::new(WarehouseConfig {
//!     endpoint: "https://warehouse.example/tables/{target}/insertAll".into(),
//!     ..Default::default()
//! })?;
//! let shipper = Shipper::new("acme", ShipperConfig::default(), Arc::new(sink))?;
//! shipper.start().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod error;
pub mod introspection;
pub mod queue;
pub mod retry;
pub mod shipper;
pub mod sink;
pub mod warehouse;
mod worker;
mod worker_pool;
pub mod writer;

// Re-export main public API
pub use error::{Result, ShipperError};
pub use introspection::{QueueDepth, QueueDepths, StatsSnapshot};
pub use shipper::{FlushReport, Shipper, ShipperConfig, TableNames};
pub use sink::{memory, Sink, SinkError};

/// Default number of concurrent flush workers.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default records per flush per category.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default capacity of each category queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
