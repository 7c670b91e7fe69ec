//! Error types surfaced by the shipper.
//!
//! Only backpressure on a critical category ever reaches a producer. Sink
//! failures are resolved inside the flush cycle and show up in logs and
//! lost counters instead, so they live in [`crate::sink::SinkError`].

use std::time::Duration;

use runlog_core::Category;
use thiserror::Error;

/// Result type alias for shipper operations.
pub type Result<T> = std::result::Result<T, ShipperError>;

/// Errors returned by the shipper's ingestion and lifecycle APIs.
#[derive(Debug, Clone, Error)]
pub enum ShipperError {
    /// A critical record could not be queued before the enqueue timeout.
    #[error("{category} queue full: enqueue timed out after {timeout_ms}ms")]
    BackpressureTimeout {
        /// Category whose queue was full
        category: Category,
        /// Enqueue timeout that elapsed
        timeout_ms: u64,
    },

    /// Invalid shipper configuration.
    #[error("invalid shipper configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Workers did not exit within the shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("flush worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Identifier of the worker that panicked
        worker_id: usize,
        /// Panic description
        error: String,
    },
}

impl ShipperError {
    /// Creates a backpressure error for `category`.
    pub fn backpressure_timeout(category: Category, timeout: Duration) -> Self {
        Self::BackpressureTimeout {
            category,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Whether this error is a producer-facing backpressure rejection.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::BackpressureTimeout { .. })
    }
}
