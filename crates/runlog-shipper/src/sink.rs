//! Sink abstraction the batch writer writes through.
//!
//! A sink persists ordered rows into a named target, deduplicating on the
//! idempotency token that travels with each row. Production uses
//! [`crate::warehouse::WarehouseSink`]; tests and local runs use
//! [`memory::MemorySink`].

use std::{fmt, future::Future, pin::Pin, time::Duration};

use runlog_core::{IdempotencyToken, Payload};
use thiserror::Error;

/// Destination for flushed batches.
pub trait Sink: Send + Sync + fmt::Debug + 'static {
    /// Writes `rows` into `target`.
    ///
    /// `rows[i]` and `tokens[i]` correspond positionally. Repeated calls with
    /// the same token for a target must persist at most one row for that
    /// token. `Ok(())` means every row was accepted.
    fn write_batch<'a>(
        &'a self,
        target: &'a str,
        rows: &'a [Payload],
        tokens: &'a [IdempotencyToken],
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;
}

/// Failure of a single sink write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// Transport-level failure reaching the sink.
    #[error("network error: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// The write did not complete in time.
    #[error("sink write timed out after {timeout_seconds}s")]
    Timeout {
        /// Request timeout that elapsed
        timeout_seconds: u64,
    },

    /// The sink asked us to slow down.
    #[error("rate limited by sink")]
    RateLimited {
        /// Server-provided wait before retrying, if any
        retry_after_seconds: Option<u64>,
    },

    /// The sink refused the request (4xx other than 429).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// The sink failed internally (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// The request was accepted but individual rows were rejected.
    #[error("sink rejected {} rows", errors.len())]
    RowsRejected {
        /// One description per rejected row
        errors: Vec<String>,
    },

    /// Rows could not be encoded for the sink.
    #[error("serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
    },

    /// The sink is misconfigured.
    #[error("invalid sink configuration: {message}")]
    Configuration {
        /// Error message
        message: String,
    },
}

impl SinkError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a rate limit error.
    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a row rejection error.
    pub fn rows_rejected(errors: Vec<String>) -> Self {
        Self::RowsRejected { errors }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether a later attempt with the same batch could succeed.
    ///
    /// Row rejections are retried: the sink contract treats any non-empty
    /// error list as a failure the shipper may retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::ServerError { .. }
            | Self::RowsRejected { .. } => true,

            Self::ClientError { .. } | Self::Serialization { .. } | Self::Configuration { .. } => {
                false
            },
        }
    }

    /// Wait requested by the sink before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_seconds: Some(seconds) } => {
                Some(Duration::from_secs(*seconds))
            },
            _ => None,
        }
    }

    /// Short label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => "network",
            Self::RateLimited { .. } => "rate_limit",
            Self::ClientError { .. } => "client",
            Self::ServerError { .. } => "server",
            Self::RowsRejected { .. } => "rows_rejected",
            Self::Serialization { .. } => "serialization",
            Self::Configuration { .. } => "configuration",
        }
    }
}

/// In-memory sink for tests and local development.
pub mod memory {
    use std::{
        collections::{HashMap, HashSet},
        future::Future,
        pin::Pin,
        sync::Arc,
        time::Duration,
    };

    use runlog_core::{IdempotencyToken, Payload};
    use tokio::sync::Mutex;

    use super::{Sink, SinkError};

    /// One `write_batch` call as seen by the sink.
    #[derive(Debug, Clone, PartialEq)]
    pub struct SinkCall {
        /// Target the batch was written to.
        pub target: String,
        /// Tokens in the order they were sent.
        pub tokens: Vec<IdempotencyToken>,
        /// Error returned to the caller, if the call failed.
        pub error: Option<SinkError>,
    }

    #[derive(Debug, Default)]
    struct MemoryState {
        rows: HashMap<String, Vec<(IdempotencyToken, Payload)>>,
        seen: HashSet<(String, IdempotencyToken)>,
        calls: Vec<SinkCall>,
        fail_next: Vec<SinkError>,
        fail_always: Option<SinkError>,
        latency: Option<Duration>,
    }

    /// Sink that stores rows in memory and deduplicates on
    /// `(target, token)`.
    ///
    /// Clones share state, so a test can hand one clone to the shipper and
    /// inspect another. Failures can be injected for the next N calls or for
    /// every call until [`MemorySink::heal`].
    #[derive(Debug, Clone, Default)]
    pub struct MemorySink {
        state: Arc<Mutex<MemoryState>>,
    }

    impl MemorySink {
        /// Creates an empty sink.
        pub fn new() -> Self {
            Self::default()
        }

        /// Fails the next `count` calls with `error`.
        pub async fn fail_next(&self, count: usize, error: SinkError) {
            let mut state = self.state.lock().await;
            state.fail_next.extend(std::iter::repeat(error).take(count));
        }

        /// Fails every call with `error` until healed.
        pub async fn fail_always(&self, error: SinkError) {
            self.state.lock().await.fail_always = Some(error);
        }

        /// Clears all injected failures.
        pub async fn heal(&self) {
            let mut state = self.state.lock().await;
            state.fail_next.clear();
            state.fail_always = None;
        }

        /// Delays every call by `latency` before it is applied.
        pub async fn set_latency(&self, latency: Duration) {
            self.state.lock().await.latency = Some(latency);
        }

        /// Persisted rows for `target`, in write order.
        pub async fn rows(&self, target: &str) -> Vec<Payload> {
            let state = self.state.lock().await;
            state
                .rows
                .get(target)
                .map(|rows| rows.iter().map(|(_, row)| row.clone()).collect())
                .unwrap_or_default()
        }

        /// Persisted tokens for `target`, in write order.
        pub async fn tokens(&self, target: &str) -> Vec<IdempotencyToken> {
            let state = self.state.lock().await;
            state
                .rows
                .get(target)
                .map(|rows| rows.iter().map(|(token, _)| token.clone()).collect())
                .unwrap_or_default()
        }

        /// Persisted rows across all targets.
        pub async fn row_count(&self) -> usize {
            self.state.lock().await.rows.values().map(Vec::len).sum()
        }

        /// Every call made so far, successful or not.
        pub async fn calls(&self) -> Vec<SinkCall> {
            self.state.lock().await.calls.clone()
        }

        /// Number of calls made so far.
        pub async fn call_count(&self) -> usize {
            self.state.lock().await.calls.len()
        }
    }

    impl Sink for MemorySink {
        fn write_batch<'a>(
            &'a self,
            target: &'a str,
            rows: &'a [Payload],
            tokens: &'a [IdempotencyToken],
        ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
            Box::pin(async move {
                let latency = self.state.lock().await.latency;
                if let Some(latency) = latency {
                    tokio::time::sleep(latency).await;
                }

                let mut state = self.state.lock().await;

                let injected = if state.fail_next.is_empty() {
                    state.fail_always.clone()
                } else {
                    Some(state.fail_next.remove(0))
                };

                let error = injected.or_else(|| {
                    (rows.len() != tokens.len()).then(|| {
                        SinkError::rows_rejected(vec![format!(
                            "{} rows but {} tokens",
                            rows.len(),
                            tokens.len()
                        )])
                    })
                });

                state.calls.push(SinkCall {
                    target: target.to_string(),
                    tokens: tokens.to_vec(),
                    error: error.clone(),
                });

                if let Some(error) = error {
                    return Err(error);
                }

                for (row, token) in rows.iter().zip(tokens) {
                    if state.seen.insert((target.to_string(), token.clone())) {
                        state
                            .rows
                            .entry(target.to_string())
                            .or_default()
                            .push((token.clone(), row.clone()));
                    }
                }

                Ok(())
            })
        }
    }
}
