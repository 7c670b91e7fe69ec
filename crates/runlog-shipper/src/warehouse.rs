//! HTTP sink speaking a warehouse streaming-insert protocol.
//!
//! Each batch becomes one `POST` to the configured endpoint with `{target}`
//! replaced by the table name:
//!
//! ```json
//! {"skipInvalidRows": false, "ignoreUnknownValues": false,
//!  "rows": [{"insertId": "run-1_end", "json": {"pipeline_logging_id": "run-1"}}]}
//! ```
//!
//! The idempotency token travels as `insertId`, which the warehouse uses to
//! deduplicate. A 2xx response may still carry per-row `insertErrors`; those
//! become [`SinkError::RowsRejected`].

use std::{future::Future, pin::Pin, time::Duration};

use reqwest::{header::HeaderMap, StatusCode};
use runlog_core::{IdempotencyToken, Payload};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::sink::{Sink, SinkError};

/// Placeholder in [`WarehouseConfig::endpoint`] replaced by the target.
pub const TARGET_PLACEHOLDER: &str = "{target}";

const MAX_ERROR_BODY_SIZE: usize = 1024;

/// Configuration for [`WarehouseSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// Insert URL containing `{target}`, e.g.
    /// `https://warehouse.example/v2/datasets/audit/tables/{target}/insertAll`.
    pub endpoint: String,
    /// Bearer token sent with every request.
    pub auth_token: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Ask the warehouse to accept valid rows when others are invalid.
    pub skip_invalid_rows: bool,
    /// Ask the warehouse to ignore columns it does not know.
    pub ignore_unknown_values: bool,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            auth_token: None,
            timeout: Duration::from_secs(30),
            user_agent: format!("runlog-shipper/{}", env!("CARGO_PKG_VERSION")),
            skip_invalid_rows: false,
            ignore_unknown_values: false,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllRequest<'a> {
    skip_invalid_rows: bool,
    ignore_unknown_values: bool,
    rows: Vec<InsertRow<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertRow<'a> {
    insert_id: &'a str,
    json: &'a Payload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<RowErrors>,
}

#[derive(Debug, Deserialize)]
struct RowErrors {
    index: usize,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

impl RowErrors {
    fn describe(&self, tokens: &[IdempotencyToken]) -> String {
        let token = tokens.get(self.index).map_or("<unknown>", IdempotencyToken::as_str);
        let reasons: Vec<String> = self
            .errors
            .iter()
            .map(|e| if e.message.is_empty() { e.reason.clone() } else { format!("{}: {}", e.reason, e.message) })
            .collect();
        format!("row {} ({token}): {}", self.index, reasons.join("; "))
    }
}

/// Sink writing batches to a warehouse over HTTP.
#[derive(Debug, Clone)]
pub struct WarehouseSink {
    client: reqwest::Client,
    config: WarehouseConfig,
}

impl WarehouseSink {
    /// Creates a sink for `config`.
    ///
    /// # Errors
    ///
    /// Returns `SinkError::Configuration` if the endpoint is missing the
    /// `{target}` placeholder or the HTTP client cannot be built.
    pub fn new(config: WarehouseConfig) -> Result<Self, SinkError> {
        if !config.endpoint.contains(TARGET_PLACEHOLDER) {
            return Err(SinkError::configuration(format!(
                "warehouse endpoint must contain {TARGET_PLACEHOLDER}"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| SinkError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Insert URL for `target`.
    pub fn url_for(&self, target: &str) -> String {
        self.config.endpoint.replace(TARGET_PLACEHOLDER, target)
    }

    async fn insert_all(
        &self,
        target: &str,
        rows: &[Payload],
        tokens: &[IdempotencyToken],
    ) -> Result<(), SinkError> {
        if rows.len() != tokens.len() {
            return Err(SinkError::serialization(format!(
                "{} rows but {} idempotency tokens",
                rows.len(),
                tokens.len()
            )));
        }

        let body = InsertAllRequest {
            skip_invalid_rows: self.config.skip_invalid_rows,
            ignore_unknown_values: self.config.ignore_unknown_values,
            rows: rows
                .iter()
                .zip(tokens)
                .map(|(row, token)| InsertRow { insert_id: token.as_str(), json: row })
                .collect(),
        };

        let mut request = self.client.post(self.url_for(target)).json(&body);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let started = std::time::Instant::now();
        let response = request.send().await.map_err(|e| {
            warn!(duration_ms = started.elapsed().as_millis(), error = %e, "insert request failed");
            if e.is_timeout() {
                SinkError::timeout(self.config.timeout.as_secs())
            } else if e.is_connect() {
                SinkError::network(format!("connection failed: {e}"))
            } else {
                SinkError::network(e.to_string())
            }
        })?;

        let status = response.status();
        debug!(status = status.as_u16(), duration_ms = started.elapsed().as_millis(), "insert response");

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SinkError::rate_limited(retry_after_seconds(response.headers())));
        }

        let bytes = response.bytes().await.map_err(|e| SinkError::network(format!("failed to read response body: {e}")))?;

        if status.is_client_error() {
            return Err(SinkError::client_error(status.as_u16(), truncate_body(&bytes)));
        }
        if !status.is_success() {
            return Err(SinkError::server_error(status.as_u16(), truncate_body(&bytes)));
        }

        let parsed: InsertAllResponse = if bytes.iter().all(u8::is_ascii_whitespace) {
            InsertAllResponse::default()
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|e| SinkError::serialization(format!("invalid insert response: {e}")))?
        };

        if parsed.insert_errors.is_empty() {
            return Ok(());
        }

        Err(SinkError::rows_rejected(
            parsed.insert_errors.iter().map(|row| row.describe(tokens)).collect(),
        ))
    }
}

impl Sink for WarehouseSink {
    fn write_batch<'a>(
        &'a self,
        target: &'a str,
        rows: &'a [Payload],
        tokens: &'a [IdempotencyToken],
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        let span = info_span!("warehouse_insert", target = %target, batch_size = rows.len());
        Box::pin(self.insert_all(target, rows, tokens).instrument(span))
    }
}

/// Parses `Retry-After` as delta-seconds or an HTTP date.
pub fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    let retry_at = chrono::DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&chrono::Utc);
    let wait = retry_at.signed_duration_since(chrono::Utc::now());
    Some(wait.to_std().map_or(0, |d| d.as_secs()))
}

fn truncate_body(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_ERROR_BODY_SIZE {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let suffix = "... (truncated)";
    let truncated = String::from_utf8_lossy(&bytes[..MAX_ERROR_BODY_SIZE - suffix.len()]);
    format!("{truncated}{suffix}")
}
