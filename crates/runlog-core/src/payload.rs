//! Ordered record payloads and field normalization.
//!
//! Sinks treat a payload as opaque serializable data, so every value is
//! normalized here before a record leaves the producer: timestamps become
//! fixed-format UTC text and structured maps become canonical JSON text.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Text format every timestamp field is normalized to.
///
/// Microsecond precision, always UTC, always suffixed with `Z`:
/// `2024-03-01T12:30:45.123456Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Ordered mapping of field name to value.
///
/// Field order follows insertion order.
pub type Payload = Map<String, Value>;

/// Structured, caller-supplied data such as pipeline parameters or step
/// metadata.
pub type Attributes = Map<String, Value>;

/// Formats a timestamp in [`TIMESTAMP_FORMAT`].
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Milliseconds between `started_at` and `ended_at`, clamped at zero when
/// the clocks disagree.
pub fn duration_ms(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> i64 {
    (ended_at - started_at).num_milliseconds().max(0)
}

/// Builds a [`Payload`] field by field, normalizing as it goes.
#[derive(Debug, Default, Clone)]
pub struct PayloadBuilder {
    fields: Payload,
}

impl PayloadBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a text field.
    #[must_use]
    pub fn text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.insert(name.to_string(), Value::String(value.into()));
        self
    }

    /// Adds a text field, or `null` when absent.
    #[must_use]
    pub fn optional_text(mut self, name: &str, value: Option<String>) -> Self {
        self.fields.insert(name.to_string(), value.map_or(Value::Null, Value::String));
        self
    }

    /// Adds an integer field.
    #[must_use]
    pub fn integer(mut self, name: &str, value: impl Into<i64>) -> Self {
        self.fields.insert(name.to_string(), Value::from(value.into()));
        self
    }

    /// Adds an unsigned integer field, or `null` when absent.
    #[must_use]
    pub fn optional_count(mut self, name: &str, value: Option<u64>) -> Self {
        self.fields.insert(name.to_string(), value.map_or(Value::Null, Value::from));
        self
    }

    /// Adds a timestamp field in [`TIMESTAMP_FORMAT`].
    #[must_use]
    pub fn timestamp(mut self, name: &str, value: DateTime<Utc>) -> Self {
        self.fields.insert(name.to_string(), Value::String(format_timestamp(value)));
        self
    }

    /// Adds a structured field as canonical JSON text, or `null` when absent.
    ///
    /// Nested string values that parse as RFC 3339 timestamps are rewritten
    /// into [`TIMESTAMP_FORMAT`] first so the stored text is stable no matter
    /// how the caller formatted them.
    #[must_use]
    pub fn attributes(mut self, name: &str, value: Option<Attributes>) -> Self {
        let normalized = value.map_or(Value::Null, |attributes| {
            Value::String(normalize_value(Value::Object(attributes)).to_string())
        });
        self.fields.insert(name.to_string(), normalized);
        self
    }

    /// Finishes the payload.
    pub fn build(self) -> Payload {
        self.fields
    }
}

/// Recursively rewrites timestamp-looking strings into [`TIMESTAMP_FORMAT`].
pub fn normalize_value(value: Value) -> Value {
    match value {
        Value::String(text) => match DateTime::parse_from_rfc3339(&text) {
            Ok(parsed) => Value::String(format_timestamp(parsed.with_timezone(&Utc))),
            Err(_) => Value::String(text),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        Value::Object(fields) => {
            Value::Object(fields.into_iter().map(|(k, v)| (k, normalize_value(v))).collect())
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn timestamps_use_fixed_microsecond_format() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
        assert_eq!(format_timestamp(ts), "2024-03-01T12:30:45.000000Z");
    }

    #[test]
    fn builder_preserves_insertion_order() {
        let payload = PayloadBuilder::new()
            .text("zeta", "z")
            .text("alpha", "a")
            .integer("middle", 3)
            .build();

        let keys: Vec<&str> = payload.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "middle"]);
    }

    #[test]
    fn attributes_become_json_text_with_normalized_timestamps() {
        let mut attrs = Attributes::new();
        attrs.insert("window_start".into(), json!("2024-03-01T14:30:45+02:00"));
        attrs.insert("provider".into(), json!("openai"));

        let payload = PayloadBuilder::new().attributes("parameters", Some(attrs)).build();

        assert_eq!(
            payload["parameters"],
            json!(r#"{"window_start":"2024-03-01T12:30:45.000000Z","provider":"openai"}"#)
        );
    }

    #[test]
    fn absent_optionals_are_null() {
        let payload = PayloadBuilder::new()
            .optional_text("error_message", None)
            .optional_count("rows_processed", None)
            .attributes("metadata", None)
            .build();

        assert!(payload.values().all(Value::is_null));
    }

    #[test]
    fn duration_is_never_negative() {
        let later = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        assert_eq!(duration_ms(earlier, later), 5_000);
        assert_eq!(duration_ms(later, earlier), 0);
    }
}
