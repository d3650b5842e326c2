//! Envelope schema and factory for the beacon event bus.
//!
//! This crate is shared by the daemon and its clients to prevent schema
//! drift. The daemon remains the authority on validation, but producers
//! reuse the same types to construct valid envelopes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Wire schema version stamped on every envelope. Consumers reject
/// anything else.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Maximum accepted ingress body size, shared with the server's limit layer.
pub const MAX_BODY_BYTES: usize = 1024 * 1024; // 1MB

const MIN_CORRELATION_LEN: usize = 8;

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Producer class of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cli,
    Hook,
}

/// The canonical event record. Immutable after construction.
///
/// `data` is always a JSON object; its shape is a function of `event_type`.
/// `id` is unique within the producing process but is only a dedup hint
/// across processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub schema_version: String,
    pub id: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub app: String,
    pub app_root: String,
    pub source: Source,
    pub correlation_id: String,
    pub data: Value,
}

/// Context a producer supplies when asking the factory for an envelope.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub app: String,
    pub app_root: String,
    pub source: Source,
    pub correlation_id: Option<String>,
}

/// Serializable failure surfaced to producers on validation errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Assemble a new envelope from a producer payload.
///
/// Stamps a fresh process-unique id and the current UTC instant, and
/// forwards the caller's correlation id when it is a non-empty string.
/// Centralizing assembly here keeps every stored and streamed record on
/// the same schema.
pub fn create_event(event_type: &str, data: Map<String, Value>, ctx: &EventContext) -> Envelope {
    let correlation_id = match ctx.correlation_id.as_deref() {
        Some(value) if !value.trim().is_empty() => value.to_string(),
        _ => new_correlation_id(),
    };

    Envelope {
        schema_version: SCHEMA_VERSION.to_string(),
        id: new_event_id(),
        timestamp: now_timestamp(),
        event_type: event_type.to_string(),
        app: ctx.app.clone(),
        app_root: ctx.app_root.clone(),
        source: ctx.source,
        correlation_id,
        data: Value::Object(data),
    }
}

/// Current UTC instant in the wire format (RFC 3339, millisecond precision).
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Process-unique envelope id: wall-clock millis plus an atomic sequence.
pub fn new_event_id() -> String {
    let seq = EVENT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "evt-{}-{}-{}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        seq
    )
}

/// Fresh short hex correlation token.
pub fn new_correlation_id() -> String {
    use rand::RngCore;
    let mut rng = rand::thread_rng();
    format!("{:016x}", rng.next_u64())[..12].to_string()
}

impl Envelope {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ErrorInfo::new(
                "unsupported_schema",
                format!("schemaVersion must be {}", SCHEMA_VERSION),
            ));
        }
        require_non_empty(&self.id, "id")?;
        require_non_empty(&self.event_type, "type")?;
        require_non_empty(&self.app, "app")?;
        require_non_empty(&self.app_root, "appRoot")?;

        if DateTime::parse_from_rfc3339(&self.timestamp).is_err() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "timestamp must be RFC3339",
            ));
        }

        if self.correlation_id.trim().len() < MIN_CORRELATION_LEN {
            return Err(ErrorInfo::new(
                "invalid_correlation_id",
                format!(
                    "correlationId must be at least {} characters",
                    MIN_CORRELATION_LEN
                ),
            ));
        }

        if !self.data.is_object() {
            return Err(ErrorInfo::new("invalid_data", "data must be a JSON object"));
        }

        Ok(())
    }

    /// Parsed timestamp, used by the store's `since` filter.
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Parse and validate a full envelope received over the wire.
pub fn parse_envelope(value: Value) -> Result<Envelope, ErrorInfo> {
    let envelope: Envelope = serde_json::from_value(value).map_err(|err| {
        ErrorInfo::new(
            "invalid_envelope",
            format!("envelope payload is invalid: {}", err),
        )
    })?;
    envelope.validate()?;
    Ok(envelope)
}

fn require_non_empty(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}
