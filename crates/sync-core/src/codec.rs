//! Push-channel frame decoding and wire timestamp helpers.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, de};
use serde_json::Value;
use tracing::trace;

use crate::{
    error::{SyncError, SyncErrorCategory},
    types::{PushEvent, StatusUpdate, WireMessage},
};

/// Values below this are treated as epoch seconds rather than milliseconds.
const EPOCH_SECONDS_LIMIT: u64 = 100_000_000_000;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope {
    #[serde(alias = "new-message")]
    NewMessage { message: WireMessage },
    #[serde(alias = "message-sent")]
    MessageSent { data: WireMessage },
    #[serde(alias = "status-updated", alias = "status_updated")]
    Status { data: StatusUpdate },
    #[serde(alias = "contact-updated")]
    ContactUpdated {
        #[serde(default, alias = "contact")]
        data: Value,
    },
    #[serde(alias = "template-updated")]
    TemplateUpdated {
        #[serde(default, alias = "template")]
        data: Value,
    },
    #[serde(alias = "stats-updated")]
    StatsUpdated {
        #[serde(default, alias = "stats")]
        data: Value,
    },
    Error {
        #[serde(default)]
        data: ErrorPayload,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: String,
    #[serde(default)]
    phone_number: Option<String>,
}

/// Decode one text frame. Unknown event types decode to `Ok(None)`.
pub fn decode_push_frame(frame: &str) -> Result<Option<PushEvent>, SyncError> {
    let envelope = serde_json::from_str::<Envelope>(frame).map_err(decode_error)?;
    Ok(event_from_envelope(envelope))
}

/// Decode one binary frame carrying UTF-8 JSON.
pub fn decode_push_bytes(frame: &[u8]) -> Result<Option<PushEvent>, SyncError> {
    let envelope = serde_json::from_slice::<Envelope>(frame).map_err(decode_error)?;
    Ok(event_from_envelope(envelope))
}

fn event_from_envelope(envelope: Envelope) -> Option<PushEvent> {
    let event = match envelope {
        Envelope::NewMessage { message } | Envelope::MessageSent { data: message } => {
            PushEvent::NewMessage(message)
        }
        Envelope::Status { data } => PushEvent::StatusUpdate(data),
        Envelope::ContactUpdated { data } => PushEvent::ContactUpdated(data),
        Envelope::TemplateUpdated { data } => PushEvent::TemplateUpdated(data),
        Envelope::StatsUpdated { data } => PushEvent::StatsUpdated(data),
        Envelope::Error { data } => PushEvent::ServerError {
            message: data.message,
            contact_id: data.phone_number,
        },
        Envelope::Unknown => {
            trace!("skipping push frame with unknown event type");
            return None;
        }
    };
    Some(event)
}

fn decode_error(err: serde_json::Error) -> SyncError {
    SyncError::new(
        SyncErrorCategory::Serialization,
        "push_decode_error",
        err.to_string(),
    )
}

/// Parse a backend timestamp into milliseconds since Unix epoch.
///
/// Accepts RFC 3339, naive ISO-8601 (assumed UTC, as the backend emits
/// `datetime.isoformat()` without offset) and bare epoch seconds/millis.
pub fn parse_timestamp_ms(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return u64::try_from(parsed.timestamp_millis()).ok();
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return u64::try_from(naive.and_utc().timestamp_millis()).ok();
        }
    }
    raw.parse::<u64>().ok().map(epoch_to_ms)
}

/// Format milliseconds since epoch as an RFC 3339 UTC string (`...Z`).
pub fn format_timestamp_rfc3339(timestamp_ms: u64) -> String {
    let millis = i64::try_from(timestamp_ms).unwrap_or(i64::MAX);
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn epoch_to_ms(value: u64) -> u64 {
    if value < EPOCH_SECONDS_LIMIT {
        value.saturating_mul(1_000)
    } else {
        value
    }
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(value) => Ok(value),
        Value::Number(value) => Ok(value.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

pub(crate) fn timestamp_ms<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(value) => value
            .as_u64()
            .or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
            .map(epoch_to_ms)
            .ok_or_else(|| de::Error::custom(format!("invalid numeric timestamp {value}"))),
        Value::String(value) => parse_timestamp_ms(&value)
            .ok_or_else(|| de::Error::custom(format!("unparseable timestamp '{value}'"))),
        other => Err(de::Error::custom(format!(
            "expected timestamp string or number, got {other}"
        ))),
    }
}
