use chrono::{DateTime, FixedOffset, SecondsFormat, TimeZone, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

/// Reasons a single field of an inbound message could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("invalid timestamp: {0}")]
    Timestamp(String),
    #[error("invalid {field}: {reason}")]
    Position { field: &'static str, reason: String },
}

/// A console event timestamp.
///
/// Browsers send this as an ISO-8601 string (with or without fractional
/// seconds), as epoch milliseconds, or occasionally as a numeric string.
/// Decoding tries each shape in that order and rejects anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(DateTime<FixedOffset>);

impl Timestamp {
    pub fn from_datetime<Tz: TimeZone>(dt: DateTime<Tz>) -> Self {
        Timestamp(dt.fixed_offset())
    }

    pub fn from_unix_millis(millis: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(Self::from_datetime)
    }

    pub fn parse_str(raw: &str) -> Result<Self, FieldError> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Timestamp(dt));
        }
        // Offsets written without a colon ("+0000") are still ISO-8601.
        if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
            return Ok(Timestamp(dt));
        }

        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            if let Ok(millis) = trimmed.parse::<f64>() {
                return Self::from_millis_f64(millis);
            }
        }

        Err(FieldError::Timestamp(format!("unrecognized string format: {}", raw)))
    }

    pub fn from_value(value: &Value) -> Result<Self, FieldError> {
        match value {
            Value::String(s) => Self::parse_str(s),
            Value::Number(n) => {
                if let Some(millis) = n.as_i64() {
                    return Self::from_unix_millis(millis).ok_or_else(|| {
                        FieldError::Timestamp(format!("epoch milliseconds out of range: {}", millis))
                    });
                }
                match n.as_f64() {
                    Some(millis) => Self::from_millis_f64(millis),
                    None => Err(FieldError::Timestamp(format!("unsupported number: {}", n))),
                }
            }
            _ => Err(FieldError::Timestamp(
                "timestamp must be a string or number".to_string(),
            )),
        }
    }

    fn from_millis_f64(millis: f64) -> Result<Self, FieldError> {
        if !millis.is_finite() || millis.abs() > i64::MAX as f64 {
            return Err(FieldError::Timestamp(format!(
                "epoch milliseconds out of range: {}",
                millis
            )));
        }
        // Fractional milliseconds are truncated.
        let whole = millis.trunc() as i64;
        Self::from_unix_millis(whole).ok_or_else(|| {
            FieldError::Timestamp(format!("epoch milliseconds out of range: {}", whole))
        })
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0.with_timezone(&Utc)
    }

    /// `YYYY-MM-DD HH:MM:SS.mmm`, in the offset the timestamp was sent with.
    pub fn to_log_string(&self) -> String {
        self.0.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Timestamp::from_value(&value).map_err(de::Error::custom)
    }
}

/// Decode a source line/column that may arrive as a number or a numeric string.
/// `null` and the empty string both mean "absent".
pub fn parse_position(field: &'static str, value: &Value) -> Result<Option<u32>, FieldError> {
    let invalid = |reason: &str| FieldError::Position {
        field,
        reason: reason.to_string(),
    };

    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| invalid("must be a non-negative integer")),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            if !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid("must be an integer value"));
            }
            s.parse::<u32>()
                .map(Some)
                .map_err(|_| invalid("integer out of range"))
        }
        _ => Err(invalid("must be a number or numeric string")),
    }
}

fn deserialize_line<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?.unwrap_or(Value::Null);
    parse_position("line", &value).map_err(de::Error::custom)
}

fn deserialize_column<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u32>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?.unwrap_or(Value::Null);
    parse_position("column", &value).map_err(de::Error::custom)
}

/// One browser console event, as sent by the extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub url: String,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(
        default,
        deserialize_with = "deserialize_line",
        skip_serializing_if = "Option::is_none"
    )]
    pub line: Option<u32>,
    #[serde(
        default,
        deserialize_with = "deserialize_column",
        skip_serializing_if = "Option::is_none"
    )]
    pub column: Option<u32>,
}

/// Response frame written back for every inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Acknowledgment {
    pub fn new(success: bool, error: &str) -> Self {
        let error = if success || error.is_empty() {
            None
        } else {
            Some(error.to_string())
        };
        Acknowledgment { success, error }
    }

    pub fn ok() -> Self {
        Acknowledgment::new(true, "")
    }

    pub fn failure(error: impl std::fmt::Display) -> Self {
        Acknowledgment::new(false, &error.to_string())
    }
}

/// Where the host writes when the browser launches it without arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub log_path: PathBuf,
    #[serde(default)]
    pub levels: Vec<String>,
}
