use core::fmt;

use serde_json::{Map, Value};
use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use typed_builder::TypedBuilder;

// Millisecond precision is always written out, even when zero.
const EVENT_TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event is not a JSON object")]
    NotAnObject,
}

#[derive(Debug)]
pub enum InvalidEvent {
    CommandMissing,
    PwdMissing,
    BadTimestamp { field: &'static str },
    EndBeforeStart,
}

impl fmt::Display for InvalidEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidEvent::CommandMissing => write!(f, "command is missing or empty"),
            InvalidEvent::PwdMissing => write!(f, "pwd is missing or empty"),
            InvalidEvent::BadTimestamp { field } => write!(f, "{field} is not a valid RFC 3339 timestamp"),
            InvalidEvent::EndBeforeStart => write!(f, "end_timestamp precedes start_timestamp"),
        }
    }
}

impl std::error::Error for InvalidEvent {}

/// One shell-command occurrence, as a raw JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct Event(Map<String, Value>);

/// The fields a producer fills in before serializing an event.
///
/// Collected through a builder because only some of them are always
/// known at the call site (`ip_address`, `config_version`).
#[derive(Debug, TypedBuilder)]
pub struct EventParts {
    #[builder(setter(into))]
    pub command: String,
    pub return_code: i64,
    #[builder(setter(into))]
    pub start_timestamp: String,
    #[builder(setter(into))]
    pub end_timestamp: String,
    #[builder(setter(into))]
    pub pwd: String,
    #[builder(setter(into))]
    pub hostname: String,
    #[builder(default, setter(strip_option, into))]
    pub ip_address: Option<String>,
    #[builder(default)]
    pub env: Vec<(String, String)>,
    #[builder(default, setter(strip_option, into))]
    pub config_version: Option<String>,
}

impl Event {
    /// Parses one line as an event. The line must be a JSON object;
    /// any set of fields is accepted.
    pub fn decode_line(line: &[u8]) -> Result<Self, WireError> {
        let value: Value = serde_json::from_slice(line)?;

        match value {
            Value::Object(map) => Ok(Event(map)),
            _ => Err(WireError::NotAnObject),
        }
    }

    /// Serializes the event as a single line, without the trailing newline.
    pub fn encode_line(&self) -> Vec<u8> {
        // A Map of Values always serializes.
        serde_json::to_vec(&Value::Object(self.0.clone())).expect("JSON object serialization")
    }

    pub fn from_parts(parts: EventParts) -> Self {
        let mut map = Map::new();

        map.insert("command".to_owned(), Value::String(parts.command));
        map.insert("return_code".to_owned(), Value::from(parts.return_code));
        map.insert("start_timestamp".to_owned(), Value::String(parts.start_timestamp));
        map.insert("end_timestamp".to_owned(), Value::String(parts.end_timestamp));
        map.insert("pwd".to_owned(), Value::String(parts.pwd));
        map.insert("hostname".to_owned(), Value::String(parts.hostname));

        if let Some(ip_address) = parts.ip_address {
            map.insert("ip_address".to_owned(), Value::String(ip_address));
        }

        let env: Map<String, Value> = parts.env.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
        map.insert("env".to_owned(), Value::Object(env));

        if let Some(config_version) = parts.config_version {
            map.insert("_config_version".to_owned(), Value::String(config_version));
        }

        Event(map)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn command(&self) -> Option<&str> {
        self.0.get("command").and_then(Value::as_str)
    }

    pub fn pwd(&self) -> Option<&str> {
        self.0.get("pwd").and_then(Value::as_str)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.0.get("hostname").and_then(Value::as_str)
    }

    pub fn return_code(&self) -> Option<i64> {
        self.0.get("return_code").and_then(Value::as_i64)
    }

    /// Stringified view of a field, used for exact-equality filter
    /// matching. Composite values never match a filter.
    pub fn field_as_string(&self, field: &str) -> Option<String> {
        match self.0.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Producer-side invariants. The proxy does not call this: it
    /// forwards anything that parses as an object.
    pub fn validate(&self) -> Result<(), InvalidEvent> {
        if self.command().is_none_or(str::is_empty) {
            return Err(InvalidEvent::CommandMissing);
        }

        if self.pwd().is_none_or(str::is_empty) {
            return Err(InvalidEvent::PwdMissing);
        }

        let start = self.timestamp("start_timestamp")?;
        let end = self.timestamp("end_timestamp")?;

        if end < start {
            return Err(InvalidEvent::EndBeforeStart);
        }

        Ok(())
    }

    fn timestamp(&self, field: &'static str) -> Result<OffsetDateTime, InvalidEvent> {
        self.0
            .get(field)
            .and_then(Value::as_str)
            .and_then(|repr| OffsetDateTime::parse(repr, &Rfc3339).ok())
            .ok_or(InvalidEvent::BadTimestamp { field })
    }
}

/// RFC 3339 with millisecond precision, the calendar form events carry.
pub fn format_timestamp(t: OffsetDateTime) -> String {
    t.to_offset(UtcOffset::UTC)
        .format(&EVENT_TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00.000Z"))
}
