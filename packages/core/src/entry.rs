//! Eventlog entries.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Structured context attached to an entry.
pub type Context = Map<String, Value>;

/// One immutable eventlog entry: `{timestamp, name, context?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    /// Seconds since the epoch.
    pub timestamp: f64,
    /// Event name, e.g. `submit` or `alloc`.
    pub name: String,
    /// Optional structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

impl EventEntry {
    /// Create an entry with an explicit timestamp.
    pub fn new(timestamp: f64, name: impl Into<String>, context: Option<Context>) -> Self {
        Self {
            timestamp,
            name: name.into(),
            context,
        }
    }

    /// Create an entry stamped with the current wall-clock time.
    pub fn now(name: impl Into<String>, context: Option<Context>) -> Self {
        Self::new(now_timestamp(), name, context)
    }

    /// Build a context map from a JSON value. Non-objects yield `None`.
    pub fn context_from(value: Value) -> Option<Context> {
        match value {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Encode as a single eventlog line, newline terminated.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one eventlog line.
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }

    /// Look up a context field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.context.as_ref().and_then(|c| c.get(key))
    }
}

/// Current time as fractional seconds since the epoch.
pub fn now_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
