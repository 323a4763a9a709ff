//! Structured fault records for allocator, cache and startup failures.
//!
//! A record carries the message, the emitting component's namespace and a
//! severity, plus caller-supplied fields. When built with a cause it also
//! carries the cause's type name, description and the location the fault was
//! raised from. Records render as one terse JSON object per line and are
//! emitted through `tracing` under the `chorus::fault` target.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::panic::Location;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::Level;

/// Keys owned by the record itself. Caller fields may not use them.
pub const RESERVED_KEYS: &[&str] = &[
    "log",
    "namespace",
    "level",
    "time",
    "exc_type",
    "exc_value",
    "exc_filename",
    "exc_lineno",
    "message",
    "module",
    "filename",
    "lineno",
    "thread",
    "process",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FaultRecordError {
    #[error("field name {0:?} is reserved by the fault record format")]
    ReservedKey(String),

    #[error("field {key:?} could not be serialized: {message}")]
    Unserializable { key: String, message: String },
}

/// The underlying cause of a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultCause {
    pub type_name: String,
    pub description: String,
    pub filename: &'static str,
    pub lineno: u32,
}

/// One structured fault record.
#[derive(Debug, Clone)]
pub struct FaultRecord {
    message: String,
    namespace: String,
    level: Level,
    time: Option<f64>,
    fields: Map<String, Value>,
    cause: Option<FaultCause>,
}

impl FaultRecord {
    pub fn new(namespace: impl Into<String>, level: Level, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            namespace: namespace.into(),
            level,
            time: None,
            fields: Map::new(),
            cause: None,
        }
    }

    /// Attach a caller field. Reserved keys are rejected.
    pub fn field(mut self, key: &str, value: impl Serialize) -> Result<Self, FaultRecordError> {
        if RESERVED_KEYS.contains(&key) {
            return Err(FaultRecordError::ReservedKey(key.to_string()));
        }
        let value = serde_json::to_value(value).map_err(|e| FaultRecordError::Unserializable {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.fields.insert(key.to_string(), value);
        Ok(self)
    }

    /// Attach several string fields at once, skipping (and reporting) reserved keys.
    pub fn fields<'a, I>(mut self, pairs: I) -> (Self, Vec<FaultRecordError>)
    where
        I: IntoIterator<Item = (&'a str, String)>,
    {
        let mut rejected = Vec::new();
        for (key, value) in pairs {
            if RESERVED_KEYS.contains(&key) {
                rejected.push(FaultRecordError::ReservedKey(key.to_string()));
                continue;
            }
            self.fields.insert(key.to_string(), Value::String(value));
        }
        (self, rejected)
    }

    /// Attach the cause, recording the caller's location as the origin.
    #[track_caller]
    pub fn cause<E>(mut self, error: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let location = Location::caller();
        self.cause = Some(FaultCause {
            type_name: short_type_name(std::any::type_name::<E>()).to_string(),
            description: error.to_string(),
            filename: location.file(),
            lineno: location.line(),
        });
        self
    }

    /// Stamp the record with a wall-clock time (seconds, two decimals).
    pub fn with_time(mut self, at: SystemTime) -> Self {
        let secs = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.time = Some((secs * 100.0).round() / 100.0);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn cause_info(&self) -> Option<&FaultCause> {
        self.cause.as_ref()
    }

    pub fn to_json(&self) -> Value {
        let mut event = Map::new();
        event.insert("log".to_string(), Value::String(self.message.clone()));
        event.insert("namespace".to_string(), Value::String(self.namespace.clone()));
        event.insert("level".to_string(), Value::String(self.level.to_string()));
        if let Some(time) = self.time {
            event.insert("time".to_string(), Value::from(time));
        }

        for (key, value) in &self.fields {
            event.insert(key.clone(), value.clone());
        }

        if let Some(cause) = &self.cause {
            event.insert("exc_type".to_string(), Value::String(cause.type_name.clone()));
            event.insert("exc_value".to_string(), Value::String(cause.description.clone()));
            event.insert("exc_filename".to_string(), Value::String(cause.filename.to_string()));
            event.insert("exc_lineno".to_string(), Value::from(cause.lineno));
        }

        Value::Object(event)
    }

    /// Emit through `tracing` at the record's level.
    pub fn emit(&self) {
        let record = self.to_json();
        let namespace = self.namespace.as_str();
        match self.level {
            Level::ERROR => tracing::error!(target: "chorus::fault", namespace, %record, "{}", self.message),
            Level::WARN => tracing::warn!(target: "chorus::fault", namespace, %record, "{}", self.message),
            Level::INFO => tracing::info!(target: "chorus::fault", namespace, %record, "{}", self.message),
            Level::DEBUG => tracing::debug!(target: "chorus::fault", namespace, %record, "{}", self.message),
            _ => tracing::trace!(target: "chorus::fault", namespace, %record, "{}", self.message),
        }
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
