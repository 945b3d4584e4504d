// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Severity of a log record, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Severity {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar value attached to a record under an attribute name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl AttributeValue {
    /// False only for non-finite numbers, which the intake cannot represent.
    pub(crate) fn is_finite(&self) -> bool {
        match self {
            AttributeValue::Float(value) => value.is_finite(),
            _ => true,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Str(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Str(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Int(i64::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// One log event accepted for forwarding. Immutable once constructed; owned
/// by the aggregator until encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub severity: Severity,
    /// May be empty, never absent.
    pub message: String,
    pub attributes: HashMap<String, AttributeValue>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

/// An adapter-supplied event, translated into a [`LogRecord`] by
/// [`crate::forwarder::LogForwarder::record`].
///
/// A missing timestamp takes the wall clock at acceptance; severity defaults
/// to `Info`.
#[derive(Debug, Clone, Default)]
pub struct LogEvent {
    pub timestamp_ms: Option<i64>,
    pub severity: Severity,
    pub message: String,
    pub attributes: HashMap<String, AttributeValue>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl LogEvent {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        LogEvent {
            severity,
            message: message.into(),
            ..LogEvent::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }

    pub(crate) fn into_record(self, now: SystemTime) -> LogRecord {
        LogRecord {
            timestamp_ms: self.timestamp_ms.unwrap_or_else(|| epoch_millis(now)),
            severity: self.severity,
            message: self.message,
            attributes: self.attributes,
            trace_id: self.trace_id,
            span_id: self.span_id,
        }
    }
}

/// Milliseconds since the Unix epoch; a clock behind the epoch clamps to 0.
pub(crate) fn epoch_millis(now: SystemTime) -> i64 {
    now.duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
