// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::EncodeError;
use crate::record::{AttributeValue, LogRecord};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

pub(crate) const LEVEL_KEY: &str = "level";
pub(crate) const TRACE_ID_KEY: &str = "trace.id";
pub(crate) const SPAN_ID_KEY: &str = "span.id";
pub(crate) const SOURCE_TYPE_KEY: &str = "source.type";

/// Attributes shared by every record of a batch, serialized once per
/// envelope instead of once per record.
pub type CommonAttributes = HashMap<String, AttributeValue>;

/// Result of encoding one batch.
pub struct EncodedBatch {
    pub body: Bytes,
    /// Records present in the body.
    pub records: usize,
    /// Records dropped by per-record validation.
    pub records_dropped: usize,
}

#[derive(Serialize)]
struct Envelope<'a> {
    common: Common<'a>,
    logs: Vec<LogEntry>,
}

#[derive(Serialize)]
struct Common<'a> {
    attributes: &'a CommonAttributes,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: i64,
    message: String,
    attributes: Map<String, Value>,
}

/// Converts a sealed batch into the intake JSON document.
///
/// Pure function, no I/O. Records failing validation (non-finite numeric
/// attributes) are dropped from the batch and counted; they never abort the
/// batch. An all-invalid or empty batch yields zero records and an empty
/// body, which the caller must not send.
pub fn encode_batch(
    records: &[LogRecord],
    common_attributes: &CommonAttributes,
) -> Result<EncodedBatch, EncodeError> {
    let mut entries = Vec::with_capacity(records.len());
    let mut dropped = 0usize;
    for record in records {
        match validate(record) {
            Ok(()) => entries.push(entry_for(record)),
            Err(error) => {
                dropped += 1;
                debug!("dropping unencodable record: {error}");
            }
        }
    }

    let encoded = entries.len();
    if encoded == 0 {
        return Ok(EncodedBatch {
            body: Bytes::new(),
            records: 0,
            records_dropped: dropped,
        });
    }

    let envelope = [Envelope {
        common: Common {
            attributes: common_attributes,
        },
        logs: entries,
    }];
    let body = serde_json::to_vec(&envelope)?;
    Ok(EncodedBatch {
        body: Bytes::from(body),
        records: encoded,
        records_dropped: dropped,
    })
}

fn validate(record: &LogRecord) -> Result<(), EncodeError> {
    for (key, value) in &record.attributes {
        if !value.is_finite() {
            return Err(EncodeError::NonFiniteNumber { key: key.clone() });
        }
    }
    Ok(())
}

fn entry_for(record: &LogRecord) -> LogEntry {
    let mut attributes = Map::with_capacity(record.attributes.len() + 3);
    for (key, value) in &record.attributes {
        attributes.insert(key.clone(), value.into());
    }
    // Reserved keys win over user attributes of the same name.
    attributes.insert(
        LEVEL_KEY.to_string(),
        Value::String(record.severity.as_str().to_string()),
    );
    if let Some(trace_id) = &record.trace_id {
        attributes.insert(TRACE_ID_KEY.to_string(), Value::String(trace_id.clone()));
    }
    if let Some(span_id) = &record.span_id {
        attributes.insert(SPAN_ID_KEY.to_string(), Value::String(span_id.clone()));
    }

    LogEntry {
        timestamp: record.timestamp_ms,
        message: record.message.clone(),
        attributes,
    }
}

impl From<&AttributeValue> for Value {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::Str(text) => Value::String(text.clone()),
            AttributeValue::Int(number) => Value::from(*number),
            AttributeValue::Float(number) => Value::from(*number),
            AttributeValue::Bool(flag) => Value::Bool(*flag),
        }
    }
}
