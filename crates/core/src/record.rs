//! Telemetry data model: records, field values, and batches.
//!
//! A [`Record`] is one decoded sensor data point. Records are immutable
//! once constructed and move through the pipeline by value. A [`Batch`]
//! is an ordered group of records that is flushed to storage as a whole.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

/// Typed measurement values. Telemetry fields are numeric or absent;
/// anything else in the payload is ignored at decode time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Null,
}

impl FieldValue {
    /// Extract as f64, returning None for Null.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Null => None,
        }
    }
}

/// One decoded telemetry data point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Originating device identifier.
    pub device_id: String,
    /// Measurement time, epoch seconds. Monotonicity per device is not
    /// assumed anywhere in the pipeline.
    pub timestamp: i64,
    /// Named measurement values (e.g. "temperature", "humidity").
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(device_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insertion, mostly for tests and examples.
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Numeric value of a named field, None if absent or null.
    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_f64)
    }

    /// Decode a wire payload (JSON object) into a record.
    ///
    /// `device_id` (string) and `timestamp` (integer) are required; every
    /// other key with a numeric or null value becomes a field. Non-numeric
    /// extras are dropped silently; the storage schema has no place for
    /// them and they are not an error.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let json: Value = serde_json::from_slice(payload)?;
        let obj = json.as_object().ok_or(DecodeError::NotAnObject)?;

        let device_id = obj
            .get("device_id")
            .ok_or(DecodeError::MissingField("device_id"))?
            .as_str()
            .ok_or(DecodeError::InvalidField("device_id", "string"))?
            .to_string();

        let timestamp = obj
            .get("timestamp")
            .ok_or(DecodeError::MissingField("timestamp"))?
            .as_i64()
            .ok_or(DecodeError::InvalidField("timestamp", "integer"))?;

        let mut fields = BTreeMap::new();
        for (key, value) in obj {
            if key == "device_id" || key == "timestamp" {
                continue;
            }
            match value {
                Value::Number(n) => {
                    let fv = match n.as_i64() {
                        Some(i) => FieldValue::Integer(i),
                        None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
                    };
                    fields.insert(key.clone(), fv);
                }
                Value::Null => {
                    fields.insert(key.clone(), FieldValue::Null);
                }
                _ => {}
            }
        }

        Ok(Self {
            device_id,
            timestamp,
            fields,
        })
    }
}

/// An ordered group of records flushed together.
///
/// Produced by the batch accumulator's snapshot and never mutated after
/// hand-off: the writer either commits every record or none of them.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    records: Vec<Record>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}
