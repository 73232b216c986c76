//! Generic record shape stored by the record store.

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::fmt;

/// JSON payload of a record.
pub type Fields = Map<String, Value>;

/// Two-part composite key. The partition carries the job-family prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub partition: String,
    pub sort: String,
}

impl RecordKey {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.sort)
    }
}

/// A live (non-expired) record as returned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: RecordKey,
    pub fields: Fields,
    /// Absolute expiry; the record is invisible once this instant has passed.
    pub ttl: DateTime<Utc>,
    /// Incremented by the store on every write.
    pub version: i64,
}

/// Condition attached to a conditional put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// No live record exists under the key (expired rows count as absent).
    Absent,
    /// The live record is still at this version.
    Version(i64),
}

/// Scan over one partition.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub partition: String,
    pub sort_prefix: Option<String>,
    /// Only return sort keys strictly greater than this one.
    pub start_after: Option<String>,
    /// `(field, accepted values)`; matches records whose string field is one of the values.
    pub field_in: Option<(String, Vec<String>)>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn partition(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            ..Self::default()
        }
    }

    pub fn sort_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.sort_prefix = Some(prefix.into());
        self
    }

    pub fn start_after(mut self, sort_key: Option<String>) -> Self {
        self.start_after = sort_key;
        self
    }

    pub fn field_in<I, S>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field_in = Some((field.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Serialize a model into record fields.
pub fn encode<T: Serialize>(value: &T) -> Result<Fields, serde_json::Error> {
    match serde_json::to_value(value)? {
        Value::Object(fields) => Ok(fields),
        other => Err(serde::ser::Error::custom(format!(
            "record payload must be an object, got {}",
            other
        ))),
    }
}

/// Deserialize record fields into a model.
pub fn decode<T: DeserializeOwned>(record: &StoredRecord) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(record.fields.clone()))
}
