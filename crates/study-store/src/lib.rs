//! Record-store adapter for study history and duplicate detection.
//!
//! Every store operation the orchestration needs is an explicit method on
//! [`RecordStore`]; [`SqliteRecordStore`] is the bundled backend.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use study_core::{RunDescriptors, StudyLogEntry, StudyRequest, StudyResult, StudyStatus};

pub mod detector;
pub mod history;
pub mod sqlite;

pub use detector::{DetectorError, DuplicateCriteria, DuplicateStudyDetector, RunCheck};
pub use sqlite::SqliteRecordStore;

pub const REQUEST_TYPE: &str = "request";
pub const RESULT_TYPE: &str = "result";
pub const REQUESTS_PREDICATE: &str = "requests";
pub const YIELDS_PREDICATE: &str = "yields";
pub const STATUS_FIELD: &str = "status";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const RUN_DESCRIPTORS_KEY: &str = "run_descriptors";

/// Largest value or id list sent in one backend call.
pub const DEFAULT_BATCH_LIMIT: usize = 998;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record store {0} is not connected")]
    NotConnected(String),
    #[error("record {0} already exists")]
    AlreadyExists(String),
    #[error("record {0} does not exist")]
    Missing(String),
    #[error("record {id} is malformed: {detail}")]
    Malformed { id: String, detail: String },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Scalar(Value),
    List(Vec<Value>),
}

impl Datum {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(items) => Datum::List(items),
            other => Datum::Scalar(other),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Datum::Scalar(v) => v.clone(),
            Datum::List(items) => Value::Array(items.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub record_type: String,
    pub data: BTreeMap<String, Datum>,
    pub user_defined: Value,
}

impl Record {
    pub fn new(id: impl Into<String>, record_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            record_type: record_type.into(),
            data: BTreeMap::new(),
            user_defined: Value::Null,
        }
    }

    pub fn with_datum(mut self, name: impl Into<String>, value: Value) -> Self {
        self.data.insert(name.into(), Datum::from_value(value));
        self
    }

    pub fn scalar(&self, name: &str) -> Option<&Value> {
        match self.data.get(name) {
            Some(Datum::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StudyStatus> {
        self.scalar(STATUS_FIELD)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    /// Request record for a log entry: status, study type, timestamp and the
    /// flattened parameters, with the raw descriptors kept alongside.
    pub fn request_from_entry(entry: &StudyLogEntry, list_fields: &[String]) -> Result<Self, StoreError> {
        let flat = StudyRequest::from_descriptors(&entry.request_id, &entry.descriptors, None, list_fields);
        let mut record = Record::new(&entry.request_id, REQUEST_TYPE)
            .with_datum(STATUS_FIELD, Value::String(entry.status.as_str().to_string()))
            .with_datum(study_core::request::STUDY_TYPE_FIELD, Value::String(flat.study_type.clone()))
            .with_datum(TIMESTAMP_FIELD, Value::from(chrono::Utc::now().timestamp_millis()));
        for (name, value) in flat.parameters {
            record.data.insert(name, Datum::from_value(value));
        }
        let mut user_defined = serde_json::Map::new();
        user_defined.insert(
            RUN_DESCRIPTORS_KEY.to_string(),
            serde_json::to_value(&entry.descriptors)?,
        );
        record.user_defined = Value::Object(user_defined);
        Ok(record)
    }

    pub fn result_from_entry(request_id: &str, result: &StudyResult) -> Self {
        let mut record = Record::new(result_record_id(request_id), RESULT_TYPE);
        for (name, value) in result {
            record.data.insert(name.clone(), Datum::from_value(value.clone()));
        }
        record
    }

    pub fn run_descriptors(&self) -> Result<RunDescriptors, StoreError> {
        let raw = self
            .user_defined
            .get(RUN_DESCRIPTORS_KEY)
            .cloned()
            .ok_or_else(|| StoreError::Malformed {
                id: self.id.clone(),
                detail: "missing run_descriptors".to_string(),
            })?;
        Ok(serde_json::from_value(raw)?)
    }

    pub fn result_values(&self) -> StudyResult {
        self.data
            .iter()
            .map(|(k, v)| (k.clone(), v.to_value()))
            .collect()
    }
}

pub fn result_record_id(request_id: &str) -> String {
    format!("{}_result", request_id)
}

/// How a relationship subject is matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectMatch {
    Is(String),
    StartsWith(String),
    EndsWith(String),
}

impl SubjectMatch {
    pub fn matches(&self, subject: &str) -> bool {
        match self {
            SubjectMatch::Is(s) => subject == s,
            SubjectMatch::StartsWith(s) => subject.starts_with(s.as_str()),
            SubjectMatch::EndsWith(s) => subject.ends_with(s.as_str()),
        }
    }
}

pub trait RecordStore: Send {
    /// Stable identity of the backing store, independent of any live connection.
    fn location(&self) -> &str;
    fn connect(&mut self) -> Result<(), StoreError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;

    /// Largest id/value list accepted by one call.
    fn batch_limit(&self) -> usize {
        DEFAULT_BATCH_LIMIT
    }

    fn exists(&self, id: &str) -> Result<bool, StoreError>;
    fn get(&self, id: &str) -> Result<Option<Record>, StoreError>;
    /// Fails with [`StoreError::AlreadyExists`] when the id is taken.
    fn insert(&mut self, record: &Record) -> Result<(), StoreError>;
    /// Replaces the data fields present on `record`; fails if the id is unknown.
    fn update(&mut self, record: &Record) -> Result<(), StoreError>;
    /// Ids of `record_type` records whose scalar fields equal every filter.
    fn query(&self, record_type: &str, filters: &[(String, Value)]) -> Result<Vec<String>, StoreError>;
    fn ids_of_type(&self, record_type: &str) -> Result<Vec<String>, StoreError>;
    fn random_ids(&self, record_type: &str, count: usize) -> Result<Vec<String>, StoreError>;
    /// Scalar fields for each id that exists; absent fields are omitted.
    fn get_fields(
        &self,
        ids: &[String],
        fields: &[String],
    ) -> Result<BTreeMap<String, BTreeMap<String, Value>>, StoreError>;
    /// `(value, id)` pairs for every record whose scalar `field` is in `values`.
    fn find_by_values(&self, field: &str, values: &[Value]) -> Result<Vec<(Value, String)>, StoreError>;
    /// The ordered list field for each id that has one.
    fn get_list_field(&self, ids: &[String], field: &str) -> Result<BTreeMap<String, Vec<Value>>, StoreError>;
    fn insert_relationship(&mut self, subject: &str, predicate: &str, object: &str) -> Result<(), StoreError>;
    fn related_objects(&self, subject: &SubjectMatch, predicate: &str) -> Result<BTreeSet<String>, StoreError>;
}
