use crate::request::RunDescriptors;
use crate::status::StudyStatus;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub type StudyResult = BTreeMap<String, Value>;

/// One status observation for a request, as written to a log destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyLogEntry {
    #[serde(default)]
    pub request_id: String,
    #[serde(flatten)]
    pub descriptors: RunDescriptors,
    pub status: StudyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StudyResult>,
}

impl StudyLogEntry {
    pub fn new(request_id: impl Into<String>, descriptors: RunDescriptors, status: StudyStatus) -> Self {
        Self {
            request_id: request_id.into(),
            descriptors,
            status,
            result: None,
        }
    }

    /// Attaches a result; only terminal statuses may carry one.
    pub fn with_result(mut self, result: StudyResult) -> Result<Self> {
        if !self.status.is_terminal() {
            return Err(anyhow!(
                "result attached to non-terminal status {} for {}",
                self.status,
                self.request_id
            ));
        }
        self.result = Some(result);
        Ok(self)
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }
}

/// On-disk shape of a history file: `history: {request_id: entry}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryDocument {
    #[serde(default)]
    pub history: BTreeMap<String, StudyLogEntry>,
}

impl HistoryDocument {
    /// Loads a history file; a missing or empty file is an empty history.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading history {}", path.display()))
            }
        };
        Self::parse(&raw).with_context(|| format!("invalid history file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: serde_yaml::Value = serde_yaml::from_str(raw)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        let mut doc: HistoryDocument = serde_yaml::from_value(value)?;
        for (key, entry) in doc.history.iter_mut() {
            if entry.request_id.is_empty() {
                entry.request_id = key.clone();
            }
        }
        Ok(doc)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn get(&self, request_id: &str) -> Option<&StudyLogEntry> {
        self.history.get(request_id)
    }
}
