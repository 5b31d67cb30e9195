use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const STUDY_TYPE_FIELD: &str = "study_type";

/// The immutable type and parameter payload identifying what a request represents.
///
/// Keys other than `study_type` and `study_parameters` are carried through
/// untouched so that history files round-trip whatever the requester wrote.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunDescriptors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_type: Option<String>,
    #[serde(default)]
    pub study_parameters: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RunDescriptors {
    pub fn new(study_type: impl Into<String>) -> Self {
        Self {
            study_type: Some(study_type.into()),
            ..Self::default()
        }
    }

    /// Adds a parameter in study-file form, `{values: ...}`.
    pub fn with_parameter(mut self, name: impl Into<String>, values: Value) -> Self {
        let mut entry = serde_json::Map::new();
        entry.insert("values".to_string(), values);
        self.study_parameters
            .insert(name.into(), Value::Object(entry));
        self
    }

    /// Directory name used for a run of this study under the workspace.
    pub fn run_dir_name(&self, request_id: &str) -> String {
        match self.study_type.as_deref() {
            Some(study_type) if !study_type.is_empty() => format!("{}_{}", study_type, request_id),
            _ => format!("req_{}", request_id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StudyFile {
    description: StudyDescription,
}

#[derive(Debug, Deserialize)]
struct StudyDescription {
    name: String,
    run_descriptors: RunDescriptors,
}

/// Reads `(request_id, descriptors)` from a study descriptor file.
pub fn read_study_file(path: &Path) -> Result<(String, RunDescriptors)> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading study file {}", path.display()))?;
    let study: StudyFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("invalid study file {}", path.display()))?;
    let request_id = study.description.name.trim().to_string();
    if request_id.is_empty() {
        return Err(anyhow!(
            "study file {} has an empty description.name",
            path.display()
        ));
    }
    Ok((request_id, study.description.run_descriptors))
}

/// A study request flattened into the scalar/list fields duplicate checks compare.
#[derive(Debug, Clone, PartialEq)]
pub struct StudyRequest {
    pub request_id: String,
    pub study_type: String,
    pub parameters: BTreeMap<String, Value>,
    pub requester: Option<String>,
}

impl StudyRequest {
    /// Flattens study-file parameters.
    ///
    /// Single-element lists are unwrapped unless the parameter is listed in
    /// `list_fields`; `*_HASH` and `*_HASH_<n>` parameters given as
    /// `[value, algorithm]` keep only the value.
    pub fn from_descriptors(
        request_id: impl Into<String>,
        descriptors: &RunDescriptors,
        requester: Option<String>,
        list_fields: &[String],
    ) -> Self {
        let mut parameters = BTreeMap::new();
        for (name, entry) in &descriptors.study_parameters {
            let raw = match entry {
                Value::Object(map) => map.get("values").cloned().unwrap_or(Value::Null),
                other => other.clone(),
            };
            let mut value = if list_fields.iter().any(|f| f == name) {
                raw
            } else {
                delist(raw)
            };
            if is_hash_parameter(name) {
                if let Value::Array(items) = &value {
                    if let Some(first) = items.first() {
                        value = first.clone();
                    }
                }
            }
            parameters.insert(name.clone(), value);
        }
        Self {
            request_id: request_id.into(),
            study_type: descriptors.study_type.clone().unwrap_or_default(),
            parameters,
            requester,
        }
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        if name == STUDY_TYPE_FIELD {
            return Some(Value::String(self.study_type.clone()));
        }
        self.parameters.get(name).cloned()
    }

    pub fn has_field(&self, name: &str) -> bool {
        name == STUDY_TYPE_FIELD || self.parameters.contains_key(name)
    }
}

fn delist(value: Value) -> Value {
    match value {
        Value::Array(mut items) if items.len() == 1 => items.remove(0),
        other => other,
    }
}

fn is_hash_parameter(name: &str) -> bool {
    let parts: Vec<&str> = name.split('_').collect();
    matches!(parts.as_slice(), [.., "HASH"] | [.., "HASH", _])
}
