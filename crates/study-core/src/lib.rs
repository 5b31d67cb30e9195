use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

pub mod entry;
pub mod layout;
pub mod lock;
pub mod precedence;
pub mod request;
pub mod status;

pub use entry::{HistoryDocument, StudyLogEntry, StudyResult};
pub use layout::{worker_layout, WorkerLayout};
pub use lock::{FileLock, FileLockGuard, LockError};
pub use precedence::{conflict, dedup_entries, dominates, identical, precedence, ConflictKind, Deduped, Precedence};
pub use request::{read_study_file, RunDescriptors, StudyRequest};
pub use status::StudyStatus;

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s)),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let parts: Vec<String> = pairs
                .into_iter()
                .map(|(k, v)| {
                    let ks = serde_json::to_string(k).unwrap_or_else(|_| format!("\"{}\"", k));
                    format!("{}:{}", ks, canonical_json(v))
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes through a sibling temp file and renames it into place.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_yaml::to_string(value)?;
    atomic_write_bytes(path, text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"d": [1, 2], "c": "x"}});
        let b = json!({"a": {"c": "x", "d": [1, 2]}, "b": 1});
        assert_eq!(canonical_json(&a), r#"{"a":{"c":"x","d":[1,2]},"b":1}"#);
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
        assert!(canonical_json_digest(&a).starts_with("sha256:"));
    }

    #[test]
    fn atomic_write_replaces_contents_without_leaving_temp_files() {
        let dir = std::env::temp_dir().join(format!(
            "study_core_atomic_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = dir.join("history.yaml");
        atomic_write_bytes(&path, b"first").expect("first");
        atomic_write_yaml(&path, &json!({"history": {}})).expect("second");
        assert_eq!(fs::read_to_string(&path).expect("read").trim(), "history: {}");
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(&dir);
    }
}
