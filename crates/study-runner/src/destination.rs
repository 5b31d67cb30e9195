use anyhow::Context;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use study_core::layout::history_lock_path;
use study_core::precedence::{conflict, log_conflict};
use study_core::{
    atomic_write_yaml, precedence, ConflictKind, FileLock, HistoryDocument, LockError, Precedence, StudyLogEntry,
    StudyStatus,
};
use study_store::history::{append_study_entry, load_entry};
use study_store::{RecordStore, StoreError};
use tracing::debug;

/// Stable identity of a destination, independent of any live connection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DestinationKey(String);

impl DestinationKey {
    pub fn file(path: &Path) -> Self {
        Self(format!("file://{}", path.display()))
    }

    pub fn store(location: &str) -> Self {
        Self(format!("store:{}", location))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub written: usize,
    pub unchanged: usize,
    /// Entries outranked by what the destination already holds.
    pub stale: usize,
    /// Entries that clashed with a committed entry and were left out.
    pub conflicts: Vec<ConflictKind>,
    /// Clashes inside the batch itself, found while deduplicating it.
    pub batch_conflicts: Vec<ConflictKind>,
}

impl CommitReport {
    fn record(&mut self, action: MergeAction) {
        match action {
            MergeAction::Write => self.written += 1,
            MergeAction::Unchanged => self.unchanged += 1,
            MergeAction::Stale => self.stale += 1,
            MergeAction::Conflict(kind) => self.conflicts.push(kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    Write,
    Unchanged,
    Stale,
    Conflict(ConflictKind),
}

/// Decides whether `incoming` may replace what a destination holds.
/// Only a dominating entry overwrites a committed one.
pub fn merge_action(incoming: &StudyLogEntry, committed: Option<&StudyLogEntry>) -> MergeAction {
    let Some(committed) = committed else {
        return MergeAction::Write;
    };
    match precedence(incoming, committed) {
        Precedence::Dominates => MergeAction::Write,
        Precedence::Identical => MergeAction::Unchanged,
        Precedence::Neither => {
            if precedence(committed, incoming) == Precedence::Dominates {
                MergeAction::Stale
            } else {
                let kind = conflict(committed, incoming).unwrap_or(ConflictKind::Undecided);
                log_conflict("destination", kind, committed, incoming);
                MergeAction::Conflict(kind)
            }
        }
    }
}

/// A durable sink for study log entries.
pub trait LogDestination {
    fn key(&self) -> &DestinationKey;

    /// Merges `entries` into the destination, waiting at most `lock_timeout`
    /// for any lock it needs.
    fn commit(&mut self, entries: &[StudyLogEntry], lock_timeout: Duration) -> Result<CommitReport, CommitError>;

    /// Re-establishes a dropped backend connection.
    fn reconnect(&mut self) -> Result<(), CommitError> {
        Ok(())
    }

    /// Drops any live connection while the daemon sleeps.
    fn release(&mut self) {}
}

/// YAML history file guarded by a `.history.lock` next to it.
#[derive(Debug, Clone)]
pub struct YamlHistoryFile {
    key: DestinationKey,
    path: PathBuf,
    lock_path: PathBuf,
}

impl YamlHistoryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            key: DestinationKey::file(&path),
            lock_path: history_lock_path(&path),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self, lock_timeout: Duration) -> Result<HistoryDocument, CommitError> {
        let _guard = FileLock::acquire(&self.lock_path, lock_timeout)?;
        Ok(HistoryDocument::load(&self.path)?)
    }

    /// Whether `request_id` is logged here with exactly `status`.
    pub fn check_in_history(
        &self,
        request_id: &str,
        status: StudyStatus,
        lock_timeout: Duration,
    ) -> Result<bool, CommitError> {
        let doc = self.load(lock_timeout)?;
        Ok(doc.get(request_id).map(|e| e.status) == Some(status))
    }
}

impl LogDestination for YamlHistoryFile {
    fn key(&self) -> &DestinationKey {
        &self.key
    }

    fn commit(&mut self, entries: &[StudyLogEntry], lock_timeout: Duration) -> Result<CommitReport, CommitError> {
        let _guard = FileLock::acquire(&self.lock_path, lock_timeout)?;
        let mut doc = HistoryDocument::load(&self.path)?;
        let mut report = CommitReport::default();
        for entry in entries {
            let action = merge_action(entry, doc.history.get(&entry.request_id));
            if action == MergeAction::Write {
                doc.history.insert(entry.request_id.clone(), entry.clone());
            }
            report.record(action);
        }
        if report.written > 0 || !self.path.exists() {
            atomic_write_yaml(&self.path, &doc)
                .with_context(|| format!("failed writing history {}", self.path.display()))?;
        }
        debug!(destination = %self.key, ?report, "committed to history file");
        Ok(report)
    }
}

/// Record-store destination. Writes go through insert-or-update and are
/// skipped when the stored entry already outranks them.
pub struct RecordStoreDestination {
    key: DestinationKey,
    store: Box<dyn RecordStore>,
    requester: Option<String>,
    list_fields: Vec<String>,
}

impl RecordStoreDestination {
    pub fn new(store: Box<dyn RecordStore>, requester: Option<String>, list_fields: Vec<String>) -> Self {
        Self {
            key: DestinationKey::store(store.location()),
            store,
            requester,
            list_fields,
        }
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }
}

impl LogDestination for RecordStoreDestination {
    fn key(&self) -> &DestinationKey {
        &self.key
    }

    fn commit(&mut self, entries: &[StudyLogEntry], _lock_timeout: Duration) -> Result<CommitReport, CommitError> {
        if !self.store.is_connected() {
            return Err(StoreError::NotConnected(self.store.location().to_string()).into());
        }
        let mut report = CommitReport::default();
        for entry in entries {
            let committed = load_entry(self.store.as_ref(), &entry.request_id)?;
            let action = merge_action(entry, committed.as_ref());
            if action == MergeAction::Write {
                append_study_entry(self.store.as_mut(), entry, self.requester.as_deref(), &self.list_fields)?;
            }
            report.record(action);
        }
        debug!(destination = %self.key, ?report, "committed to record store");
        Ok(report)
    }

    fn reconnect(&mut self) -> Result<(), CommitError> {
        if !self.store.is_connected() {
            self.store.connect()?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.store.disconnect();
    }
}
