//! Per-destination pending queues and the merge-then-commit flush.

use crate::destination::{CommitError, CommitReport, DestinationKey, LogDestination};
use std::collections::BTreeMap;
use std::time::Duration;
use study_core::{dedup_entries, precedence, Precedence, StudyLogEntry};
use tracing::{debug, warn};

/// Entries whose commit failed, keyed by destination identity. Survives
/// reconnects because the key does not depend on a live connection.
#[derive(Debug, Default)]
pub struct LogReconciler {
    pending: BTreeMap<DestinationKey, Vec<StudyLogEntry>>,
}

impl LogReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, key: &DestinationKey) -> &[StudyLogEntry] {
        self.pending.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_pending(&self) -> bool {
        self.pending.values().any(|entries| !entries.is_empty())
    }

    pub fn pending_keys(&self) -> Vec<DestinationKey> {
        self.pending
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Merges `incoming` with whatever is still pending for `destination` and
    /// commits the result. On failure the merged batch becomes the new
    /// pending queue; nothing is lost and nothing is committed twice in
    /// conflicting form.
    pub fn reconcile_and_flush(
        &mut self,
        destination: &mut dyn LogDestination,
        incoming: Vec<StudyLogEntry>,
        lock_timeout: Duration,
    ) -> Result<CommitReport, CommitError> {
        let key = destination.key().clone();
        let pending = self.pending.remove(&key).unwrap_or_default();

        let carried: Vec<StudyLogEntry> = pending
            .into_iter()
            .filter(|p| {
                !incoming.iter().any(|i| {
                    i.request_id == p.request_id
                        && matches!(precedence(i, p), Precedence::Dominates | Precedence::Identical)
                })
            })
            .collect();
        let pending = dedup_entries(carried, "pending");
        let incoming = dedup_entries(incoming, "incoming");
        let mut batch = pending.entries;
        batch.extend(incoming.entries);
        let mut batch_conflicts = pending.conflicts;
        batch_conflicts.extend(incoming.conflicts);

        if batch.is_empty() {
            return Ok(CommitReport::default());
        }

        match destination.commit(&batch, lock_timeout) {
            Ok(mut report) => {
                debug!(destination = %key, entries = batch.len(), "flushed log entries");
                report.batch_conflicts = batch_conflicts;
                Ok(report)
            }
            Err(err) => {
                warn!(destination = %key, entries = batch.len(), error = %err, "commit failed, entries deferred");
                self.pending.insert(key, batch);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{merge_action, MergeAction, YamlHistoryFile};
    use crate::test_support::TempDirGuard;
    use serde_json::json;
    use std::collections::BTreeMap;
    use study_core::{ConflictKind, FileLock, RunDescriptors, StudyStatus};

    /// In-memory destination that records every batch it was handed.
    struct RecordingDestination {
        key: DestinationKey,
        committed: BTreeMap<String, StudyLogEntry>,
        batches: Vec<Vec<StudyLogEntry>>,
        fail: bool,
    }

    impl RecordingDestination {
        fn new() -> Self {
            Self {
                key: DestinationKey::store("memory"),
                committed: BTreeMap::new(),
                batches: Vec::new(),
                fail: false,
            }
        }
    }

    impl LogDestination for RecordingDestination {
        fn key(&self) -> &DestinationKey {
            &self.key
        }

        fn commit(&mut self, entries: &[StudyLogEntry], _lock_timeout: Duration) -> Result<CommitReport, CommitError> {
            self.batches.push(entries.to_vec());
            if self.fail {
                return Err(CommitError::Io(anyhow::anyhow!("backend unavailable")));
            }
            for entry in entries {
                if merge_action(entry, self.committed.get(&entry.request_id)) == MergeAction::Write {
                    self.committed.insert(entry.request_id.clone(), entry.clone());
                }
            }
            Ok(CommitReport::default())
        }
    }

    fn descriptors() -> RunDescriptors {
        RunDescriptors::new("binding").with_parameter("SEQUENCE_HASH", json!(["h", "md5"]))
    }

    fn entry(id: &str, status: StudyStatus, result: Option<i64>) -> StudyLogEntry {
        let mut e = StudyLogEntry::new(id, descriptors(), status);
        e.result = result.map(|x| BTreeMap::from([("x".to_string(), json!(x))]));
        e
    }

    #[test]
    fn running_then_finished_converges_and_is_idempotent() {
        let tmp = TempDirGuard::new("study_runner_reconcile_converge");
        let mut file = YamlHistoryFile::new(tmp.path.join("history.yaml"));
        let mut reconciler = LogReconciler::new();
        let timeout = Duration::from_secs(1);

        reconciler
            .reconcile_and_flush(&mut file, vec![entry("r1", StudyStatus::Running, None)], timeout)
            .expect("running");
        reconciler
            .reconcile_and_flush(&mut file, vec![entry("r1", StudyStatus::Finished, Some(1))], timeout)
            .expect("finished");
        let first = std::fs::read_to_string(file.path()).expect("read");

        reconciler
            .reconcile_and_flush(&mut file, vec![entry("r1", StudyStatus::Finished, Some(1))], timeout)
            .expect("again");
        let second = std::fs::read_to_string(file.path()).expect("read");
        assert_eq!(first, second);

        let doc = file.load(timeout).expect("load");
        assert_eq!(doc.history.len(), 1);
        assert_eq!(doc.get("r1"), Some(&entry("r1", StudyStatus::Finished, Some(1))));
        assert!(!reconciler.has_pending());
    }

    #[test]
    fn late_running_never_regresses_finished() {
        let tmp = TempDirGuard::new("study_runner_reconcile_regress");
        let mut file = YamlHistoryFile::new(tmp.path.join("history.yaml"));
        let mut reconciler = LogReconciler::new();
        let timeout = Duration::from_secs(1);
        reconciler
            .reconcile_and_flush(&mut file, vec![entry("r1", StudyStatus::Finished, Some(1))], timeout)
            .expect("finished");
        reconciler
            .reconcile_and_flush(&mut file, vec![entry("r1", StudyStatus::Running, None)], timeout)
            .expect("running");
        let doc = file.load(timeout).expect("load");
        assert_eq!(doc.get("r1").map(|e| e.status), Some(StudyStatus::Finished));
    }

    #[test]
    fn failed_commit_is_deferred_and_superseded_entries_pruned() {
        let tmp = TempDirGuard::new("study_runner_reconcile_defer");
        let mut file = YamlHistoryFile::new(tmp.path.join("history.yaml"));
        let mut reconciler = LogReconciler::new();
        let short = Duration::from_millis(60);

        let held = FileLock::acquire(&tmp.path.join(".history.lock"), Duration::from_secs(1)).expect("hold");
        reconciler
            .reconcile_and_flush(&mut file, vec![entry("r1", StudyStatus::Running, None)], short)
            .expect_err("locked");
        assert_eq!(reconciler.pending(file.key()), &[entry("r1", StudyStatus::Running, None)]);

        reconciler
            .reconcile_and_flush(
                &mut file,
                vec![entry("r1", StudyStatus::Finished, Some(1)), entry("r2", StudyStatus::Running, None)],
                short,
            )
            .expect_err("still locked");
        assert_eq!(
            reconciler.pending(file.key()),
            &[entry("r1", StudyStatus::Finished, Some(1)), entry("r2", StudyStatus::Running, None)]
        );
        drop(held);

        reconciler
            .reconcile_and_flush(&mut file, Vec::new(), short)
            .expect("drained");
        assert!(!reconciler.has_pending());
        let doc = file.load(short).expect("load");
        assert_eq!(doc.get("r1").map(|e| e.status), Some(StudyStatus::Finished));
        assert_eq!(doc.get("r2").map(|e| e.status), Some(StudyStatus::Running));
    }

    #[test]
    fn conflicting_entries_reach_the_destination_together() {
        let mut dest = RecordingDestination::new();
        let mut reconciler = LogReconciler::new();
        let a = entry("r1", StudyStatus::Finished, Some(1));
        let b = entry("r1", StudyStatus::Finished, Some(2));
        let report = reconciler
            .reconcile_and_flush(&mut dest, vec![a.clone(), b.clone()], Duration::from_secs(1))
            .expect("commit");
        assert_eq!(report.batch_conflicts, vec![ConflictKind::Undecided]);
        assert_eq!(dest.batches, vec![vec![a.clone(), b]]);
        assert_eq!(dest.committed.get("r1"), Some(&a));
    }

    #[test]
    fn descriptor_mismatch_keeps_both_and_first_commit_stands() {
        let tmp = TempDirGuard::new("study_runner_reconcile_mismatch");
        let mut file = YamlHistoryFile::new(tmp.path.join("history.yaml"));
        let mut reconciler = LogReconciler::new();
        let a = entry("r2", StudyStatus::Finished, Some(1));
        let mut b = a.clone();
        b.descriptors = RunDescriptors::new("folding").with_parameter("SEQUENCE_HASH", json!(["h", "md5"]));

        let report = reconciler
            .reconcile_and_flush(&mut file, vec![a.clone(), b], Duration::from_secs(1))
            .expect("commit");
        assert_eq!(report.written, 1);
        assert_eq!(report.batch_conflicts, vec![ConflictKind::DescriptorMismatch]);
        assert_eq!(report.conflicts, vec![ConflictKind::DescriptorMismatch]);
        let doc = file.load(Duration::from_secs(1)).expect("load");
        assert_eq!(doc.get("r2"), Some(&a));
    }

    #[test]
    fn empty_batch_skips_the_destination() {
        let mut dest = RecordingDestination::new();
        let mut reconciler = LogReconciler::new();
        reconciler
            .reconcile_and_flush(&mut dest, Vec::new(), Duration::from_secs(1))
            .expect("noop");
        assert!(dest.batches.is_empty());
    }

    #[test]
    fn pending_survives_until_backend_recovers() {
        let mut dest = RecordingDestination::new();
        dest.fail = true;
        let mut reconciler = LogReconciler::new();
        let timeout = Duration::from_secs(1);
        reconciler
            .reconcile_and_flush(&mut dest, vec![entry("r1", StudyStatus::Running, None)], timeout)
            .expect_err("down");
        assert_eq!(reconciler.pending_keys(), vec![dest.key.clone()]);
        dest.fail = false;
        reconciler
            .reconcile_and_flush(&mut dest, vec![entry("r2", StudyStatus::Running, None)], timeout)
            .expect("up");
        assert_eq!(dest.committed.len(), 2);
        assert!(reconciler.pending_keys().is_empty());
    }
}
