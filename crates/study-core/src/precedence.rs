//! Merge precedence between log entries that share a request id.
//!
//! Status rank dominates, and a present result dominates an absent one at any
//! rank. Entries whose descriptors disagree never dominate one another.

use crate::canonical_json_digest;
use crate::entry::StudyLogEntry;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence {
    Dominates,
    Identical,
    Neither,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Same request id logged with different descriptors.
    DescriptorMismatch,
    /// Same descriptors, neither entry dominates, and they differ.
    Undecided,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::DescriptorMismatch => "descriptor_mismatch",
            ConflictKind::Undecided => "undecided",
        }
    }
}

/// True iff `b` outranks `a` on status, or carries a result `a` lacks.
pub fn dominates(b: &StudyLogEntry, a: &StudyLogEntry) -> bool {
    b.status.rank() > a.status.rank() || (b.result.is_some() && a.result.is_none())
}

pub fn identical(a: &StudyLogEntry, b: &StudyLogEntry) -> bool {
    a.descriptors == b.descriptors && a.status == b.status && a.result == b.result
}

/// How `candidate` relates to `over` for the purpose of replacing it.
pub fn precedence(candidate: &StudyLogEntry, over: &StudyLogEntry) -> Precedence {
    if candidate.descriptors != over.descriptors {
        return Precedence::Neither;
    }
    if identical(candidate, over) {
        Precedence::Identical
    } else if dominates(candidate, over) {
        Precedence::Dominates
    } else {
        Precedence::Neither
    }
}

/// Classifies a pair that cannot be merged automatically, if it is one.
pub fn conflict(a: &StudyLogEntry, b: &StudyLogEntry) -> Option<ConflictKind> {
    if a.request_id != b.request_id {
        return None;
    }
    if a.descriptors != b.descriptors {
        return Some(ConflictKind::DescriptorMismatch);
    }
    match (precedence(a, b), precedence(b, a)) {
        (Precedence::Neither, Precedence::Neither) => Some(ConflictKind::Undecided),
        _ => None,
    }
}

pub fn log_conflict(context: &str, kind: ConflictKind, kept: &StudyLogEntry, other: &StudyLogEntry) {
    let kept_digest = serde_json::to_value(&kept.descriptors)
        .map(|v| canonical_json_digest(&v))
        .unwrap_or_default();
    let other_digest = serde_json::to_value(&other.descriptors)
        .map(|v| canonical_json_digest(&v))
        .unwrap_or_default();
    error!(
        context,
        request_id = %kept.request_id,
        conflict = kind.as_str(),
        kept_status = %kept.status,
        other_status = %other.status,
        kept_descriptors = %kept_digest,
        other_descriptors = %other_digest,
        "conflicting log entries; both retained"
    );
}

/// Result of [`dedup_entries`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deduped {
    pub entries: Vec<StudyLogEntry>,
    /// One per conflicting pair that was logged.
    pub conflicts: Vec<ConflictKind>,
}

/// Collapses entries sharing a request id down to the dominant one.
///
/// Identical entries keep the later copy. Conflicting entries are logged and
/// all of them survive.
pub fn dedup_entries(entries: Vec<StudyLogEntry>, context: &str) -> Deduped {
    let mut kept: Vec<StudyLogEntry> = Vec::with_capacity(entries.len());
    let mut conflicts = Vec::new();
    for entry in entries {
        let mut superseded = false;
        kept.retain(|prior| {
            if prior.request_id != entry.request_id {
                return true;
            }
            match precedence(&entry, prior) {
                Precedence::Dominates | Precedence::Identical => false,
                Precedence::Neither => {
                    if precedence(prior, &entry) == Precedence::Dominates {
                        superseded = true;
                    } else if let Some(kind) = conflict(prior, &entry) {
                        log_conflict(context, kind, prior, &entry);
                        conflicts.push(kind);
                    }
                    true
                }
            }
        });
        if !superseded {
            kept.push(entry);
        }
    }
    Deduped {
        entries: kept,
        conflicts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RunDescriptors;
    use crate::status::StudyStatus;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn descriptors(tag: &str) -> RunDescriptors {
        RunDescriptors::new("binding").with_parameter("TAG", json!([tag]))
    }

    fn entry(id: &str, status: StudyStatus, result: Option<i64>) -> StudyLogEntry {
        let mut e = StudyLogEntry::new(id, descriptors("a"), status);
        e.result = result.map(|x| BTreeMap::from([("x".to_string(), json!(x))]));
        e
    }

    #[test]
    fn status_rank_dominates() {
        let running = entry("r1", StudyStatus::Running, None);
        let finished = entry("r1", StudyStatus::Finished, None);
        assert!(dominates(&finished, &running));
        assert!(!dominates(&running, &finished));
        assert_eq!(precedence(&finished, &running), Precedence::Dominates);
        assert_eq!(precedence(&running, &finished), Precedence::Neither);
    }

    #[test]
    fn result_presence_dominates_regardless_of_rank() {
        let failed = entry("r1", StudyStatus::Failed, None);
        let finished_with_result = entry("r1", StudyStatus::Finished, Some(1));
        assert!(dominates(&finished_with_result, &failed));
        assert!(dominates(&failed, &finished_with_result));
    }

    #[test]
    fn identical_requires_equal_result() {
        let a = entry("r1", StudyStatus::Finished, Some(1));
        let b = entry("r1", StudyStatus::Finished, Some(1));
        let c = entry("r1", StudyStatus::Finished, Some(2));
        assert!(identical(&a, &b));
        assert_eq!(precedence(&a, &b), Precedence::Identical);
        assert!(!identical(&a, &c));
        assert_eq!(conflict(&a, &c), Some(ConflictKind::Undecided));
        assert_eq!(conflict(&a, &b), None);
    }

    #[test]
    fn descriptor_mismatch_never_dominates() {
        let running = entry("r2", StudyStatus::Running, None);
        let mut finished = entry("r2", StudyStatus::Finished, Some(1));
        finished.descriptors = descriptors("b");
        assert_eq!(precedence(&finished, &running), Precedence::Neither);
        assert_eq!(conflict(&finished, &running), Some(ConflictKind::DescriptorMismatch));
    }

    #[test]
    fn dedup_keeps_dominant_entry_per_request() {
        let deduped = dedup_entries(
            vec![
                entry("r1", StudyStatus::Running, None),
                entry("r2", StudyStatus::Running, None),
                entry("r1", StudyStatus::Finished, Some(1)),
                entry("r1", StudyStatus::Running, None),
            ],
            "test",
        );
        assert_eq!(
            deduped.entries,
            vec![
                entry("r2", StudyStatus::Running, None),
                entry("r1", StudyStatus::Finished, Some(1)),
            ]
        );
        assert!(deduped.conflicts.is_empty());
    }

    #[test]
    fn dedup_retains_both_sides_of_a_conflict() {
        let a = entry("r2", StudyStatus::Running, None);
        let mut b = entry("r2", StudyStatus::Running, None);
        b.descriptors = descriptors("b");
        let deduped = dedup_entries(vec![a.clone(), b.clone()], "test");
        assert_eq!(deduped.entries, vec![a, b]);
        assert_eq!(deduped.conflicts, vec![ConflictKind::DescriptorMismatch]);
    }

    #[test]
    fn dedup_reports_undecided_results() {
        let a = entry("r1", StudyStatus::Finished, Some(1));
        let b = entry("r1", StudyStatus::Finished, Some(2));
        let deduped = dedup_entries(vec![a.clone(), b.clone()], "test");
        assert_eq!(deduped.entries, vec![a, b]);
        assert_eq!(deduped.conflicts, vec![ConflictKind::Undecided]);
    }

    #[test]
    fn dedup_mutual_dominance_keeps_later_entry() {
        let failed = entry("r1", StudyStatus::Failed, None);
        let finished = entry("r1", StudyStatus::Finished, Some(1));
        assert_eq!(
            dedup_entries(vec![finished.clone(), failed.clone()], "test").entries,
            vec![failed.clone()]
        );
        assert_eq!(
            dedup_entries(vec![failed, finished.clone()], "test").entries,
            vec![finished]
        );
    }
}
