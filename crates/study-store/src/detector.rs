//! Funnel filter deciding whether proposed studies were already run.
//!
//! Rounds run cheapest first: requester scoping, a value-in-set probe on the
//! equality keys, a scalar confirmation on status and secondary fields, and
//! finally an ordered comparison of one list-valued field.

use crate::{RecordStore, StoreError, SubjectMatch, REQUESTS_PREDICATE, STATUS_FIELD};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use study_core::{canonical_json, StudyRequest, StudyStatus};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunCheck {
    /// No matching record; safe to run.
    NotRun,
    /// Matches this existing request id.
    AlreadyRun(String),
    /// Resolution stopped early; treat as possibly existing.
    Unknown,
}

impl RunCheck {
    pub fn is_not_run(&self) -> bool {
        matches!(self, RunCheck::NotRun)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("candidate {request_id} has no value for equality key {key}")]
    MissingEqualityKey { request_id: String, key: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Field names used by each round.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateCriteria {
    pub primary_key: String,
    pub fallback_key: String,
    pub secondary_fields: Vec<String>,
    pub list_field: Option<String>,
}

impl Default for DuplicateCriteria {
    fn default() -> Self {
        Self {
            primary_key: "SEQUENCE_HASH".to_string(),
            fallback_key: "FASTA_HASH".to_string(),
            secondary_fields: vec![
                "MASTER_FASTA_HASH".to_string(),
                "STRUCTURE_HASH".to_string(),
                study_core::request::STUDY_TYPE_FIELD.to_string(),
            ],
            list_field: Some("CHAINS_IN_STRUCT".to_string()),
        }
    }
}

impl DuplicateCriteria {
    /// Fields that must never be unwrapped from single-element lists.
    pub fn list_fields(&self) -> Vec<String> {
        self.list_field.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DuplicateStudyDetector {
    criteria: DuplicateCriteria,
}

type ValueIndex = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

impl DuplicateStudyDetector {
    pub fn new(criteria: DuplicateCriteria) -> Self {
        Self { criteria }
    }

    pub fn criteria(&self) -> &DuplicateCriteria {
        &self.criteria
    }

    /// One result per candidate, in order.
    ///
    /// `quit_at` defaults to the number of candidates. Once that many
    /// candidates are known not to have run, every unresolved candidate is
    /// reported as [`RunCheck::Unknown`].
    pub fn study_has_been_run(
        &self,
        store: &dyn RecordStore,
        candidates: &[StudyRequest],
        requester_scope: Option<&SubjectMatch>,
        quit_at: Option<usize>,
        equality_keys: Option<&[String]>,
    ) -> Result<Vec<RunCheck>, DetectorError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let keys_per_candidate = self.equality_keys_for(candidates, equality_keys)?;

        let scope = match requester_scope {
            Some(subject) => {
                let ids = store.related_objects(subject, REQUESTS_PREDICATE)?;
                if ids.is_empty() {
                    debug!(?subject, "requester has no prior requests; nothing can be a duplicate");
                    return Ok(vec![RunCheck::NotRun; candidates.len()]);
                }
                Some(ids)
            }
            None => None,
        };

        let index = self.probe_values(store, candidates, &keys_per_candidate, scope.as_ref())?;
        let mut existing_to_candidates: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut checks: Vec<Option<RunCheck>> = vec![None; candidates.len()];
        for (idx, (candidate, keys)) in candidates.iter().zip(&keys_per_candidate).enumerate() {
            let matches = intersect_matches(&index, candidate, keys);
            if matches.is_empty() {
                checks[idx] = Some(RunCheck::NotRun);
            }
            for existing in matches {
                existing_to_candidates.entry(existing).or_default().push(idx);
            }
        }

        let not_run = checks.iter().filter(|c| c.is_some()).count();
        let quit_at = quit_at.unwrap_or(candidates.len());
        if not_run >= quit_at {
            debug!(not_run, quit_at, "early exit after value probe");
            return Ok(checks
                .into_iter()
                .map(|c| c.unwrap_or(RunCheck::Unknown))
                .collect());
        }

        let confirmed = self.confirm_secondary(store, candidates, existing_to_candidates)?;
        let duplicates = self.confirm_list_field(store, candidates, confirmed)?;

        Ok(checks
            .into_iter()
            .enumerate()
            .map(|(idx, check)| match check {
                Some(check) => check,
                None => match duplicates.get(&idx) {
                    Some(existing) => RunCheck::AlreadyRun(existing.clone()),
                    None => RunCheck::NotRun,
                },
            })
            .collect())
    }

    fn equality_keys_for(
        &self,
        candidates: &[StudyRequest],
        equality_keys: Option<&[String]>,
    ) -> Result<Vec<Vec<String>>, DetectorError> {
        candidates
            .iter()
            .map(|candidate| match equality_keys {
                Some(keys) => {
                    for key in keys {
                        if !candidate.has_field(key) {
                            return Err(DetectorError::MissingEqualityKey {
                                request_id: candidate.request_id.clone(),
                                key: key.clone(),
                            });
                        }
                    }
                    Ok(keys.to_vec())
                }
                None => {
                    if candidate.has_field(&self.criteria.primary_key) {
                        Ok(vec![self.criteria.primary_key.clone()])
                    } else if candidate.has_field(&self.criteria.fallback_key) {
                        Ok(vec![self.criteria.fallback_key.clone()])
                    } else {
                        Err(DetectorError::MissingEqualityKey {
                            request_id: candidate.request_id.clone(),
                            key: self.criteria.primary_key.clone(),
                        })
                    }
                }
            })
            .collect()
    }

    /// Builds `key -> value -> {existing ids}` from chunked value-in-set queries.
    fn probe_values(
        &self,
        store: &dyn RecordStore,
        candidates: &[StudyRequest],
        keys_per_candidate: &[Vec<String>],
        scope: Option<&BTreeSet<String>>,
    ) -> Result<ValueIndex, DetectorError> {
        let mut wanted: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        for (candidate, keys) in candidates.iter().zip(keys_per_candidate) {
            for key in keys {
                if let Some(value) = candidate.field(key) {
                    wanted
                        .entry(key.clone())
                        .or_default()
                        .insert(canonical_json(&value), value);
                }
            }
        }

        let batch = store.batch_limit().max(1);
        let mut index: ValueIndex = BTreeMap::new();
        for (key, values) in wanted {
            let values: Vec<Value> = values.into_values().collect();
            let found = index.entry(key.clone()).or_default();
            for chunk in values.chunks(batch) {
                for (value, id) in store.find_by_values(&key, chunk)? {
                    if scope.map_or(true, |ids| ids.contains(&id)) {
                        found.entry(canonical_json(&value)).or_default().insert(id);
                    }
                }
            }
        }
        Ok(index)
    }

    /// Keeps `(existing, candidate)` pairs whose existing record counts as run
    /// and agrees on every secondary field.
    fn confirm_secondary(
        &self,
        store: &dyn RecordStore,
        candidates: &[StudyRequest],
        existing_to_candidates: BTreeMap<String, Vec<usize>>,
    ) -> Result<BTreeMap<String, Vec<usize>>, DetectorError> {
        let mut fields = vec![STATUS_FIELD.to_string()];
        fields.extend(self.criteria.secondary_fields.iter().cloned());
        let batch = store.batch_limit().saturating_sub(fields.len()).max(1);

        let existing_ids: Vec<String> = existing_to_candidates.keys().cloned().collect();
        let mut confirmed: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for chunk in existing_ids.chunks(batch) {
            let fetched = store.get_fields(chunk, &fields)?;
            for existing in chunk {
                let Some(data) = fetched.get(existing) else {
                    continue;
                };
                let counts = data
                    .get(STATUS_FIELD)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<StudyStatus>().ok())
                    .map_or(false, |s| s.counts_as_run());
                if !counts {
                    continue;
                }
                for &idx in existing_to_candidates.get(existing).into_iter().flatten() {
                    let agrees = self
                        .criteria
                        .secondary_fields
                        .iter()
                        .all(|f| candidates[idx].field(f).as_ref() == data.get(f));
                    if agrees {
                        confirmed.entry(existing.clone()).or_default().push(idx);
                    }
                }
            }
        }
        Ok(confirmed)
    }

    /// Final round: exact ordered equality of the list field. Returns the
    /// first matching existing id per candidate index.
    fn confirm_list_field(
        &self,
        store: &dyn RecordStore,
        candidates: &[StudyRequest],
        confirmed: BTreeMap<String, Vec<usize>>,
    ) -> Result<BTreeMap<usize, String>, DetectorError> {
        let mut duplicates: BTreeMap<usize, String> = BTreeMap::new();
        let Some(list_field) = &self.criteria.list_field else {
            for (existing, idxs) in confirmed {
                for idx in idxs {
                    duplicates.entry(idx).or_insert_with(|| existing.clone());
                }
            }
            return Ok(duplicates);
        };

        let batch = store.batch_limit().max(1);
        let existing_ids: Vec<String> = confirmed.keys().cloned().collect();
        for chunk in existing_ids.chunks(batch) {
            let lists = store.get_list_field(chunk, list_field)?;
            for existing in chunk {
                // Records without list rows never match.
                let Some(existing_list) = lists.get(existing) else {
                    debug!(existing = %existing, field = %list_field, "existing record has no list data");
                    continue;
                };
                for &idx in confirmed.get(existing).into_iter().flatten() {
                    let candidate_list = match candidates[idx].field(list_field) {
                        Some(Value::Array(items)) => items,
                        Some(other) => vec![other],
                        None => Vec::new(),
                    };
                    if &candidate_list == existing_list {
                        duplicates.entry(idx).or_insert_with(|| existing.clone());
                    }
                }
            }
        }
        Ok(duplicates)
    }
}

fn intersect_matches(index: &ValueIndex, candidate: &StudyRequest, keys: &[String]) -> BTreeSet<String> {
    let mut result: Option<BTreeSet<String>> = None;
    for key in keys {
        let ids = candidate
            .field(key)
            .and_then(|value| index.get(key).and_then(|values| values.get(&canonical_json(&value))))
            .cloned()
            .unwrap_or_default();
        result = Some(match result {
            Some(acc) => acc.intersection(&ids).cloned().collect(),
            None => ids,
        });
        if result.as_ref().map_or(false, |r| r.is_empty()) {
            break;
        }
    }
    result.unwrap_or_default()
}
