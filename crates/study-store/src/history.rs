//! Study history kept in a record store.

use crate::detector::{DetectorError, DuplicateStudyDetector, RunCheck};
use crate::{
    result_record_id, Record, RecordStore, StoreError, SubjectMatch, REQUESTS_PREDICATE, REQUEST_TYPE,
    STATUS_FIELD, YIELDS_PREDICATE,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::thread;
use study_core::{HistoryDocument, StudyLogEntry, StudyRequest, StudyResult, StudyStatus};
use tracing::{debug, info};

/// Inserts or updates the request record for `entry`.
///
/// A first insert also records `requester -requests-> request_id`; a result
/// is stored as `<request_id>_result` linked by `yields`.
pub fn append_study_entry(
    store: &mut dyn RecordStore,
    entry: &StudyLogEntry,
    requester: Option<&str>,
    list_fields: &[String],
) -> Result<(), StoreError> {
    debug!(request_id = %entry.request_id, status = %entry.status, store = store.location(), "appending study entry");
    let record = Record::request_from_entry(entry, list_fields)?;
    if store.exists(&entry.request_id)? {
        store.update(&record)?;
    } else {
        match store.insert(&record) {
            Ok(()) => {
                if let Some(requester) = requester.filter(|r| !r.is_empty()) {
                    store.insert_relationship(requester, REQUESTS_PREDICATE, &entry.request_id)?;
                }
            }
            // Another writer inserted first; fall through to the update branch.
            Err(StoreError::AlreadyExists(_)) => store.update(&record)?,
            Err(err) => return Err(err),
        }
    }
    if let Some(result) = &entry.result {
        set_result(store, &entry.request_id, result)?;
    }
    Ok(())
}

pub fn set_result(store: &mut dyn RecordStore, request_id: &str, result: &StudyResult) -> Result<(), StoreError> {
    let record = Record::result_from_entry(request_id, result);
    if store.exists(&record.id)? {
        store.update(&record)?;
    } else {
        store.insert(&record)?;
    }
    store.insert_relationship(request_id, YIELDS_PREDICATE, &record.id)
}

/// Rebuilds the log entry for a stored request, including any result.
pub fn load_entry(store: &dyn RecordStore, request_id: &str) -> Result<Option<StudyLogEntry>, StoreError> {
    let Some(record) = store.get(request_id)? else {
        return Ok(None);
    };
    let status = record.status().ok_or_else(|| StoreError::Malformed {
        id: request_id.to_string(),
        detail: "missing or unknown status".to_string(),
    })?;
    let descriptors = record.run_descriptors()?;
    let result = store
        .get(&result_record_id(request_id))?
        .map(|r| r.result_values());
    Ok(Some(StudyLogEntry {
        request_id: request_id.to_string(),
        descriptors,
        status,
        result,
    }))
}

/// Whether `request_id` is stored with exactly `status`.
pub fn check_in_history(store: &dyn RecordStore, request_id: &str, status: StudyStatus) -> Result<bool, StoreError> {
    let found = store.get_fields(&[request_id.to_string()], &[STATUS_FIELD.to_string()])?;
    Ok(found
        .get(request_id)
        .and_then(|fields| fields.get(STATUS_FIELD))
        .and_then(|v| v.as_str())
        == Some(status.as_str()))
}

/// Marks every stored RUNNING request as FAILED. Used after a crash left
/// records that no daemon will ever finish.
pub fn fail_running(store: &mut dyn RecordStore) -> Result<Vec<String>, StoreError> {
    let running = store.query(
        REQUEST_TYPE,
        &[(STATUS_FIELD.to_string(), Value::String(StudyStatus::Running.as_str().to_string()))],
    )?;
    for id in &running {
        let patch = Record::new(id, REQUEST_TYPE)
            .with_datum(STATUS_FIELD, Value::String(StudyStatus::Failed.as_str().to_string()));
        store.update(&patch)?;
    }
    info!(count = running.len(), store = store.location(), "marked running requests failed");
    Ok(running)
}

/// Narrowing applied before reading history out of a store.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub study_type: Option<String>,
    pub structure_hash: Option<String>,
    pub requester: Option<SubjectMatch>,
    /// Sample at most this many requests from whatever pool the filters leave.
    pub random: Option<usize>,
}

pub fn select_request_ids(store: &dyn RecordStore, query: &HistoryQuery) -> Result<Vec<String>, StoreError> {
    let mut filters = Vec::new();
    if let Some(study_type) = &query.study_type {
        filters.push((
            study_core::request::STUDY_TYPE_FIELD.to_string(),
            Value::String(study_type.clone()),
        ));
    }
    if let Some(hash) = &query.structure_hash {
        filters.push(("STRUCTURE_HASH".to_string(), Value::String(hash.clone())));
    }
    let filtered = query.study_type.is_some() || query.structure_hash.is_some() || query.requester.is_some();

    let mut pool = if filters.is_empty() {
        None
    } else {
        Some(store.query(REQUEST_TYPE, &filters)?)
    };
    if let Some(requester) = &query.requester {
        let requested = store.related_objects(requester, REQUESTS_PREDICATE)?;
        pool = Some(match pool {
            Some(ids) => ids.into_iter().filter(|id| requested.contains(id)).collect(),
            None => {
                let requests = store.ids_of_type(REQUEST_TYPE)?;
                requests.into_iter().filter(|id| requested.contains(id)).collect()
            }
        });
    }

    match (query.random, pool) {
        (Some(n), None) if !filtered => store.random_ids(REQUEST_TYPE, n),
        (Some(n), Some(ids)) if n < ids.len() => {
            // Walk every request in random order and keep the first `n` in the pool.
            let wanted: BTreeSet<&String> = ids.iter().collect();
            let shuffled = store.random_ids(REQUEST_TYPE, i64::MAX as usize)?;
            Ok(shuffled
                .into_iter()
                .filter(|id| wanted.contains(id))
                .take(n)
                .collect())
        }
        (_, Some(ids)) => Ok(ids),
        (_, None) => store.ids_of_type(REQUEST_TYPE),
    }
}

/// Reads the selected requests into a history document.
///
/// With `workers > 1` the ids are split into contiguous chunks and each
/// worker thread reads its chunk through its own connection from `open`.
pub fn load_history<S, F>(
    store: &dyn RecordStore,
    query: &HistoryQuery,
    workers: usize,
    open: F,
) -> Result<HistoryDocument, StoreError>
where
    S: RecordStore,
    F: Fn() -> Result<S, StoreError> + Sync,
{
    let ids = select_request_ids(store, query)?;
    let workers = workers.max(1).min(ids.len().max(1));
    let mut doc = HistoryDocument::default();
    if workers == 1 {
        for id in &ids {
            if let Some(entry) = load_entry(store, id)? {
                doc.history.insert(id.clone(), entry);
            }
        }
        return Ok(doc);
    }

    let chunk_len = ids.len().div_ceil(workers);
    let open = &open;
    let parts: Vec<Result<BTreeMap<String, StudyLogEntry>, StoreError>> = thread::scope(|scope| {
        let handles: Vec<_> = ids
            .chunks(chunk_len)
            .map(|chunk| {
                scope.spawn(move || -> Result<BTreeMap<String, StudyLogEntry>, StoreError> {
                    let mut conn = open()?;
                    let mut part = BTreeMap::new();
                    for id in chunk {
                        if let Some(entry) = load_entry(&conn, id)? {
                            part.insert(id.clone(), entry);
                        }
                    }
                    conn.disconnect();
                    Ok(part)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(StoreError::NotConnected("history worker panicked".to_string()))
                })
            })
            .collect()
    });
    for part in parts {
        doc.history.extend(part?);
    }
    Ok(doc)
}

/// Checks candidates in batches until `quota` not-run studies are found.
///
/// Each batch holds `floor(1.5 * quota)` candidates, at least one, sized from
/// the initial quota. Candidates never reached are reported as
/// [`RunCheck::Unknown`].
pub fn studies_have_been_run_with_quota(
    detector: &DuplicateStudyDetector,
    store: &dyn RecordStore,
    candidates: &[StudyRequest],
    quota: Option<usize>,
    requester_scope: Option<&SubjectMatch>,
) -> Result<Vec<RunCheck>, DetectorError> {
    let Some(quota) = quota else {
        return detector.study_has_been_run(store, candidates, requester_scope, None, None);
    };
    let batch = (quota * 3 / 2).max(1);
    let mut still_needed = quota;
    let mut checks: Vec<RunCheck> = Vec::with_capacity(candidates.len());
    let mut remaining = candidates;
    while !remaining.is_empty() && still_needed > 0 {
        let (now, later) = remaining.split_at(batch.min(remaining.len()));
        let returned = detector.study_has_been_run(store, now, requester_scope, Some(still_needed), None)?;
        let found = returned.iter().filter(|c| c.is_not_run()).count();
        still_needed = still_needed.saturating_sub(found);
        checks.extend(returned);
        remaining = later;
    }
    checks.resize(candidates.len(), RunCheck::Unknown);
    Ok(checks)
}
