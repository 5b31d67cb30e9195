//! The study daemon's polling loop.
//!
//! Each cycle reconnects backends, honours the cancel and terminate
//! sentinels, collects finished studies, launches whatever sits in the inbox,
//! hands control to the decision study once everything is idle, and flushes
//! the resulting log entries through the [`LogReconciler`].

use crate::config::DaemonConfig;
use crate::destination::{LogDestination, YamlHistoryFile};
use crate::execution::{ExecutionService, StudyHandle};
use crate::inbox::{acknowledge_sentinel, list_requests, move_with_lock, sentinel_present};
use crate::reconciler::LogReconciler;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use study_core::layout::result_artifact_path;
use study_core::{read_study_file, RunDescriptors, StudyLogEntry, StudyRequest, StudyResult, StudyStatus};
use study_store::{DuplicateStudyDetector, RecordStore, RunCheck, SubjectMatch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Init,
    Polling,
    Terminated(TerminationReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The terminate sentinel was acknowledged.
    Sentinel,
    /// Nothing running, the decision study had its turn and the inbox is empty.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    Terminated(TerminationReason),
}

pub struct RunningStudy {
    pub request_id: String,
    pub descriptors: RunDescriptors,
    pub run_path: PathBuf,
    /// Whether completion is written to the shared destinations or only to
    /// the local history.
    pub log_global: bool,
    pub exit_code: Option<i32>,
    handle: Box<dyn StudyHandle>,
}

struct Outgoing {
    entry: StudyLogEntry,
    global: bool,
}

/// Skips inbox requests the record store already knows as run.
pub struct DuplicateFilter {
    detector: DuplicateStudyDetector,
    store: Box<dyn RecordStore>,
    scope: Option<SubjectMatch>,
}

impl DuplicateFilter {
    pub fn new(detector: DuplicateStudyDetector, store: Box<dyn RecordStore>, scope: Option<SubjectMatch>) -> Self {
        Self { detector, store, scope }
    }

    fn existing_run(&mut self, request_id: &str, descriptors: &RunDescriptors) -> Result<Option<String>> {
        if !self.store.is_connected() {
            self.store.connect()?;
        }
        let list_fields = self.detector.criteria().list_fields();
        let candidate = StudyRequest::from_descriptors(request_id, descriptors, None, &list_fields);
        let checks = self
            .detector
            .study_has_been_run(self.store.as_ref(), &[candidate], self.scope.as_ref(), None, None)?;
        Ok(match checks.into_iter().next() {
            Some(RunCheck::AlreadyRun(existing)) if existing != request_id => Some(existing),
            _ => None,
        })
    }
}

pub struct StudyDaemon {
    config: DaemonConfig,
    execution: Box<dyn ExecutionService>,
    global: Vec<Box<dyn LogDestination>>,
    local: YamlHistoryFile,
    reconciler: LogReconciler,
    running: BTreeMap<String, RunningStudy>,
    last_was_decision: bool,
    state: DaemonState,
    duplicates: Option<DuplicateFilter>,
}

impl StudyDaemon {
    pub fn new(config: DaemonConfig, execution: Box<dyn ExecutionService>) -> Self {
        let local = YamlHistoryFile::new(config.layout.local_history.clone());
        Self {
            config,
            execution,
            global: Vec::new(),
            local,
            reconciler: LogReconciler::new(),
            running: BTreeMap::new(),
            last_was_decision: false,
            state: DaemonState::Init,
            duplicates: None,
        }
    }

    /// Adds a shared destination. Only entries of globally logged studies reach it.
    pub fn with_destination(mut self, destination: Box<dyn LogDestination>) -> Self {
        self.global.push(destination);
        self
    }

    pub fn with_duplicate_filter(mut self, filter: DuplicateFilter) -> Self {
        self.duplicates = Some(filter);
        self
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn last_was_decision(&self) -> bool {
        self.last_was_decision
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.running.keys().cloned().collect()
    }

    pub fn running_study(&self, request_id: &str) -> Option<&RunningStudy> {
        self.running.get(request_id)
    }

    pub fn reconciler(&self) -> &LogReconciler {
        &self.reconciler
    }

    pub fn local_history(&self) -> &YamlHistoryFile {
        &self.local
    }

    /// Cycles until termination, sleeping between cycles with every backend
    /// connection released.
    pub fn run(&mut self) -> Result<TerminationReason> {
        self.config
            .layout
            .ensure()
            .context("failed preparing worker layout")?;
        info!(root = %self.config.layout.root.display(), "study daemon started");
        loop {
            if let CycleOutcome::Terminated(reason) = self.run_cycle() {
                info!(?reason, "study daemon terminated");
                return Ok(reason);
            }
            self.release_connections();
            thread::sleep(self.config.sleep);
        }
    }

    pub fn run_cycle(&mut self) -> CycleOutcome {
        if let DaemonState::Terminated(reason) = self.state {
            return CycleOutcome::Terminated(reason);
        }
        self.state = DaemonState::Polling;
        self.reconnect();

        let sentinel_timeout = self.config.sentinel_lock_timeout;
        let cancel = self.config.layout.cancel_sentinel.clone();
        if sentinel_present(&cancel) {
            let running = &mut self.running;
            if let Err(err) = acknowledge_sentinel(&cancel, sentinel_timeout, || cancel_all(running)) {
                error!(error = %err, "failed to acquire cancellation lock; retrying next cycle");
            }
        }
        let terminate = self.config.layout.terminate_sentinel.clone();
        if sentinel_present(&terminate) {
            let running = &mut self.running;
            match acknowledge_sentinel(&terminate, sentinel_timeout, || cancel_all(running)) {
                Ok(true) => return self.terminate(TerminationReason::Sentinel),
                Ok(false) => {}
                Err(err) => error!(error = %err, "failed to acquire termination lock; retrying next cycle"),
            }
        }

        let mut outgoing = self.collect_finished();

        let requests = list_requests(&self.config.layout.inbox).unwrap_or_else(|err| {
            warn!(error = %format!("{err:#}"), "failed listing inbox");
            Vec::new()
        });
        if !requests.is_empty() {
            self.last_was_decision = false;
        }
        let mut launched = false;
        for path in requests {
            match self.accept_request(&path) {
                Ok(Some(entry)) => {
                    launched |= entry.status == StudyStatus::Running;
                    outgoing.push(Outgoing { entry, global: true });
                }
                Ok(None) => {}
                Err(err) => error!(file = %path.display(), error = %format!("{err:#}"), "failed accepting request"),
            }
        }

        if self.running.is_empty() && !self.last_was_decision {
            if let Some(entry) = self.invoke_decision_study() {
                outgoing.push(Outgoing { entry, global: false });
            }
            self.last_was_decision = true;
        }

        let timeout = if launched {
            self.config.launch_lock_timeout
        } else {
            self.config.lock_timeout
        };
        self.flush(outgoing, timeout);

        if self.running.is_empty() && self.last_was_decision && self.inbox_is_empty() {
            return self.terminate(TerminationReason::Exhausted);
        }
        CycleOutcome::Continue
    }

    fn terminate(&mut self, reason: TerminationReason) -> CycleOutcome {
        self.drain();
        self.state = DaemonState::Terminated(reason);
        CycleOutcome::Terminated(reason)
    }

    fn reconnect(&mut self) {
        for destination in &mut self.global {
            if let Err(err) = destination.reconnect() {
                warn!(destination = %destination.key(), error = %err, "reconnect failed; retrying next cycle");
            }
        }
    }

    fn release_connections(&mut self) {
        for destination in &mut self.global {
            destination.release();
        }
        if let Some(filter) = &mut self.duplicates {
            filter.store.disconnect();
        }
    }

    fn collect_finished(&mut self) -> Vec<Outgoing> {
        let mut exited = Vec::new();
        for (request_id, study) in &mut self.running {
            match study.handle.poll() {
                Ok(Some(code)) => {
                    study.exit_code = Some(code);
                    exited.push(request_id.clone());
                }
                Ok(None) => {}
                Err(err) => warn!(request_id = %request_id, error = %format!("{err:#}"), "failed polling study"),
            }
        }
        exited
            .into_iter()
            .filter_map(|id| self.running.remove(&id))
            .map(|study| Outgoing {
                global: study.log_global,
                entry: completion_entry(&study),
            })
            .collect()
    }

    /// Moves a request out of the inbox and launches it. Returns the entry
    /// to log, or `None` when the request is skipped.
    fn accept_request(&mut self, path: &Path) -> Result<Option<StudyLogEntry>> {
        let moved = move_with_lock(path, &self.config.layout.outbox, self.config.lock_timeout)?;
        let (request_id, descriptors) = read_study_file(&moved)?;
        if self.running.contains_key(&request_id) {
            warn!(request_id = %request_id, "request is already running; ignoring duplicate submission");
            return Ok(None);
        }
        if let Some(filter) = &mut self.duplicates {
            let existing = filter
                .existing_run(&request_id, &descriptors)
                .with_context(|| format!("duplicate check failed for {}; request left in outbox", request_id))?;
            if let Some(existing) = existing {
                info!(request_id = %request_id, existing = %existing, "skipping request already run");
                return Ok(None);
            }
        }
        match self.launch(&moved, &request_id, descriptors.clone(), true) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                error!(request_id = %request_id, error = %format!("{err:#}"), "failed launching study");
                Ok(Some(StudyLogEntry::new(request_id, descriptors, StudyStatus::Failed)))
            }
        }
    }

    fn launch(
        &mut self,
        study_file: &Path,
        request_id: &str,
        descriptors: RunDescriptors,
        log_global: bool,
    ) -> Result<StudyLogEntry> {
        let run_path = fresh_run_path(&self.config.layout.workspace, &descriptors.run_dir_name(request_id));
        let handle = self.execution.launch(study_file, &run_path)?;
        info!(request_id = %request_id, run_path = %run_path.display(), log_global, "launched study");
        let entry = StudyLogEntry::new(request_id, descriptors.clone(), StudyStatus::Running);
        self.running.insert(
            request_id.to_string(),
            RunningStudy {
                request_id: request_id.to_string(),
                descriptors,
                run_path,
                log_global,
                exit_code: None,
                handle,
            },
        );
        Ok(entry)
    }

    /// Launches the decision study, if one is configured, as a locally
    /// logged run.
    fn invoke_decision_study(&mut self) -> Option<StudyLogEntry> {
        let path = self.config.layout.decision_study.clone();
        if !path.is_file() {
            debug!(path = %path.display(), "no decision study configured");
            return None;
        }
        let launched = read_study_file(&path)
            .and_then(|(request_id, descriptors)| self.launch(&path, &request_id, descriptors, false));
        match launched {
            Ok(entry) => Some(entry),
            Err(err) => {
                error!(path = %path.display(), error = %format!("{err:#}"), "failed invoking decision study");
                None
            }
        }
    }

    fn flush(&mut self, outgoing: Vec<Outgoing>, lock_timeout: Duration) {
        let global: Vec<StudyLogEntry> = outgoing
            .iter()
            .filter(|o| o.global)
            .map(|o| o.entry.clone())
            .collect();
        let local: Vec<StudyLogEntry> = outgoing.into_iter().map(|o| o.entry).collect();
        for destination in &mut self.global {
            let _ = self
                .reconciler
                .reconcile_and_flush(destination.as_mut(), global.clone(), lock_timeout);
        }
        let _ = self
            .reconciler
            .reconcile_and_flush(&mut self.local, local, lock_timeout);
    }

    /// Final attempt at every non-empty pending queue with the drain timeout.
    fn drain(&mut self) {
        let timeout = self.config.drain_lock_timeout;
        for destination in &mut self.global {
            drain_destination(&mut self.reconciler, destination.as_mut(), timeout);
        }
        drain_destination(&mut self.reconciler, &mut self.local, timeout);
    }

    fn inbox_is_empty(&self) -> bool {
        match list_requests(&self.config.layout.inbox) {
            Ok(files) => files.is_empty(),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed re-checking inbox");
                false
            }
        }
    }
}

fn drain_destination(reconciler: &mut LogReconciler, destination: &mut dyn LogDestination, timeout: Duration) {
    let key = destination.key().clone();
    let waiting = reconciler.pending(&key).len();
    if waiting == 0 {
        return;
    }
    if let Err(err) = reconciler.reconcile_and_flush(destination, Vec::new(), timeout) {
        error!(destination = %key, entries = waiting, error = %err, "log entries left unwritten at shutdown");
    }
}

fn cancel_all(running: &mut BTreeMap<String, RunningStudy>) {
    for (request_id, study) in running.iter_mut() {
        match study.handle.cancel() {
            Ok(()) => info!(request_id = %request_id, "cancellation requested"),
            Err(err) => warn!(request_id = %request_id, error = %format!("{err:#}"), "failed cancelling study"),
        }
    }
}

/// `<workspace>/<dir_name>`, suffixed with a timestamp if that path is taken.
pub fn fresh_run_path(workspace: &Path, dir_name: &str) -> PathBuf {
    let candidate = workspace.join(dir_name);
    if !candidate.exists() {
        return candidate;
    }
    workspace.join(format!("{}_{}", dir_name, Utc::now().format("%Y%m%d_%H%M%S_%6f")))
}

/// Parsed `results.yaml` under `run_path`, or `None` if the study wrote none.
pub fn read_result_artifact(run_path: &Path) -> Result<Option<StudyResult>> {
    let path = result_artifact_path(run_path);
    if !path.is_file() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path).with_context(|| format!("failed reading {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Some(StudyResult::new()));
    }
    let result: StudyResult =
        serde_yaml::from_str(&raw).with_context(|| format!("invalid result artifact {}", path.display()))?;
    Ok(Some(result))
}

fn completion_entry(study: &RunningStudy) -> StudyLogEntry {
    let failed = StudyLogEntry::new(&study.request_id, study.descriptors.clone(), StudyStatus::Failed);
    if study.exit_code != Some(0) {
        info!(request_id = %study.request_id, exit_code = ?study.exit_code, "study failed");
        return failed;
    }
    match read_result_artifact(&study.run_path) {
        Ok(Some(result)) => {
            info!(request_id = %study.request_id, "study finished");
            StudyLogEntry {
                status: StudyStatus::Finished,
                result: Some(result),
                ..failed
            }
        }
        Ok(None) => {
            warn!(request_id = %study.request_id, run_path = %study.run_path.display(), "study exited 0 without a result artifact");
            failed
        }
        Err(err) => {
            warn!(request_id = %study.request_id, error = %format!("{err:#}"), "unreadable result artifact");
            failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{DestinationKey, RecordStoreDestination};
    use crate::test_support::TempDirGuard;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use study_core::{worker_layout, FileLock, WorkerLayout};
    use study_store::history::{append_study_entry, check_in_history, load_entry};
    use study_store::{DuplicateCriteria, SqliteRecordStore};

    #[derive(Default)]
    struct FakeState {
        launched: Vec<(PathBuf, PathBuf)>,
        exits: BTreeMap<PathBuf, i32>,
        cancelled: Vec<PathBuf>,
        fail_launch: bool,
    }

    #[derive(Clone, Default)]
    struct FakeExecution {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeExecution {
        fn finish(&self, run_path: &Path, code: i32, result: Option<&str>) {
            if let Some(raw) = result {
                fs::create_dir_all(run_path).expect("run path");
                fs::write(result_artifact_path(run_path), raw).expect("artifact");
            }
            self.state.lock().expect("state").exits.insert(run_path.to_path_buf(), code);
        }

        fn cancelled(&self) -> Vec<PathBuf> {
            self.state.lock().expect("state").cancelled.clone()
        }

        fn launched(&self) -> Vec<(PathBuf, PathBuf)> {
            self.state.lock().expect("state").launched.clone()
        }
    }

    struct FakeHandle {
        run_path: PathBuf,
        state: Arc<Mutex<FakeState>>,
    }

    impl ExecutionService for FakeExecution {
        fn launch(&self, study_file: &Path, run_path: &Path) -> Result<Box<dyn StudyHandle>> {
            let mut state = self.state.lock().expect("state");
            if state.fail_launch {
                anyhow::bail!("executor offline");
            }
            state.launched.push((study_file.to_path_buf(), run_path.to_path_buf()));
            Ok(Box::new(FakeHandle {
                run_path: run_path.to_path_buf(),
                state: self.state.clone(),
            }))
        }
    }

    impl StudyHandle for FakeHandle {
        fn poll(&mut self) -> Result<Option<i32>> {
            Ok(self.state.lock().expect("state").exits.get(&self.run_path).copied())
        }

        fn cancel(&mut self) -> Result<()> {
            self.state.lock().expect("state").cancelled.push(self.run_path.clone());
            Ok(())
        }
    }

    struct Harness {
        _tmp: TempDirGuard,
        layout: WorkerLayout,
        exec: FakeExecution,
        shared_history: PathBuf,
        db: PathBuf,
    }

    impl Harness {
        fn new(prefix: &str) -> Self {
            let tmp = TempDirGuard::new(prefix);
            let layout = worker_layout(&tmp.path.join("worker"));
            layout.ensure().expect("layout");
            Self {
                shared_history: tmp.path.join("shared").join("history.yaml"),
                db: tmp.path.join("history.sqlite"),
                layout,
                exec: FakeExecution::default(),
                _tmp: tmp,
            }
        }

        fn daemon(&self) -> StudyDaemon {
            let mut config = DaemonConfig::new(self.layout.clone());
            config.sleep = Duration::ZERO;
            config.lock_timeout = Duration::from_millis(150);
            config.launch_lock_timeout = Duration::from_millis(150);
            config.drain_lock_timeout = Duration::from_millis(300);
            config.sentinel_lock_timeout = Duration::from_millis(100);
            let store = SqliteRecordStore::open(&self.db).expect("store");
            StudyDaemon::new(config, Box::new(self.exec.clone()))
                .with_destination(Box::new(YamlHistoryFile::new(&self.shared_history)))
                .with_destination(Box::new(RecordStoreDestination::new(
                    Box::new(store),
                    Some("agent1".to_string()),
                    Vec::new(),
                )))
        }

        fn submit(&self, request_id: &str, seq: &str) -> PathBuf {
            let path = self.layout.inbox.join(format!("{}.yaml", request_id));
            write_study(&path, request_id, seq);
            path
        }

        fn shared(&self) -> BTreeMap<String, StudyLogEntry> {
            YamlHistoryFile::new(&self.shared_history)
                .load(Duration::from_secs(1))
                .expect("shared")
                .history
        }

        fn local(&self) -> BTreeMap<String, StudyLogEntry> {
            YamlHistoryFile::new(&self.layout.local_history)
                .load(Duration::from_secs(1))
                .expect("local")
                .history
        }

        fn store(&self) -> SqliteRecordStore {
            SqliteRecordStore::open(&self.db).expect("store")
        }
    }

    fn write_study(path: &Path, request_id: &str, seq: &str) {
        let parameters = format!("      SEQUENCE_HASH:\n        values: [{}, md5]\n", seq);
        write_study_parameters(path, request_id, &parameters);
    }

    fn write_study_parameters(path: &Path, request_id: &str, parameters: &str) {
        let raw = format!(
            "description:\n  name: {}\n  run_descriptors:\n    study_type: binding\n    study_parameters:\n{}",
            request_id, parameters
        );
        fs::create_dir_all(path.parent().expect("parent")).expect("dir");
        fs::write(path, raw).expect("study file");
    }

    #[test]
    fn inbox_request_runs_to_finished_in_every_destination() {
        let h = Harness::new("study_runner_daemon_e2e");
        let mut daemon = h.daemon();
        let submitted = h.submit("r3", "h3");

        assert_eq!(daemon.run_cycle(), CycleOutcome::Continue);
        assert!(!submitted.exists());
        assert!(h.layout.outbox.join("r3.yaml").exists());
        assert_eq!(daemon.running_ids(), vec!["r3".to_string()]);
        let run_path = h.layout.workspace.join("binding_r3");
        assert_eq!(daemon.running_study("r3").map(|s| s.run_path.clone()), Some(run_path.clone()));
        assert_eq!(h.shared().get("r3").map(|e| e.status), Some(StudyStatus::Running));
        assert_eq!(h.local().get("r3").map(|e| e.status), Some(StudyStatus::Running));
        assert!(check_in_history(&h.store(), "r3", StudyStatus::Running).expect("store"));

        h.exec.finish(&run_path, 0, Some("x: 1\n"));
        assert_eq!(daemon.run_cycle(), CycleOutcome::Terminated(TerminationReason::Exhausted));
        assert!(daemon.running_ids().is_empty());

        let expected = BTreeMap::from([("x".to_string(), json!(1))]);
        let shared = h.shared();
        let finished = shared.get("r3").expect("shared r3");
        assert_eq!(finished.status, StudyStatus::Finished);
        assert_eq!(finished.result.as_ref(), Some(&expected));
        assert_eq!(h.local().get("r3"), Some(finished));
        let stored = load_entry(&h.store(), "r3").expect("load").expect("stored");
        assert_eq!(stored.status, StudyStatus::Finished);
        assert_eq!(stored.result, Some(expected));
    }

    #[test]
    fn missing_artifact_and_nonzero_exit_are_failures() {
        let h = Harness::new("study_runner_daemon_failures");
        let mut daemon = h.daemon();
        h.submit("r1", "h1");
        h.submit("r2", "h2");
        assert_eq!(daemon.run_cycle(), CycleOutcome::Continue);

        h.exec.finish(&h.layout.workspace.join("binding_r1"), 0, None);
        h.exec.finish(&h.layout.workspace.join("binding_r2"), 2, Some("x: 1\n"));
        daemon.run_cycle();

        let shared = h.shared();
        for id in ["r1", "r2"] {
            let entry = shared.get(id).expect("entry");
            assert_eq!(entry.status, StudyStatus::Failed);
            assert_eq!(entry.result, None);
        }
    }

    #[test]
    fn launch_failure_is_logged_as_failed() {
        let h = Harness::new("study_runner_daemon_launch_fail");
        h.exec.state.lock().expect("state").fail_launch = true;
        let mut daemon = h.daemon();
        h.submit("r1", "h1");
        daemon.run_cycle();
        assert!(daemon.running_ids().is_empty());
        assert!(h.layout.outbox.join("r1.yaml").exists());
        assert_eq!(h.shared().get("r1").map(|e| e.status), Some(StudyStatus::Failed));
    }

    #[test]
    fn decision_study_is_logged_locally_only() {
        let h = Harness::new("study_runner_daemon_decision");
        write_study(&h.layout.decision_study, "decide", "d0");
        let mut daemon = h.daemon();

        assert_eq!(daemon.run_cycle(), CycleOutcome::Continue);
        assert!(daemon.last_was_decision());
        assert_eq!(daemon.running_study("decide").map(|s| s.log_global), Some(false));
        assert_eq!(h.local().get("decide").map(|e| e.status), Some(StudyStatus::Running));
        assert!(!h.shared_history.exists() || !h.shared().contains_key("decide"));

        let decision_run = h.layout.workspace.join("binding_decide");
        h.exec.finish(&decision_run, 0, Some("next: r5\n"));
        h.submit("r5", "h5");
        assert_eq!(daemon.run_cycle(), CycleOutcome::Continue);
        assert!(!daemon.last_was_decision());
        assert_eq!(daemon.running_ids(), vec!["r5".to_string()]);
        let shared = h.shared();
        assert!(!shared.contains_key("decide"));
        assert_eq!(shared.get("r5").map(|e| e.status), Some(StudyStatus::Running));
        assert_eq!(h.local().get("decide").map(|e| e.status), Some(StudyStatus::Finished));
    }

    #[test]
    fn cancel_sentinel_signals_running_studies() {
        let h = Harness::new("study_runner_daemon_cancel");
        let mut daemon = h.daemon();
        h.submit("r1", "h1");
        daemon.run_cycle();

        crate::inbox::raise_sentinel(&h.layout.cancel_sentinel).expect("sentinel");
        {
            let _held = FileLock::acquire(&h.layout.cancel_sentinel, Duration::from_secs(1)).expect("hold");
            assert_eq!(daemon.run_cycle(), CycleOutcome::Continue);
            assert!(h.exec.cancelled().is_empty());
            assert!(h.layout.cancel_sentinel.exists());
        }

        assert_eq!(daemon.run_cycle(), CycleOutcome::Continue);
        assert_eq!(h.exec.cancelled(), vec![h.layout.workspace.join("binding_r1")]);
        assert!(!h.layout.cancel_sentinel.exists());
    }

    #[test]
    fn terminate_sentinel_cancels_and_stops() {
        let h = Harness::new("study_runner_daemon_terminate");
        let mut daemon = h.daemon();
        h.submit("r1", "h1");
        daemon.run_cycle();
        crate::inbox::raise_sentinel(&h.layout.terminate_sentinel).expect("sentinel");

        assert_eq!(daemon.run_cycle(), CycleOutcome::Terminated(TerminationReason::Sentinel));
        assert_eq!(daemon.state(), DaemonState::Terminated(TerminationReason::Sentinel));
        assert_eq!(h.exec.cancelled().len(), 1);
        assert!(!h.layout.terminate_sentinel.exists());
    }

    #[test]
    fn blocked_shared_history_is_retried_and_drained() {
        let h = Harness::new("study_runner_daemon_deferred");
        let mut daemon = h.daemon();
        h.submit("r1", "h1");
        let shared_key = DestinationKey::file(&h.shared_history);
        {
            let _held = FileLock::acquire(
                &study_core::layout::history_lock_path(&h.shared_history),
                Duration::from_secs(1),
            )
            .expect("hold");
            daemon.run_cycle();
        }
        assert_eq!(daemon.reconciler().pending(&shared_key).len(), 1);
        assert!(!h.shared_history.exists());
        assert_eq!(h.local().get("r1").map(|e| e.status), Some(StudyStatus::Running));

        h.exec.finish(&h.layout.workspace.join("binding_r1"), 0, Some("x: 2\n"));
        assert_eq!(daemon.run_cycle(), CycleOutcome::Terminated(TerminationReason::Exhausted));
        assert!(!daemon.reconciler().has_pending());
        assert_eq!(h.shared().get("r1").map(|e| e.status), Some(StudyStatus::Finished));
    }

    #[test]
    fn duplicate_filter_skips_known_studies() {
        let h = Harness::new("study_runner_daemon_duplicates");
        let mut seed = h.store();
        let known = RunDescriptors::new("binding")
            .with_parameter("SEQUENCE_HASH", json!(["h1", "md5"]))
            .with_parameter("CHAINS_IN_STRUCT", json!(["A", "B"]));
        append_study_entry(
            &mut seed,
            &StudyLogEntry::new("old", known, StudyStatus::Finished),
            Some("agent1"),
            &DuplicateCriteria::default().list_fields(),
        )
        .expect("seed");

        let filter = DuplicateFilter::new(
            DuplicateStudyDetector::new(DuplicateCriteria::default()),
            Box::new(h.store()),
            None,
        );
        let mut daemon = h.daemon().with_duplicate_filter(filter);
        let chains = "      CHAINS_IN_STRUCT:\n        values: [A, B]\n";
        write_study_parameters(
            &h.layout.inbox.join("r1.yaml"),
            "r1",
            &format!("      SEQUENCE_HASH:\n        values: [h1, md5]\n{}", chains),
        );
        write_study_parameters(
            &h.layout.inbox.join("r2.yaml"),
            "r2",
            &format!("      SEQUENCE_HASH:\n        values: [h2, md5]\n{}", chains),
        );
        daemon.run_cycle();
        assert_eq!(daemon.running_ids(), vec!["r2".to_string()]);
        assert_eq!(h.exec.launched().len(), 1);
        assert!(h.layout.outbox.join("r1.yaml").exists());
    }

    #[test]
    fn request_without_equality_key_is_not_launched_when_filtering() {
        let h = Harness::new("study_runner_daemon_missing_key");
        let filter = DuplicateFilter::new(
            DuplicateStudyDetector::new(DuplicateCriteria::default()),
            Box::new(h.store()),
            None,
        );
        let mut daemon = h.daemon().with_duplicate_filter(filter);
        write_study_parameters(
            &h.layout.inbox.join("r9.yaml"),
            "r9",
            "      TEMPERATURE:\n        values: [300]\n",
        );
        h.submit("r2", "h2");

        daemon.run_cycle();
        assert_eq!(daemon.running_ids(), vec!["r2".to_string()]);
        assert_eq!(h.exec.launched().len(), 1);
        assert!(h.layout.outbox.join("r9.yaml").exists());
        assert!(!h.local().contains_key("r9"));
        assert!(!h.shared().contains_key("r9"));
    }

    #[test]
    fn idle_worker_terminates_after_one_cycle() {
        let h = Harness::new("study_runner_daemon_idle");
        let mut daemon = h.daemon();
        assert_eq!(daemon.state(), DaemonState::Init);
        assert_eq!(daemon.run().expect("run"), TerminationReason::Exhausted);
        assert_eq!(daemon.state(), DaemonState::Terminated(TerminationReason::Exhausted));
        assert!(h.exec.launched().is_empty());
    }

    #[test]
    fn fresh_run_path_avoids_existing_directories() {
        let tmp = TempDirGuard::new("study_runner_daemon_run_path");
        let first = fresh_run_path(&tmp.path, "binding_r1");
        assert_eq!(first, tmp.path.join("binding_r1"));
        fs::create_dir_all(&first).expect("dir");
        let second = fresh_run_path(&tmp.path, "binding_r1");
        assert_ne!(second, first);
        assert!(second
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("binding_r1_")));
    }

    #[test]
    fn result_artifact_parsing() {
        let tmp = TempDirGuard::new("study_runner_daemon_artifact");
        assert_eq!(read_result_artifact(&tmp.path).expect("absent"), None);
        fs::write(tmp.path.join("results.yaml"), "energy: -1.5\nchains: [A, B]\n").expect("write");
        let result = read_result_artifact(&tmp.path).expect("read").expect("present");
        assert_eq!(result.get("energy"), Some(&json!(-1.5)));
        assert_eq!(result.get("chains"), Some(&json!(["A", "B"])));
        fs::write(tmp.path.join("results.yaml"), "- not\n- a mapping\n").expect("write");
        assert!(read_result_artifact(&tmp.path).is_err());
    }
}
