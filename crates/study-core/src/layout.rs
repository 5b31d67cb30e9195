use std::path::{Path, PathBuf};

pub const PRIVATE_DIR: &str = "studyd";
pub const INBOX_DIR: &str = "inbox";
pub const OUTBOX_DIR: &str = "outbox";
pub const DECISION_DIR: &str = "decision_maker";
pub const DECISION_STUDY_FILE: &str = "decision_study.yaml";
pub const WORKSPACE_DIR: &str = "workspace";
pub const LOGS_DIR: &str = "logs";
pub const LOCAL_HISTORY_FILE: &str = ".local_history.yaml";
pub const HISTORY_LOCK_FILE: &str = ".history.lock";
pub const CANCEL_SENTINEL: &str = ".cancel.lock";
pub const TERMINATE_SENTINEL: &str = ".term.lock";
pub const RESULT_ARTIFACT: &str = "results.yaml";
pub const STUDY_FILE_EXTENSION: &str = "yaml";

/// Filesystem layout of one worker root.
#[derive(Debug, Clone)]
pub struct WorkerLayout {
    pub root: PathBuf,
    pub private_dir: PathBuf,
    pub inbox: PathBuf,
    pub outbox: PathBuf,
    pub decision_study: PathBuf,
    pub workspace: PathBuf,
    pub logs: PathBuf,
    pub local_history: PathBuf,
    pub cancel_sentinel: PathBuf,
    pub terminate_sentinel: PathBuf,
}

pub fn worker_layout(root: &Path) -> WorkerLayout {
    let private_dir = root.join(PRIVATE_DIR);
    WorkerLayout {
        root: root.to_path_buf(),
        inbox: private_dir.join(INBOX_DIR),
        outbox: private_dir.join(OUTBOX_DIR),
        decision_study: private_dir.join(DECISION_DIR).join(DECISION_STUDY_FILE),
        local_history: private_dir.join(LOCAL_HISTORY_FILE),
        private_dir,
        workspace: root.join(WORKSPACE_DIR),
        logs: root.join(LOGS_DIR),
        cancel_sentinel: root.join(CANCEL_SENTINEL),
        terminate_sentinel: root.join(TERMINATE_SENTINEL),
    }
}

impl WorkerLayout {
    pub fn with_sentinels(mut self, cancel: Option<PathBuf>, terminate: Option<PathBuf>) -> Self {
        if let Some(cancel) = cancel {
            self.cancel_sentinel = cancel;
        }
        if let Some(terminate) = terminate {
            self.terminate_sentinel = terminate;
        }
        self
    }

    pub fn ensure(&self) -> anyhow::Result<()> {
        for dir in [&self.inbox, &self.outbox, &self.workspace, &self.logs] {
            crate::ensure_dir(dir)?;
        }
        if let Some(parent) = self.decision_study.parent() {
            crate::ensure_dir(parent)?;
        }
        Ok(())
    }
}

/// Lock file guarding a history file: `.history.lock` beside it.
pub fn history_lock_path(history: &Path) -> PathBuf {
    match history.parent() {
        Some(parent) => parent.join(HISTORY_LOCK_FILE),
        None => PathBuf::from(HISTORY_LOCK_FILE),
    }
}

/// Lock file guarding a rename out of the inbox: `<file>.lock`.
pub fn rename_lock_path(src: &Path) -> PathBuf {
    let mut name = src.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

pub fn result_artifact_path(run_path: &Path) -> PathBuf {
    run_path.join(RESULT_ARTIFACT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_places_private_state_under_worker_root() {
        let layout = worker_layout(Path::new("/w"));
        assert_eq!(layout.inbox, PathBuf::from("/w/studyd/inbox"));
        assert_eq!(layout.outbox, PathBuf::from("/w/studyd/outbox"));
        assert_eq!(
            layout.decision_study,
            PathBuf::from("/w/studyd/decision_maker/decision_study.yaml")
        );
        assert_eq!(layout.local_history, PathBuf::from("/w/studyd/.local_history.yaml"));
        assert_eq!(layout.cancel_sentinel, PathBuf::from("/w/.cancel.lock"));
        assert_eq!(layout.terminate_sentinel, PathBuf::from("/w/.term.lock"));
        let custom = layout.with_sentinels(None, Some(PathBuf::from("/tmp/stop")));
        assert_eq!(custom.cancel_sentinel, PathBuf::from("/w/.cancel.lock"));
        assert_eq!(custom.terminate_sentinel, PathBuf::from("/tmp/stop"));
    }

    #[test]
    fn lock_paths_are_colocated() {
        assert_eq!(
            history_lock_path(Path::new("/shared/history.yaml")),
            PathBuf::from("/shared/.history.lock")
        );
        assert_eq!(
            rename_lock_path(Path::new("/w/studyd/inbox/r1.yaml")),
            PathBuf::from("/w/studyd/inbox/r1.yaml.lock")
        );
        assert_eq!(
            result_artifact_path(Path::new("/w/workspace/binding_r1")),
            PathBuf::from("/w/workspace/binding_r1/results.yaml")
        );
    }
}
