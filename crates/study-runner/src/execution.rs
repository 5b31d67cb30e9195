use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

pub const STUDY_PLACEHOLDER: &str = "{study}";
pub const RUN_PATH_PLACEHOLDER: &str = "{run_path}";

/// A launched study process. Polling never blocks.
pub trait StudyHandle: Send {
    /// `Some(code)` once the process has exited. Signal deaths report a
    /// nonzero code.
    fn poll(&mut self) -> Result<Option<i32>>;
    /// Requests cancellation. The process is expected to exit on its own
    /// afterwards and is picked up by a later `poll`.
    fn cancel(&mut self) -> Result<()>;
}

pub trait ExecutionService {
    fn launch(&self, study_file: &Path, run_path: &Path) -> Result<Box<dyn StudyHandle>>;
}

/// Spawns one child process per study from an argv template. `{study}` and
/// `{run_path}` are substituted in every argument.
#[derive(Debug, Clone)]
pub struct CommandExecutionService {
    launch: Vec<String>,
    cancel: Option<Vec<String>>,
}

impl CommandExecutionService {
    pub fn from_template(launch: Vec<String>, cancel: Option<Vec<String>>) -> Result<Self> {
        if launch.is_empty() {
            return Err(anyhow!("launch command template is empty"));
        }
        if matches!(&cancel, Some(c) if c.is_empty()) {
            return Err(anyhow!("cancel command template is empty"));
        }
        Ok(Self { launch, cancel })
    }

    /// `maestro run <flags> -o <run_path> -fg -y <study>`, optionally under
    /// `srun -n 1 --exclusive`. Cancellation goes through `maestro cancel`.
    pub fn maestro(flags: &[String], use_srun: bool) -> Self {
        let mut launch = Vec::new();
        if use_srun {
            launch.extend(["srun", "-n", "1", "--exclusive"].map(String::from));
        }
        launch.extend(["maestro", "run"].map(String::from));
        launch.extend(flags.iter().cloned());
        launch.extend(["-o", RUN_PATH_PLACEHOLDER, "-fg", "-y", STUDY_PLACEHOLDER].map(String::from));
        let cancel = ["maestro", "cancel", RUN_PATH_PLACEHOLDER].map(String::from).to_vec();
        Self {
            launch,
            cancel: Some(cancel),
        }
    }

    /// Cancel by SIGTERM instead of a cancel command.
    pub fn cancel_by_signal(mut self) -> Self {
        self.cancel = None;
        self
    }

    pub fn launch_template(&self) -> &[String] {
        &self.launch
    }
}

fn render(template: &[String], study_file: &Path, run_path: &Path) -> Vec<String> {
    let study = study_file.display().to_string();
    let run = run_path.display().to_string();
    template
        .iter()
        .map(|arg| arg.replace(STUDY_PLACEHOLDER, &study).replace(RUN_PATH_PLACEHOLDER, &run))
        .collect()
}

fn spawn_detached(argv: &[String]) -> Result<Child> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    cmd.spawn()
        .with_context(|| format!("failed to spawn {}", shell_join(argv)))
}

impl ExecutionService for CommandExecutionService {
    fn launch(&self, study_file: &Path, run_path: &Path) -> Result<Box<dyn StudyHandle>> {
        let argv = render(&self.launch, study_file, run_path);
        debug!(command = %shell_join(&argv), "launching study");
        let child = spawn_detached(&argv)?;
        let cancel = self
            .cancel
            .as_ref()
            .map(|template| render(template, study_file, run_path));
        Ok(Box::new(ProcessHandle {
            child,
            cancel,
            cancellers: Vec::new(),
        }))
    }
}

struct ProcessHandle {
    child: Child,
    cancel: Option<Vec<String>>,
    cancellers: Vec<Child>,
}

impl ProcessHandle {
    fn reap_cancellers(&mut self) {
        self.cancellers.retain_mut(|c| !matches!(c.try_wait(), Ok(Some(_))));
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.reap_cancellers();
        if self.cancellers.is_empty() {
            return;
        }
        if let Err(err) = wait_in_background(std::mem::take(&mut self.cancellers)) {
            warn!(error = %err, "failed to start canceller reaper");
        }
    }
}

/// Waits on `children` from a detached thread so none is left a zombie.
fn wait_in_background(children: Vec<Child>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("canceller-reaper".to_string())
        .spawn(move || {
            for mut child in children {
                if let Err(err) = child.wait() {
                    warn!(pid = child.id(), error = %err, "failed waiting on canceller");
                }
            }
        })
}

impl StudyHandle for ProcessHandle {
    fn poll(&mut self) -> Result<Option<i32>> {
        self.reap_cancellers();
        let status = self.child.try_wait().context("failed to poll study process")?;
        Ok(status.map(exit_code))
    }

    fn cancel(&mut self) -> Result<()> {
        match &self.cancel {
            Some(argv) => {
                let canceller = spawn_detached(argv)?;
                self.cancellers.push(canceller);
                Ok(())
            }
            None => terminate(&mut self.child),
        }
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> Result<()> {
    let pid = child.id() as libc::pid_t;
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(anyhow!("failed to signal study process {}: {}", pid, err));
        }
        warn!(pid, "study process already gone");
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> Result<()> {
    child.kill().context("failed to kill study process")
}

pub(crate) fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:{}".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
