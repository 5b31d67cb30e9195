use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use study_core::{
    atomic_write_yaml, ensure_dir, read_study_file, worker_layout, StudyLogEntry, StudyRequest, StudyResult,
    StudyStatus,
};
use study_runner::inbox::raise_sentinel;
use study_runner::{
    CommandExecutionService, DaemonConfig, DuplicateFilter, LogDestination, LogReconciler, RecordStoreDestination,
    StudyDaemon, TerminationReason, YamlHistoryFile,
};
use study_store::history::{self, HistoryQuery};
use study_store::{DuplicateCriteria, DuplicateStudyDetector, RunCheck, SqliteRecordStore, SubjectMatch};
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "studyd", version = "0.3.0", about = "Study orchestration daemon")]
struct Cli {
    /// 1 = trace ... 5 = error. `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=5))]
    debug_lvl: u8,
    /// Write logs to `<dir>/studyd.log` instead of stderr.
    #[arg(long, global = true)]
    log_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

/// Where log entries are read from or written to. Exactly one is required.
#[derive(Args, Clone)]
struct Target {
    #[arg(long, conflicts_with = "store", required_unless_present = "store")]
    history: Option<PathBuf>,
    /// `sqlite://<path>`, a plain path, or `sqlite://:memory:`.
    #[arg(long)]
    store: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the worker inbox until terminated.
    Run {
        #[arg(long)]
        root: PathBuf,
        /// Shared YAML history files.
        #[arg(long)]
        history: Vec<PathBuf>,
        /// Shared record stores.
        #[arg(long)]
        store: Vec<String>,
        #[arg(long)]
        requester: Option<String>,
        #[arg(long = "maestro-flag", allow_hyphen_values = true)]
        maestro_flags: Vec<String>,
        #[arg(long)]
        srun: bool,
        #[arg(long)]
        cancel_by_signal: bool,
        /// Skip inbox requests already run according to this store.
        #[arg(long)]
        skip_duplicates: Option<String>,
        #[arg(long)]
        cancel_sentinel: Option<PathBuf>,
        #[arg(long)]
        terminate_sentinel: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    AppendHistory {
        #[command(flatten)]
        target: Target,
        /// Study descriptor file the entry describes.
        #[arg(long)]
        study: PathBuf,
        #[arg(long)]
        status: StudyStatus,
        /// YAML mapping attached as the result; terminal statuses only.
        #[arg(long)]
        result: Option<PathBuf>,
        #[arg(long)]
        requester: Option<String>,
        #[arg(long)]
        json: bool,
    },
    CheckHistory {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        request_id: String,
        #[arg(long)]
        status: StudyStatus,
        #[arg(long)]
        json: bool,
    },
    CheckDuplicates {
        #[arg(long)]
        store: String,
        studies: Vec<PathBuf>,
        /// `agent`, `prefix*` or `*suffix`.
        #[arg(long)]
        requester_scope: Option<String>,
        #[arg(long)]
        quit_at: Option<usize>,
        /// Stop once this many not-run studies are found.
        #[arg(long, conflicts_with_all = ["quit_at", "key"])]
        quota: Option<usize>,
        /// Explicit equality keys; every candidate must carry each one.
        #[arg(long)]
        key: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Mark every RUNNING request in the store as FAILED.
    FailRunning {
        #[arg(long)]
        store: String,
        #[arg(long)]
        json: bool,
    },
    DumpHistory {
        #[arg(long)]
        store: String,
        #[arg(long)]
        study_type: Option<String>,
        #[arg(long)]
        structure_hash: Option<String>,
        #[arg(long)]
        requester: Option<String>,
        #[arg(long)]
        random: Option<usize>,
        #[arg(long, default_value_t = 1)]
        workers: usize,
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let log_dir = cli.log_path.clone().or_else(|| default_log_dir(&cli.command));
    init_tracing(cli.debug_lvl, log_dir.as_deref())?;
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{err:#}"), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(debug_lvl: u8, log_dir: Option<&Path>) -> Result<()> {
    let level = match debug_lvl {
        1 => "trace",
        2 => "debug",
        3 => "info",
        4 => "warn",
        _ => "error",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match log_dir {
        Some(dir) => {
            ensure_dir(dir)?;
            let path = dir.join("studyd.log");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed opening log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(log_dir.is_none()),
        )
        .try_init()
        .map_err(|err| anyhow!("failed to initialise logging: {}", err))
}

fn default_log_dir(command: &Commands) -> Option<PathBuf> {
    match command {
        Commands::Run { root, .. } => Some(worker_layout(root).logs),
        _ => None,
    }
}

fn history_lock_timeout() -> Result<Duration> {
    Ok(DaemonConfig::new(worker_layout(Path::new("."))).with_env_overrides()?.lock_timeout)
}

fn open_store(url: &str) -> Result<SqliteRecordStore> {
    SqliteRecordStore::from_url(url).with_context(|| format!("failed opening record store {}", url))
}

fn open_destination(target: &Target, requester: Option<String>) -> Result<Box<dyn LogDestination>> {
    match (&target.history, &target.store) {
        (Some(path), _) => Ok(Box::new(YamlHistoryFile::new(path))),
        (None, Some(url)) => Ok(Box::new(RecordStoreDestination::new(
            Box::new(open_store(url)?),
            requester,
            DuplicateCriteria::default().list_fields(),
        ))),
        (None, None) => Err(anyhow!("one of --history or --store is required")),
    }
}

fn parse_subject(raw: &str) -> SubjectMatch {
    if let Some(prefix) = raw.strip_suffix('*') {
        SubjectMatch::StartsWith(prefix.to_string())
    } else if let Some(suffix) = raw.strip_prefix('*') {
        SubjectMatch::EndsWith(suffix.to_string())
    } else {
        SubjectMatch::Is(raw.to_string())
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            root,
            history,
            store,
            requester,
            maestro_flags,
            srun,
            cancel_by_signal,
            skip_duplicates,
            cancel_sentinel,
            terminate_sentinel,
            json,
        } => {
            let layout = worker_layout(&root).with_sentinels(cancel_sentinel, terminate_sentinel);
            let config = DaemonConfig::new(layout.clone()).with_env_overrides()?;
            let mut execution = CommandExecutionService::maestro(&maestro_flags, srun);
            if cancel_by_signal {
                execution = execution.cancel_by_signal();
            }
            let list_fields = DuplicateCriteria::default().list_fields();
            let mut daemon = StudyDaemon::new(config, Box::new(execution));
            for path in history {
                daemon = daemon.with_destination(Box::new(YamlHistoryFile::new(path)));
            }
            for url in store {
                daemon = daemon.with_destination(Box::new(RecordStoreDestination::new(
                    Box::new(open_store(&url)?),
                    requester.clone(),
                    list_fields.clone(),
                )));
            }
            if let Some(url) = skip_duplicates {
                daemon = daemon.with_duplicate_filter(DuplicateFilter::new(
                    DuplicateStudyDetector::default(),
                    Box::new(open_store(&url)?),
                    None,
                ));
            }

            let sentinel = layout.terminate_sentinel.clone();
            ctrlc::set_handler(move || {
                if let Err(err) = raise_sentinel(&sentinel) {
                    eprintln!("failed to raise terminate sentinel: {:#}", err);
                }
            })
            .context("failed installing Ctrl-C handler")?;

            let reason = daemon.run()?;
            let reason = match reason {
                TerminationReason::Sentinel => "sentinel",
                TerminationReason::Exhausted => "exhausted",
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "root": root.display().to_string(),
                    "terminated_by": reason
                })));
            }
            println!("terminated: {}", reason);
            Ok(None)
        }
        Commands::AppendHistory {
            target,
            study,
            status,
            result,
            requester,
            json,
        } => {
            let (request_id, descriptors) = read_study_file(&study)?;
            let mut entry = StudyLogEntry::new(&request_id, descriptors, status);
            if let Some(path) = result {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed reading result {}", path.display()))?;
                let values: StudyResult = serde_yaml::from_str(&raw)
                    .with_context(|| format!("invalid result {}", path.display()))?;
                entry = entry.with_result(values)?;
            }
            let mut destination = open_destination(&target, requester)?;
            let report =
                LogReconciler::new().reconcile_and_flush(destination.as_mut(), vec![entry], history_lock_timeout()?)?;
            info!(request_id = %request_id, status = %status, "history appended");
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "append-history",
                    "destination": destination.key().as_str(),
                    "request_id": request_id,
                    "status": status.as_str(),
                    "written": report.written,
                    "unchanged": report.unchanged,
                    "stale": report.stale,
                    "conflicts": report.conflicts.iter().map(|k| k.as_str()).collect::<Vec<_>>()
                })));
            }
            println!(
                "{} {}: written={} unchanged={} stale={} conflicts={}",
                request_id,
                status,
                report.written,
                report.unchanged,
                report.stale,
                report.conflicts.len()
            );
            Ok(None)
        }
        Commands::CheckHistory {
            target,
            request_id,
            status,
            json,
        } => {
            let present = match (&target.history, &target.store) {
                (Some(path), _) => {
                    YamlHistoryFile::new(path).check_in_history(&request_id, status, history_lock_timeout()?)?
                }
                (None, Some(url)) => history::check_in_history(&open_store(url)?, &request_id, status)?,
                (None, None) => return Err(anyhow!("one of --history or --store is required")),
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "check-history",
                    "request_id": request_id,
                    "status": status.as_str(),
                    "present": present
                })));
            }
            println!("{}", present);
            Ok(None)
        }
        Commands::CheckDuplicates {
            store,
            studies,
            requester_scope,
            quit_at,
            quota,
            key,
            json,
        } => {
            let detector = DuplicateStudyDetector::default();
            let list_fields = detector.criteria().list_fields();
            let mut candidates = Vec::with_capacity(studies.len());
            for path in &studies {
                let (request_id, descriptors) = read_study_file(path)?;
                candidates.push(StudyRequest::from_descriptors(request_id, &descriptors, None, &list_fields));
            }
            let backend = open_store(&store)?;
            let scope = requester_scope.as_deref().map(parse_subject);
            let checks = if quota.is_some() {
                history::studies_have_been_run_with_quota(&detector, &backend, &candidates, quota, scope.as_ref())?
            } else {
                let keys = (!key.is_empty()).then_some(key.as_slice());
                detector.study_has_been_run(&backend, &candidates, scope.as_ref(), quit_at, keys)?
            };
            let rows: Vec<Value> = candidates
                .iter()
                .zip(&checks)
                .map(|(candidate, check)| {
                    let (state, existing) = match check {
                        RunCheck::NotRun => ("not_run", None),
                        RunCheck::AlreadyRun(id) => ("already_run", Some(id.clone())),
                        RunCheck::Unknown => ("unknown", None),
                    };
                    json!({
                        "request_id": candidate.request_id,
                        "state": state,
                        "existing": existing
                    })
                })
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "check-duplicates",
                    "results": rows
                })));
            }
            for row in &rows {
                println!(
                    "{}\t{}\t{}",
                    row["request_id"].as_str().unwrap_or_default(),
                    row["state"].as_str().unwrap_or_default(),
                    row["existing"].as_str().unwrap_or("-")
                );
            }
            Ok(None)
        }
        Commands::FailRunning { store, json } => {
            let mut backend = open_store(&store)?;
            let failed = history::fail_running(&mut backend)?;
            info!(count = failed.len(), "marked running requests failed");
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "fail-running",
                    "failed": failed
                })));
            }
            for id in &failed {
                println!("{}", id);
            }
            Ok(None)
        }
        Commands::DumpHistory {
            store,
            study_type,
            structure_hash,
            requester,
            random,
            workers,
            output,
            json,
        } => {
            let backend = open_store(&store)?;
            let query = HistoryQuery {
                study_type,
                structure_hash,
                requester: requester.as_deref().map(parse_subject),
                random,
            };
            let doc = history::load_history(&backend, &query, workers, || SqliteRecordStore::from_url(&store))?;
            if let Some(path) = &output {
                atomic_write_yaml(path, &doc)?;
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "dump-history",
                    "count": doc.history.len(),
                    "output": output.map(|p| p.display().to_string()),
                    "history": serde_json::to_value(&doc.history)?
                })));
            }
            if output.is_none() {
                print!("{}", doc.to_yaml()?);
            }
            Ok(None)
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::AppendHistory { json, .. }
        | Commands::CheckHistory { json, .. }
        | Commands::CheckDuplicates { json, .. }
        | Commands::FailRunning { json, .. }
        | Commands::DumpHistory { json, .. } => *json,
    }
}
