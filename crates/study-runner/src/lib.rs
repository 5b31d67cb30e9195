//! Orchestration: log destinations, the pending-write reconciler, the
//! execution adapter, inbox handling and the daemon loop.

pub mod config;
pub mod daemon;
pub mod destination;
pub mod execution;
pub mod inbox;
pub mod reconciler;
#[cfg(test)]
mod test_support;

pub use config::DaemonConfig;
pub use daemon::{CycleOutcome, DaemonState, DuplicateFilter, RunningStudy, StudyDaemon, TerminationReason};
pub use destination::{
    CommitError, CommitReport, DestinationKey, LogDestination, RecordStoreDestination, YamlHistoryFile,
};
pub use execution::{CommandExecutionService, ExecutionService, StudyHandle};
pub use reconciler::LogReconciler;
