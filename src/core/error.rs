//! Error kinds surfaced by the scheduling core.

use crate::core::task::TaskStatus;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabGpuError {
    #[error("Task {0} already exists")]
    DuplicateTask(u32),

    #[error("Task {0} does not exist")]
    UnknownTask(u32),

    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: u32,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// The per-task log directory could not be created. Fatal to the run attempt.
    #[error("Cannot create log directory {}", path.display())]
    LogDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot open log file {}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch task {task_id}")]
    Spawn {
        task_id: u32,
        #[source]
        source: std::io::Error,
    },

    /// The caller waited for a placement and gave up. Try again later.
    #[error("Task {task_id} was not placed within {waited:?}")]
    Timeout { task_id: u32, waited: Duration },

    #[error("Invalid memory value '{0}'. Expected a number with a trailing 'G', e.g. '10G'")]
    InvalidMemory(String),

    #[error("Invalid priority '{0}'. Expected one of: high, normal, low")]
    InvalidPriority(String),

    #[error("Invalid clock time '{0}'. Expected HH:MM")]
    InvalidClockTime(String),
}

impl LabGpuError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LabGpuError::Timeout { .. })
    }
}

pub type Result<T, E = LabGpuError> = std::result::Result<T, E>;
