pub mod error;
pub mod gpu;
pub mod info;
pub mod policy;
pub mod profile;
pub mod scheduler;
pub mod task;

use std::path::{Path, PathBuf};

const VERSION_MESSAGE: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_BUILD_TIMESTAMP"),
    ")\n",
    "Branch: ",
    env!("VERGEN_GIT_BRANCH"),
    "\nCommit: ",
    env!("VERGEN_GIT_SHA"),
);

pub fn version() -> &'static str {
    VERSION_MESSAGE
}

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("labgpu"))
}

pub fn get_data_dir() -> anyhow::Result<PathBuf> {
    dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get data directory"))
        .map(|p| p.join("labgpu"))
}

/// Default root for per-task log files.
pub fn default_log_root() -> anyhow::Result<PathBuf> {
    get_data_dir().map(|d| d.join("tasks"))
}

/// One append-only log file per task, keyed by id.
pub fn task_log_path(log_root: &Path, task_id: u32) -> PathBuf {
    log_root.join(format!("{task_id}.log"))
}

/// Round to two decimal places, the precision VRAM figures are reported in.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
