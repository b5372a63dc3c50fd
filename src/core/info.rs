use crate::core::task::TaskStatus;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// How many terminal tasks a status summary lists.
pub const RECENT_HISTORY_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningTask {
    pub task_id: u32,
    pub user: CompactString,
    pub label: String,
    pub node: Option<CompactString>,
    pub gpu: Option<u32>,
}

/// A task as it was when it reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task_id: u32,
    pub status: TaskStatus,
    pub node: Option<CompactString>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total_tasks: usize,
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
    pub total_gpus: usize,
    pub busy_gpus: usize,
    /// Running tasks owned by the caller.
    pub my_running: usize,
    pub oom_events: u64,
    pub last_oom_task: Option<u32>,
    pub running_tasks: Vec<RunningTask>,
    /// Most recent first.
    pub recent: Vec<HistoryEntry>,
}
