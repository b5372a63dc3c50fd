use crate::core::error::LabGpuError;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use strum::{Display, EnumIter, EnumString};

#[derive(
    Debug,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    Display,
    EnumIter,
    EnumString,
    Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Base weight of the fair-share score.
    pub fn weight(self) -> f64 {
        match self {
            Priority::High => 3.0,
            Priority::Normal => 2.0,
            Priority::Low => 1.0,
        }
    }

    pub fn parse(value: &str) -> Result<Self, LabGpuError> {
        Priority::from_str(value.trim()).map_err(|_| LabGpuError::InvalidPriority(value.into()))
    }
}

#[derive(
    Debug, Deserialize, Serialize, PartialEq, Eq, Hash, Clone, Copy, Display, EnumIter, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Failed,
    Succeeded,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Succeeded)
    }

    /// Legal status moves. `Running -> Pending` and `Failed -> Pending` are the
    /// re-queue paths (OOM recovery and manual reset).
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Pending)
                | (Failed, Pending)
        )
    }
}

/// Where a running task lives and how much VRAM was booked for it.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Assignment {
    pub node: CompactString,
    pub gpu: u32,
    pub vram_gb: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Task {
    pub id: u32,
    pub user: CompactString,
    pub cmd: String,
    /// Minimum VRAM in GB. Zero means "unspecified".
    pub min_vram_gb: f64,
    pub priority: Priority,
    pub status: TaskStatus,
    pub gpu_type: Option<CompactString>,
    pub env: Option<String>,
    pub time_limit: Option<Duration>,
    pub submitted_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub retry_count: u32,
    pub assignment: Option<Assignment>,
    /// Key into the learned task profiles, e.g. "alice:train".
    pub profile_key: Option<String>,
}

impl Task {
    pub fn builder() -> TaskBuilder {
        TaskBuilder::new()
    }

    pub fn assigned_node(&self) -> Option<&str> {
        self.assignment.as_ref().map(|a| a.node.as_str())
    }

    pub fn assigned_gpu(&self) -> Option<u32> {
        self.assignment.as_ref().map(|a| a.gpu)
    }

    /// Short label for status listings.
    pub fn label(&self) -> String {
        self.cmd.chars().take(60).collect()
    }
}

#[derive(Default)]
pub struct TaskBuilder {
    id: u32,
    user: CompactString,
    cmd: String,
    min_vram_gb: f64,
    priority: Priority,
    gpu_type: Option<CompactString>,
    env: Option<String>,
    time_limit: Option<Duration>,
    submitted_at: Option<SystemTime>,
    profile_key: Option<String>,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    pub fn user(mut self, user: impl Into<CompactString>) -> Self {
        self.user = user.into();
        self
    }

    pub fn cmd(mut self, cmd: impl Into<String>) -> Self {
        self.cmd = cmd.into();
        self
    }

    pub fn min_vram_gb(mut self, gb: f64) -> Self {
        self.min_vram_gb = gb;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn gpu_type(mut self, gpu_type: Option<impl Into<CompactString>>) -> Self {
        self.gpu_type = gpu_type.map(Into::into);
        self
    }

    pub fn env(mut self, env: Option<String>) -> Self {
        self.env = env;
        self
    }

    pub fn time_limit(mut self, time_limit: Option<Duration>) -> Self {
        self.time_limit = time_limit;
        self
    }

    pub fn submitted_at(mut self, submitted_at: SystemTime) -> Self {
        self.submitted_at = Some(submitted_at);
        self
    }

    pub fn profile_key(mut self, key: Option<impl Into<String>>) -> Self {
        self.profile_key = key.map(Into::into);
        self
    }

    pub fn build(self) -> Task {
        Task {
            id: self.id,
            user: self.user,
            cmd: self.cmd,
            min_vram_gb: self.min_vram_gb,
            priority: self.priority,
            status: TaskStatus::Pending,
            gpu_type: self.gpu_type,
            env: self.env,
            time_limit: self.time_limit,
            submitted_at: self.submitted_at.unwrap_or_else(SystemTime::now),
            started_at: None,
            retry_count: 0,
            assignment: None,
            profile_key: self.profile_key,
        }
    }
}

/// Result of spotting an out-of-memory diagnostic in a task's stderr.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct OomSignal {
    pub task_id: u32,
    pub missing_gb: f64,
    pub new_min_vram_gb: f64,
}

/// A live OS process backing a running task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRuntime {
    pub task_id: u32,
    pub pid: u32,
    pub log_path: PathBuf,
    pub started_at: SystemTime,
}

impl TaskRuntime {
    pub fn new(task_id: u32, pid: u32, log_path: PathBuf) -> Self {
        Self {
            task_id,
            pid,
            log_path,
            started_at: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_priority_parse() {
        assert_eq!(Priority::parse("high").unwrap(), Priority::High);
        assert_eq!(Priority::parse("NORMAL").unwrap(), Priority::Normal);
        assert_eq!(Priority::parse(" low ").unwrap(), Priority::Low);
        assert!(matches!(
            Priority::parse("urgent"),
            Err(LabGpuError::InvalidPriority(_))
        ));
    }

    #[test]
    fn test_priority_weights_are_ordered() {
        assert!(Priority::High.weight() > Priority::Normal.weight());
        assert!(Priority::Normal.weight() > Priority::Low.weight());
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Succeeded.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Succeeded));

        // Nothing moves to itself.
        for status in TaskStatus::iter() {
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn test_builder_defaults() {
        let task = Task::builder().id(7).user("alice").cmd("python train.py").build();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::Normal);
        assert_eq!(task.retry_count, 0);
        assert!(task.assignment.is_none());
        assert_eq!(task.assigned_node(), None);
    }

    #[test]
    fn test_label_is_truncated() {
        let task = Task::builder().cmd("x".repeat(100)).build();
        assert_eq!(task.label().len(), 60);
    }
}
