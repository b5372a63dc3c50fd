//! Request shapes accepted from outer surfaces (CLI, HTTP façade, SDK).

use crate::core::error::Result;
use crate::core::gpu::{Gpu, Node};
use crate::core::task::{Priority, Task};
use crate::utils::parsers::parse_memory_gb;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use crate::core::scheduler::Placement;

/// A task submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmit {
    pub cmd: String,
    /// e.g. `"10G"`. A bare number is read as GB.
    pub mem: String,
    /// `high`, `normal` or `low`.
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub gpu_type: Option<String>,
    /// Declared wall-clock limit in seconds.
    #[serde(default)]
    pub time_limit: Option<u64>,
    #[serde(default)]
    pub profile_key: Option<String>,
}

impl TaskSubmit {
    /// Validate and turn the request into a task owned by `user`.
    pub fn into_task(self, id: u32, user: &str) -> Result<Task> {
        let min_vram_gb = parse_memory_gb(&self.mem)?;
        let priority = match self.priority.as_deref() {
            Some(p) => Priority::parse(p)?,
            None => Priority::default(),
        };

        Ok(Task::builder()
            .id(id)
            .user(user)
            .cmd(self.cmd)
            .min_vram_gb(min_vram_gb)
            .priority(priority)
            .env(self.env.filter(|e| !e.is_empty()))
            .gpu_type(self.gpu_type.filter(|t| !t.is_empty()))
            .time_limit(self.time_limit.map(Duration::from_secs))
            .profile_key(self.profile_key)
            .build())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDescriptor {
    pub id: u32,
    pub total_vram_gb: f64,
    #[serde(default)]
    pub used_vram_gb: f64,
    #[serde(default)]
    pub gpu_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRegistration {
    #[serde(alias = "name")]
    pub node: String,
    #[serde(default)]
    pub gpu_type: Option<String>,
    pub gpus: Vec<GpuDescriptor>,
}

impl NodeRegistration {
    /// The node's type comes from the registration, else from the first GPU
    /// descriptor that names one.
    pub fn into_node(self) -> Node {
        let gpu_type = self
            .gpu_type
            .or_else(|| self.gpus.iter().find_map(|g| g.gpu_type.clone()));
        let gpus = self
            .gpus
            .into_iter()
            .map(|g| Gpu::new(g.id, g.total_vram_gb).with_used(g.used_vram_gb))
            .collect();

        let mut node = Node::new(CompactString::from(self.node), gpus);
        if let Some(gpu_type) = gpu_type {
            node = node.with_gpu_type(gpu_type);
        }
        node
    }
}
