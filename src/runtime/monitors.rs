use super::{Runtime, SharedMaster};
use crate::agent::sampler::ProcessSampler;
use crate::agent::zombie::{ProcessSample, ZombieThresholds};
use crate::api::Placement;
use crate::core::error::{LabGpuError, Result};
use crate::core::task::TaskStatus;
use chrono::{Local, NaiveTime};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

impl Runtime {
    /// Sample local GPU processes and flag the GPUs hosting idle VRAM holders.
    pub async fn scan_zombies(&self, sampler: &mut dyn ProcessSampler) -> anyhow::Result<Vec<u32>> {
        self.scan_zombies_at(sampler, Local::now().time()).await
    }

    pub async fn scan_zombies_at(
        &self,
        sampler: &mut dyn ProcessSampler,
        now: NaiveTime,
    ) -> anyhow::Result<Vec<u32>> {
        let processes = sampler.sample()?;
        let samples: Vec<ProcessSample> = processes.iter().map(|p| p.sample.clone()).collect();

        let mut master = self.master.lock().await;
        let policy = master.scheduler().policy();
        let thresholds = ZombieThresholds {
            idle_util_pct: policy.idle_util_threshold_pct(policy.is_night_at(now)),
            min_duration: self.settings.zombie_min_duration,
        };

        let zombies = master.agent().detect_zombies(&samples, &thresholds);
        for pid in &zombies {
            tracing::warn!("Process {} holds GPU memory without doing any work", pid);
        }

        let gpus: HashSet<u32> = processes
            .iter()
            .filter(|p| zombies.contains(&p.sample.pid))
            .map(|p| p.gpu)
            .collect();
        master.flag_zombie_gpus(&self.settings.node_name, &gpus);

        let util_pct: HashMap<u32, f64> = processes
            .iter()
            .map(|p| (p.gpu, p.sample.util_pct))
            .collect();
        master.record_utilization(&self.settings.node_name, &util_pct);
        Ok(zombies)
    }
}

/// Poll until `task_id` is RUNNING and return where it landed.
///
/// Gives up with [`LabGpuError::Timeout`] once `timeout` has passed; a zero
/// timeout checks exactly once.
pub async fn wait_for_placement(
    shared: &SharedMaster,
    task_id: u32,
    timeout: Duration,
    poll: Duration,
) -> Result<Placement> {
    let deadline = Instant::now() + timeout;
    loop {
        {
            let master = shared.lock().await;
            let task = master
                .task(task_id)
                .ok_or(LabGpuError::UnknownTask(task_id))?;
            if task.status == TaskStatus::Running {
                if let Some(assignment) = &task.assignment {
                    return Ok(Placement {
                        task_id,
                        node: assignment.node.clone(),
                        gpu_id: assignment.gpu,
                    });
                }
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(LabGpuError::Timeout {
                task_id,
                waited: timeout,
            });
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}
