use crate::core::error::{LabGpuError, Result};
use crate::core::gpu::Node;
use crate::core::policy::SchedulerPolicy;
use crate::core::profile::TaskProfiles;
use crate::core::round2;
use crate::core::task::{Assignment, Priority, Task, TaskStatus};
use chrono::{Local, NaiveTime};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::SystemTime;

/// Headroom added on top of the amount an OOM'd task failed to allocate.
pub const OOM_MARGIN_GB: f64 = 1.0;

/// Score lost per task the same user already has running.
pub const FAIR_SHARE_PENALTY: f64 = 0.1;

/// One placement decided during a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub task_id: u32,
    pub node: CompactString,
    pub gpu_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OomRecovery {
    /// Back in the queue with a higher memory floor.
    Requeued { min_vram_gb: f64, retry_count: u32 },
    /// The retry ceiling was reached; the task is FAILED.
    GaveUp { retry_count: u32 },
}

/// Placement engine: owns every submitted task and the pending queue.
///
/// A tick (`schedule`) reads and mutates GPU bookings and task status as one
/// unit. Callers sharing a scheduler must serialize ticks.
pub struct Scheduler {
    policy: SchedulerPolicy,
    profiles: TaskProfiles,
    tasks: HashMap<u32, Task>,
    pending_queue: VecDeque<u32>,
    /// Tasks an operator moved to the front; considered before any scored task.
    pinned: HashSet<u32>,
    /// Running task count per user, for fair share.
    active_counts: HashMap<CompactString, usize>,
    /// Bookings of tasks that left RUNNING and still need to be returned to their GPU.
    vacated: Vec<Assignment>,
    next_task_id: u32,
}

impl Default for Scheduler {
    fn default() -> Self {
        SchedulerBuilder::new().build()
    }
}

impl Scheduler {
    pub fn new(policy: SchedulerPolicy) -> Self {
        SchedulerBuilder::new().with_policy(policy).build()
    }

    pub fn policy(&self) -> &SchedulerPolicy {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut SchedulerPolicy {
        &mut self.policy
    }

    pub fn profiles(&self) -> &TaskProfiles {
        &self.profiles
    }

    pub fn profiles_mut(&mut self) -> &mut TaskProfiles {
        &mut self.profiles
    }

    pub fn task(&self, task_id: u32) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    /// All tasks, in id order.
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub fn tasks_len(&self) -> usize {
        self.tasks.len()
    }

    /// Queue contents in insertion order (not the scheduling order).
    pub fn pending_ids(&self) -> Vec<u32> {
        self.pending_queue.iter().copied().collect()
    }

    pub fn running_count(&self, user: &str) -> usize {
        self.active_counts.get(user).copied().unwrap_or(0)
    }

    pub fn is_night_at(&self, time: NaiveTime) -> bool {
        self.policy.is_night_at(time)
    }

    /// Hand out the next free task id.
    pub fn allocate_task_id(&mut self) -> u32 {
        while self.tasks.contains_key(&self.next_task_id) {
            self.next_task_id += 1;
        }
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    /// Register a task and queue it. Ids are unique; resubmitting one is rejected.
    pub fn submit(&mut self, mut task: Task) -> Result<u32> {
        let task_id = task.id;
        if self.tasks.contains_key(&task_id) {
            return Err(LabGpuError::DuplicateTask(task_id));
        }

        // Runtime-managed fields always start clean.
        task.status = TaskStatus::Pending;
        task.assignment = None;
        task.started_at = None;

        if let Some(key) = task.profile_key.as_deref() {
            if task.min_vram_gb > 0.0 && self.profiles.seed(key, task.min_vram_gb) {
                tracing::debug!("Seeded profile '{}' with {:.2} GB", key, task.min_vram_gb);
            }
        }

        tracing::debug!(
            "Submitted task {} ({}, {:.2} GB, user {})",
            task_id,
            task.priority,
            task.min_vram_gb,
            task.user
        );
        self.tasks.insert(task_id, task);
        self.enqueue(task_id);
        Ok(task_id)
    }

    fn enqueue(&mut self, task_id: u32) {
        if !self.pending_queue.contains(&task_id) {
            self.pending_queue.push_back(task_id);
        }
    }

    fn dequeue(&mut self, task_id: u32) {
        self.pending_queue.retain(|id| *id != task_id);
        self.pinned.remove(&task_id);
    }

    /// Priority weight, minus a penalty per running task of the same user,
    /// plus the night bonus for LOW tasks.
    pub fn fair_share_score(&self, task: &Task, night: bool) -> f64 {
        let active = self.running_count(&task.user) as f64;
        let mut score = task.priority.weight() - active * FAIR_SHARE_PENALTY;
        if night && task.priority == Priority::Low {
            score += self.policy.night_low_bonus;
        }
        score
    }

    /// Pending task ids in the order a tick at `now` would consider them.
    pub fn pending_order_at(&self, now: NaiveTime) -> Vec<u32> {
        self.ordered_pending(self.is_night_at(now))
    }

    fn ordered_pending(&self, night: bool) -> Vec<u32> {
        let pending = self
            .pending_queue
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.status == TaskStatus::Pending);

        let mut pinned = Vec::new();
        let mut scored = Vec::new();
        for task in pending {
            if self.pinned.contains(&task.id) {
                pinned.push(task.id);
            } else {
                scored.push((task.id, self.fair_share_score(task, night), task.submitted_at));
            }
        }

        scored.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.0.cmp(&b.0))
        });

        pinned.extend(scored.into_iter().map(|(id, _, _)| id));
        pinned
    }

    /// Fill in unspecified requirements from learned profiles. The estimate
    /// sticks to the task from then on.
    fn resolve_estimates(&mut self) {
        for task_id in &self.pending_queue {
            let Some(task) = self.tasks.get_mut(task_id) else {
                continue;
            };
            if task.min_vram_gb > 0.0 {
                continue;
            }
            let Some(profile) = task.profile_key.as_deref().and_then(|k| self.profiles.get(k))
            else {
                continue;
            };
            if profile.peak_vram_gb > 0.0 {
                tracing::info!(
                    "Task {} has no memory requirement, using profile estimate {:.2} GB",
                    task.id,
                    profile.peak_vram_gb
                );
                task.min_vram_gb = profile.peak_vram_gb;
            }
        }
    }

    fn find_slot(task: &Task, nodes: &[Node]) -> Option<(usize, usize)> {
        nodes.iter().enumerate().find_map(|(ni, node)| {
            if !node.matches_type(task.gpu_type.as_deref()) {
                return None;
            }
            node.gpus
                .iter()
                .position(|gpu| !gpu.zombie && gpu.free_vram_gb() >= task.min_vram_gb)
                .map(|gi| (ni, gi))
        })
    }

    fn backfill_ok(&self, task: &Task, night: bool) -> bool {
        let short = task
            .time_limit
            .is_some_and(|limit| limit <= self.policy.backfill_time_limit);
        short || (night && task.priority == Priority::Low)
    }

    /// Run one scheduling tick against the host wall clock.
    pub fn schedule(&mut self, nodes: &mut [Node]) -> Vec<Placement> {
        self.schedule_at(nodes, Local::now().time())
    }

    /// Run one scheduling tick as if the time of day were `now`.
    ///
    /// If the top-ranked task fits nowhere, only backfill-eligible tasks (short
    /// time limit, or LOW priority at night) may be placed behind it.
    pub fn schedule_at(&mut self, nodes: &mut [Node], now: NaiveTime) -> Vec<Placement> {
        self.release_vacated(nodes);
        self.resolve_estimates();

        let night = self.is_night_at(now);
        let ordered = self.ordered_pending(night);
        let Some(&head) = ordered.first() else {
            return Vec::new();
        };

        let head_placeable = self
            .tasks
            .get(&head)
            .is_some_and(|t| Self::find_slot(t, nodes).is_some());
        if !head_placeable {
            tracing::debug!("Head task {} fits nowhere, backfilling only", head);
        }

        let mut placements = Vec::new();
        for task_id in ordered {
            let Some(task) = self.tasks.get(&task_id) else {
                continue;
            };

            if task_id != head && !head_placeable && !self.backfill_ok(task, night) {
                tracing::debug!("Task {} held behind blocked head {}", task_id, head);
                continue;
            }

            let Some((ni, gi)) = Self::find_slot(task, nodes) else {
                tracing::debug!(
                    "Task {} waiting for {:.2} GB{}",
                    task_id,
                    task.min_vram_gb,
                    task.gpu_type
                        .as_deref()
                        .map(|t| format!(" on {t}"))
                        .unwrap_or_default()
                );
                continue;
            };

            let vram_gb = task.min_vram_gb;
            let node = &mut nodes[ni];
            let gpu = &mut node.gpus[gi];
            gpu.book(vram_gb);

            let assignment = Assignment {
                node: node.name.clone(),
                gpu: gpu.id,
                vram_gb,
            };
            tracing::info!(
                "Placed task {} on {} gpu:{} ({:.2} GB)",
                task_id,
                assignment.node,
                assignment.gpu,
                vram_gb
            );
            placements.push(Placement {
                task_id,
                node: assignment.node.clone(),
                gpu_id: assignment.gpu,
            });
            self.start_task(task_id, assignment);
        }

        placements
    }

    fn start_task(&mut self, task_id: u32, assignment: Assignment) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        task.status = TaskStatus::Running;
        task.started_at = Some(SystemTime::now());
        task.assignment = Some(assignment);
        *self.active_counts.entry(task.user.clone()).or_insert(0) += 1;
        self.dequeue(task_id);
    }

    /// Validated status change with queue, fair-share and booking upkeep.
    fn transition(&mut self, task_id: u32, to: TaskStatus) -> Result<()> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(LabGpuError::UnknownTask(task_id))?;
        let from = task.status;
        if !from.can_transition_to(to) {
            return Err(LabGpuError::InvalidTransition {
                id: task_id,
                from,
                to,
            });
        }

        task.status = to;
        if from == TaskStatus::Running {
            if let Some(assignment) = task.assignment.take() {
                self.vacated.push(assignment);
            }
            if let Some(count) = self.active_counts.get_mut(&task.user) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.active_counts.remove(&task.user);
                }
            }
        }

        if to == TaskStatus::Pending {
            task.started_at = None;
            task.assignment = None;
            self.enqueue(task_id);
        } else {
            self.dequeue(task_id);
        }
        Ok(())
    }

    /// Move a task to SUCCEEDED or FAILED.
    pub fn finish_task(&mut self, task_id: u32, status: TaskStatus) -> Result<()> {
        if !status.is_terminal() {
            let from = self
                .task(task_id)
                .map(|t| t.status)
                .ok_or(LabGpuError::UnknownTask(task_id))?;
            return Err(LabGpuError::InvalidTransition {
                id: task_id,
                from,
                to: status,
            });
        }
        self.transition(task_id, status)
    }

    /// Raise the task's memory floor by what it failed to allocate plus a
    /// safety margin, and queue it again.
    pub fn apply_oom_recovery(&mut self, task_id: u32, missing_gb: f64) -> Result<OomRecovery> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or(LabGpuError::UnknownTask(task_id))?;
        let (status, retry_count) = (task.status, task.retry_count);

        if let Some(max) = self.policy.max_oom_retries {
            if retry_count >= max {
                if status != TaskStatus::Failed {
                    self.transition(task_id, TaskStatus::Failed)?;
                }
                tracing::warn!(
                    "Task {} hit OOM again after {} retries, giving up",
                    task_id,
                    retry_count
                );
                return Ok(OomRecovery::GaveUp { retry_count });
            }
        }

        if status != TaskStatus::Pending {
            self.transition(task_id, TaskStatus::Pending)?;
        }

        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(LabGpuError::UnknownTask(task_id))?;
        task.min_vram_gb = round2(task.min_vram_gb + missing_gb + OOM_MARGIN_GB);
        task.retry_count += 1;
        let recovery = OomRecovery::Requeued {
            min_vram_gb: task.min_vram_gb,
            retry_count: task.retry_count,
        };
        tracing::info!(
            "Task {} re-queued after OOM with {:.2} GB (retry {})",
            task_id,
            task.min_vram_gb,
            task.retry_count
        );
        self.enqueue(task_id);
        Ok(recovery)
    }

    /// Put a pending task ahead of everything else. Returns false if the
    /// task is not pending.
    pub fn move_to_front(&mut self, task_id: u32) -> Result<bool> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or(LabGpuError::UnknownTask(task_id))?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        self.pending_queue.retain(|id| *id != task_id);
        self.pending_queue.push_front(task_id);
        self.pinned.insert(task_id);
        Ok(true)
    }

    /// Manual retry: back to PENDING with no assignment.
    pub fn reset_task(&mut self, task_id: u32) -> Result<()> {
        let status = self
            .task(task_id)
            .map(|t| t.status)
            .ok_or(LabGpuError::UnknownTask(task_id))?;
        if status == TaskStatus::Pending {
            self.enqueue(task_id);
            return Ok(());
        }
        self.transition(task_id, TaskStatus::Pending)
    }

    /// Give bookings of tasks that left RUNNING back to their GPUs.
    pub fn release_vacated(&mut self, nodes: &mut [Node]) {
        for assignment in self.vacated.drain(..) {
            let gpu = nodes
                .iter_mut()
                .find(|n| n.name == assignment.node)
                .and_then(|n| n.gpu_mut(assignment.gpu));
            match gpu {
                Some(gpu) => gpu.release(assignment.vram_gb),
                None => tracing::debug!(
                    "GPU {}:{} is gone, dropping {:.2} GB booking",
                    assignment.node,
                    assignment.gpu,
                    assignment.vram_gb
                ),
            }
        }
    }
}

/// Builder for creating Scheduler instances with injected policy and profiles
pub struct SchedulerBuilder {
    policy: SchedulerPolicy,
    profiles: TaskProfiles,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            policy: SchedulerPolicy::default(),
            profiles: TaskProfiles::default(),
        }
    }

    pub fn with_policy(mut self, policy: SchedulerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_profiles(mut self, profiles: TaskProfiles) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn build(self) -> Scheduler {
        Scheduler {
            policy: self.policy,
            profiles: self.profiles,
            tasks: HashMap::new(),
            pending_queue: VecDeque::new(),
            pinned: HashSet::new(),
            active_counts: HashMap::new(),
            vacated: Vec::new(),
            next_task_id: 1,
        }
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
