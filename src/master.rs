//! The orchestrator: node registry, live task processes, OOM bookkeeping and
//! preemption.

use crate::agent::Agent;
use crate::api::{NodeRegistration, Placement, TaskSubmit};
use crate::core::error::{LabGpuError, Result};
use crate::core::gpu::Node;
use crate::core::info::{HistoryEntry, RunningTask, StatusSummary, RECENT_HISTORY_LEN};
use crate::core::scheduler::{OomRecovery, Scheduler};
use crate::core::task::{OomSignal, Task, TaskRuntime, TaskStatus};
use chrono::NaiveTime;
use compact_str::CompactString;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;
use strum::Display;
use tokio::time::Instant;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;
pub const DEFAULT_SOFT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_TERM_TIMEOUT: Duration = Duration::from_secs(30);
/// Escalation windows used when an operator kills a task.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum PreemptOutcome {
    /// No live process was recorded for the task.
    NotRunning,
    /// Exited after the checkpoint request.
    SoftExit,
    /// Exited after SIGTERM.
    TermExit,
    Killed,
}

/// Checkpoint request, then terminate, then kill.
///
/// Each stage waits up to its timeout for the process to disappear, polling
/// liveness every `poll`. Always ends; signal errors are logged, not returned.
pub async fn escalate(
    agent: &Agent,
    runtime: &TaskRuntime,
    soft_timeout: Duration,
    term_timeout: Duration,
    poll: Duration,
) -> PreemptOutcome {
    let (task_id, pid) = (runtime.task_id, runtime.pid);

    tracing::info!("Preempting task {} (pid {}): checkpoint requested", task_id, pid);
    if let Err(e) = agent.soft_preempt(pid, &runtime.log_path).await {
        tracing::warn!("Checkpoint signal to pid {} failed: {}", pid, e);
    }
    if wait_for_exit(agent, pid, soft_timeout, poll).await {
        return PreemptOutcome::SoftExit;
    }

    tracing::info!("Task {} still alive after {:?}, terminating", task_id, soft_timeout);
    if let Err(e) = agent.hard_preempt(pid) {
        tracing::warn!("SIGTERM to pid {} failed: {}", pid, e);
    }
    if wait_for_exit(agent, pid, term_timeout, poll).await {
        return PreemptOutcome::TermExit;
    }

    tracing::info!("Task {} still alive after {:?}, killing", task_id, term_timeout);
    if let Err(e) = agent.force_kill(pid) {
        tracing::warn!("SIGKILL to pid {} failed: {}", pid, e);
    }
    PreemptOutcome::Killed
}

async fn wait_for_exit(agent: &Agent, pid: u32, timeout: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !agent.is_alive(pid) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

pub struct Master {
    scheduler: Scheduler,
    agent: Agent,
    /// Registry order is placement scan order.
    nodes: Vec<Node>,
    runtimes: HashMap<u32, TaskRuntime>,
    history: VecDeque<HistoryEntry>,
    history_capacity: usize,
    oom_events: u64,
    last_oom_task: Option<u32>,
    poll_interval: Duration,
}

impl Default for Master {
    fn default() -> Self {
        MasterBuilder::new().build()
    }
}

impl Master {
    pub fn builder() -> MasterBuilder {
        MasterBuilder::new()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn task(&self, task_id: u32) -> Option<&Task> {
        self.scheduler.task(task_id)
    }

    pub fn oom_events(&self) -> u64 {
        self.oom_events
    }

    pub fn last_oom_task(&self) -> Option<u32> {
        self.last_oom_task
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    /// Add a node, or replace the one with the same name in place.
    pub fn register_node(&mut self, node: Node) {
        tracing::info!("Registered node {} with {} GPU(s)", node.name, node.gpus.len());
        match self.nodes.iter_mut().find(|n| n.name == node.name) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    pub fn register_request(&mut self, request: NodeRegistration) -> CompactString {
        let node = request.into_node();
        let name = node.name.clone();
        self.register_node(node);
        name
    }

    /// Set or clear the zombie flag on a node's GPUs. Returns how many flags changed.
    pub fn flag_zombie_gpus(&mut self, node_name: &str, zombie_gpus: &HashSet<u32>) -> usize {
        let Some(node) = self.nodes.iter_mut().find(|n| n.name == node_name) else {
            return 0;
        };
        let mut changed = 0;
        for gpu in &mut node.gpus {
            let zombie = zombie_gpus.contains(&gpu.id);
            if gpu.zombie != zombie {
                if zombie {
                    tracing::warn!("GPU {}:{} hosts an idle VRAM holder", node_name, gpu.id);
                } else {
                    tracing::info!("GPU {}:{} no longer hosts an idle VRAM holder", node_name, gpu.id);
                }
                gpu.zombie = zombie;
                changed += 1;
            }
        }
        changed
    }

    /// Store sampled utilization on a node's GPUs. GPUs missing from
    /// `util_pct` had no compute process and read as idle.
    pub fn record_utilization(&mut self, node_name: &str, util_pct: &HashMap<u32, f64>) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.name == node_name) {
            for gpu in &mut node.gpus {
                gpu.util_pct = util_pct.get(&gpu.id).copied().unwrap_or(0.0);
            }
        }
    }

    pub fn submit(&mut self, task: Task) -> Result<u32> {
        self.scheduler.submit(task)
    }

    /// Validate a submission, assign it the next id and queue it.
    pub fn submit_request(&mut self, request: TaskSubmit, user: &str) -> Result<u32> {
        let task_id = self.scheduler.allocate_task_id();
        let task = request.into_task(task_id, user)?;
        self.scheduler.submit(task)
    }

    pub fn schedule_once(&mut self) -> Vec<Placement> {
        self.scheduler.schedule(&mut self.nodes)
    }

    pub fn schedule_once_at(&mut self, now: NaiveTime) -> Vec<Placement> {
        self.scheduler.schedule_at(&mut self.nodes, now)
    }

    pub fn on_oom(&mut self, signal: &OomSignal) -> Result<OomRecovery> {
        self.oom_events += 1;
        self.last_oom_task = Some(signal.task_id);

        let node = self.assigned_node(signal.task_id);
        let recovery = self
            .scheduler
            .apply_oom_recovery(signal.task_id, signal.missing_gb)?;
        if let OomRecovery::GaveUp { .. } = recovery {
            self.record_history(signal.task_id, TaskStatus::Failed, node);
        }
        self.scheduler.release_vacated(&mut self.nodes);
        Ok(recovery)
    }

    pub fn mark_succeeded(&mut self, task_id: u32) -> Result<()> {
        self.finish(task_id, TaskStatus::Succeeded)
    }

    pub fn mark_failed(&mut self, task_id: u32) -> Result<()> {
        self.finish(task_id, TaskStatus::Failed)
    }

    fn finish(&mut self, task_id: u32, status: TaskStatus) -> Result<()> {
        let node = self.assigned_node(task_id);
        self.scheduler.finish_task(task_id, status)?;
        self.scheduler.release_vacated(&mut self.nodes);
        tracing::info!("Task {} {}", task_id, status);
        self.record_history(task_id, status, node);
        Ok(())
    }

    fn assigned_node(&self, task_id: u32) -> Option<CompactString> {
        self.scheduler
            .task(task_id)
            .and_then(|t| t.assignment.as_ref())
            .map(|a| a.node.clone())
    }

    fn record_history(&mut self, task_id: u32, status: TaskStatus, node: Option<CompactString>) {
        if self.history_capacity == 0 {
            return;
        }
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            task_id,
            status,
            node,
        });
    }

    pub fn register_runtime(&mut self, task_id: u32, pid: u32, log_path: PathBuf) {
        self.runtimes
            .insert(task_id, TaskRuntime::new(task_id, pid, log_path));
    }

    pub fn clear_runtime(&mut self, task_id: u32) -> Option<TaskRuntime> {
        self.runtimes.remove(&task_id)
    }

    pub fn runtime(&self, task_id: u32) -> Option<&TaskRuntime> {
        self.runtimes.get(&task_id)
    }

    /// Apply a finished process to its task.
    ///
    /// Events for a pid other than the registered one, or for a task that is no
    /// longer RUNNING (killed, already recovered), are stale and ignored.
    pub fn on_process_exit(
        &mut self,
        task_id: u32,
        pid: u32,
        exit_code: i32,
        oom: Option<&OomSignal>,
    ) -> Result<()> {
        if let Some(runtime) = self.runtimes.get(&task_id) {
            if runtime.pid != pid {
                tracing::warn!(
                    "Ignoring exit of pid {} for task {}: pid {} is registered",
                    pid,
                    task_id,
                    runtime.pid
                );
                return Ok(());
            }
        }

        let status = self
            .scheduler
            .task(task_id)
            .map(|t| t.status)
            .ok_or(LabGpuError::UnknownTask(task_id))?;
        self.clear_runtime(task_id);
        if status != TaskStatus::Running {
            tracing::warn!("Ignoring exit of task {} in status {}", task_id, status);
            return Ok(());
        }

        match (exit_code, oom) {
            (0, _) => self.mark_succeeded(task_id),
            (_, Some(signal)) => self.on_oom(signal).map(|_| ()),
            _ => {
                tracing::info!("Task {} exited with code {}", task_id, exit_code);
                self.mark_failed(task_id)
            }
        }
    }

    /// Graduated preemption of a task's live process. The runtime entry is
    /// cleared afterwards; task status is left to the exit event.
    pub async fn preempt_task(
        &mut self,
        task_id: u32,
        soft_timeout: Duration,
        term_timeout: Duration,
    ) -> PreemptOutcome {
        let Some(runtime) = self.runtimes.get(&task_id).cloned() else {
            return PreemptOutcome::NotRunning;
        };
        let outcome = escalate(
            &self.agent,
            &runtime,
            soft_timeout,
            term_timeout,
            self.poll_interval,
        )
        .await;
        self.clear_runtime(task_id);
        tracing::info!("Preemption of task {} ended: {}", task_id, outcome);
        outcome
    }

    pub fn retry_task(&mut self, task_id: u32) -> Result<()> {
        self.scheduler.reset_task(task_id)?;
        self.scheduler.release_vacated(&mut self.nodes);
        Ok(())
    }

    pub fn move_task_to_front(&mut self, task_id: u32) -> Result<bool> {
        self.scheduler.move_to_front(task_id)
    }

    /// Stop a task for good: preempt with short windows, then mark it FAILED.
    pub async fn kill_task(&mut self, task_id: u32) -> Result<PreemptOutcome> {
        let status = self
            .scheduler
            .task(task_id)
            .map(|t| t.status)
            .ok_or(LabGpuError::UnknownTask(task_id))?;

        let outcome = self.preempt_task(task_id, KILL_TIMEOUT, KILL_TIMEOUT).await;
        if !status.is_terminal() {
            self.mark_failed(task_id)?;
        }
        Ok(outcome)
    }

    /// Counts, the caller's share, and recent endings.
    pub fn summary(&self, user: &str) -> StatusSummary {
        let tasks = self.scheduler.tasks();
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();

        let running_tasks: Vec<RunningTask> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| RunningTask {
                task_id: t.id,
                user: t.user.clone(),
                label: t.label(),
                node: t.assignment.as_ref().map(|a| a.node.clone()),
                gpu: t.assigned_gpu(),
            })
            .collect();

        let gpus = self.nodes.iter().flat_map(|n| n.gpus.iter());

        StatusSummary {
            total_tasks: tasks.len(),
            pending: count(TaskStatus::Pending),
            running: running_tasks.len(),
            failed: count(TaskStatus::Failed),
            total_gpus: gpus.clone().count(),
            busy_gpus: gpus.filter(|g| g.is_busy()).count(),
            my_running: running_tasks.iter().filter(|t| t.user == user).count(),
            oom_events: self.oom_events,
            last_oom_task: self.last_oom_task,
            running_tasks,
            recent: self
                .history
                .iter()
                .rev()
                .take(RECENT_HISTORY_LEN)
                .cloned()
                .collect(),
        }
    }
}

/// Builder for creating Master instances with injected collaborators
pub struct MasterBuilder {
    scheduler: Option<Scheduler>,
    agent: Option<Agent>,
    poll_interval: Duration,
    history_capacity: usize,
}

impl MasterBuilder {
    pub fn new() -> Self {
        Self {
            scheduler: None,
            agent: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn build(self) -> Master {
        Master {
            scheduler: self.scheduler.unwrap_or_default(),
            agent: self.agent.unwrap_or_default(),
            nodes: Vec::new(),
            runtimes: HashMap::new(),
            history: VecDeque::with_capacity(self.history_capacity.min(DEFAULT_HISTORY_CAPACITY)),
            history_capacity: self.history_capacity,
            oom_events: 0,
            last_oom_task: None,
            poll_interval: self.poll_interval,
        }
    }
}

impl Default for MasterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::control::MockProcessControl;
    use crate::agent::PREEMPT_WARNING;
    use crate::api::GpuDescriptor;
    use crate::core::gpu::Gpu;
    use crate::core::task::Priority;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn noon() -> NaiveTime {
        NaiveTime::from_hms_opt(12, 0, 0).unwrap()
    }

    fn submit(mem: &str) -> TaskSubmit {
        TaskSubmit {
            cmd: "python train.py".into(),
            mem: mem.into(),
            ..Default::default()
        }
    }

    fn master_with(control: MockProcessControl) -> Master {
        Master::builder()
            .with_agent(Agent::with_control(Arc::new(control)))
            .with_poll_interval(Duration::from_millis(5))
            .build()
    }

    fn running_master() -> (Master, u32) {
        let mut master = Master::default();
        master.register_node(Node::new("A", vec![Gpu::new(0, 24.0)]));
        let id = master.submit_request(submit("10G"), "me").unwrap();
        assert_eq!(master.schedule_once_at(noon()).len(), 1);
        (master, id)
    }

    #[test]
    fn test_register_node_replaces_in_place() {
        let mut master = Master::default();
        master.register_node(Node::new("A", vec![Gpu::new(0, 24.0)]));
        master.register_node(Node::new("B", vec![Gpu::new(0, 48.0)]));
        master.register_node(Node::new("A", vec![Gpu::new(0, 80.0), Gpu::new(1, 80.0)]));

        let names: Vec<&str> = master.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(master.node("A").unwrap().gpus.len(), 2);
    }

    #[test]
    fn test_register_request() {
        let mut master = Master::default();
        let name = master.register_request(NodeRegistration {
            node: "gpu-01".into(),
            gpu_type: Some("A100".into()),
            gpus: vec![GpuDescriptor {
                id: 0,
                total_vram_gb: 40.0,
                used_vram_gb: 0.0,
                gpu_type: None,
            }],
        });
        assert_eq!(name, "gpu-01");
        assert!(master.node("gpu-01").unwrap().matches_type(Some("a100")));
    }

    #[test]
    fn test_submit_request_allocates_ids() {
        let mut master = Master::default();
        assert_eq!(master.submit_request(submit("1G"), "a").unwrap(), 1);
        assert_eq!(master.submit_request(submit("2G"), "b").unwrap(), 2);
        assert!(master.submit_request(submit("2X"), "b").is_err());
        assert_eq!(master.scheduler().tasks_len(), 2);
    }

    #[test]
    fn test_oom_exit_requeues_with_higher_floor() {
        let (mut master, id) = running_master();
        master.register_runtime(id, 100, PathBuf::from("/tmp/1.log"));

        let lines = ["RuntimeError: CUDA out of memory. Tried to allocate 1.0 GiB"];
        let oom = master.agent().handle_process_exit(id, 1, &lines, 10.0).unwrap();
        master.on_process_exit(id, 100, 1, Some(&oom)).unwrap();

        let task = master.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.min_vram_gb, 12.0);
        assert_eq!(task.retry_count, 1);
        assert_eq!(master.oom_events(), 1);
        assert_eq!(master.last_oom_task(), Some(id));
        assert!(master.runtime(id).is_none());
        assert_eq!(master.node("A").unwrap().gpus[0].used_vram_gb, 0.0);
    }

    #[test]
    fn test_oom_callback_feeds_master() {
        let (tx, rx) = std::sync::mpsc::channel();
        let agent = Agent::new().with_on_oom(Arc::new(move |signal: &OomSignal| {
            let _ = tx.send(signal.clone());
        }));
        let mut master = Master::builder().with_agent(agent).build();
        master.register_node(Node::new("A", vec![Gpu::new(0, 24.0)]));
        let id = master.submit_request(submit("10G"), "me").unwrap();
        master.schedule_once_at(noon());

        let lines = ["RuntimeError: CUDA out of memory. Tried to allocate 1.0 GiB"];
        master.agent().handle_process_exit(id, 1, &lines, 10.0);
        let signal = rx.try_recv().unwrap();
        master.on_oom(&signal).unwrap();

        assert_eq!(master.task(id).unwrap().min_vram_gb, 12.0);
    }

    #[test]
    fn test_exit_outcomes() {
        let mut master = Master::default();
        master.register_node(Node::new("A", vec![Gpu::new(0, 24.0)]));
        let ok = master.submit_request(submit("4G"), "me").unwrap();
        let bad = master.submit_request(submit("4G"), "me").unwrap();
        master.schedule_once_at(noon());

        master.on_process_exit(ok, 1, 0, None).unwrap();
        master.on_process_exit(bad, 2, 1, None).unwrap();

        assert_eq!(master.task(ok).unwrap().status, TaskStatus::Succeeded);
        assert_eq!(master.task(bad).unwrap().status, TaskStatus::Failed);
        assert_eq!(master.node("A").unwrap().gpus[0].used_vram_gb, 0.0);
        assert_eq!(master.history().count(), 2);
    }

    #[test]
    fn test_stale_exits_are_ignored() {
        let (mut master, id) = running_master();
        master.register_runtime(id, 200, PathBuf::from("/tmp/x.log"));

        master.on_process_exit(id, 199, 1, None).unwrap();
        assert_eq!(master.task(id).unwrap().status, TaskStatus::Running);
        assert!(master.runtime(id).is_some());

        master.mark_succeeded(id).unwrap();
        master.on_process_exit(id, 200, 1, None).unwrap();
        assert_eq!(master.task(id).unwrap().status, TaskStatus::Succeeded);

        assert!(matches!(
            master.on_process_exit(99, 1, 0, None),
            Err(LabGpuError::UnknownTask(99))
        ));
    }

    #[tokio::test]
    async fn test_preempt_without_runtime_is_not_running() {
        let (mut master, id) = running_master();
        for _ in 0..2 {
            assert_eq!(
                master.preempt_task(id, Duration::ZERO, Duration::ZERO).await,
                PreemptOutcome::NotRunning
            );
        }
        assert_eq!(
            master.preempt_task(404, Duration::ZERO, Duration::ZERO).await,
            PreemptOutcome::NotRunning
        );
    }

    #[tokio::test]
    async fn test_preempt_soft_exit() {
        let dir = TempDir::new().unwrap();
        let mut control = MockProcessControl::new();
        control.expect_soft_signal().times(1).returning(|_| Ok(()));
        control.expect_is_alive().returning(|_| false);
        control.expect_terminate().never();
        control.expect_kill().never();

        let mut master = master_with(control);
        let log_path = dir.path().join("1.log");
        master.register_runtime(1, 500, log_path.clone());

        let outcome = master
            .preempt_task(1, Duration::from_millis(50), Duration::from_millis(50))
            .await;
        assert_eq!(outcome, PreemptOutcome::SoftExit);
        assert_eq!(outcome.to_string(), "soft-exit");
        assert!(master.runtime(1).is_none());
        assert!(std::fs::read_to_string(log_path).unwrap().contains(PREEMPT_WARNING));
    }

    #[tokio::test]
    async fn test_preempt_term_exit() {
        let dir = TempDir::new().unwrap();
        let mut control = MockProcessControl::new();
        control.expect_soft_signal().times(1).returning(|_| Ok(()));
        let mut terminated = false;
        let mut probes = 0;
        control.expect_terminate().times(1).returning(|_| Ok(()));
        control.expect_is_alive().returning(move |_| {
            probes += 1;
            // Alive through the soft window, gone once terminated.
            if probes > 1 {
                terminated = true;
            }
            !terminated
        });
        control.expect_kill().never();

        let mut master = master_with(control);
        master.register_runtime(2, 501, dir.path().join("2.log"));

        let outcome = master
            .preempt_task(2, Duration::ZERO, Duration::from_millis(50))
            .await;
        assert_eq!(outcome, PreemptOutcome::TermExit);
        assert_eq!(outcome.to_string(), "term-exit");
    }

    #[tokio::test]
    async fn test_preempt_escalates_to_kill() {
        let dir = TempDir::new().unwrap();
        let mut control = MockProcessControl::new();
        control
            .expect_soft_signal()
            .returning(|_| Err(std::io::Error::from_raw_os_error(libc::EPERM)));
        control.expect_terminate().times(1).returning(|_| Ok(()));
        control.expect_kill().times(1).returning(|_| Ok(()));
        control.expect_is_alive().returning(|_| true);

        let mut master = master_with(control);
        master.register_runtime(3, 502, dir.path().join("3.log"));

        let outcome = master
            .preempt_task(3, Duration::from_millis(20), Duration::from_millis(20))
            .await;
        assert_eq!(outcome, PreemptOutcome::Killed);
        assert!(master.runtime(3).is_none());
    }

    #[tokio::test]
    async fn test_kill_pending_task() {
        let mut master = Master::default();
        let id = master.submit_request(submit("4G"), "me").unwrap();

        let outcome = master.kill_task(id).await.unwrap();
        assert_eq!(outcome, PreemptOutcome::NotRunning);
        assert_eq!(master.task(id).unwrap().status, TaskStatus::Failed);
        assert!(master.scheduler().pending_ids().is_empty());
        assert_eq!(master.summary("me").recent[0].task_id, id);

        assert!(master.kill_task(77).await.is_err());
    }

    #[test]
    fn test_retry_and_move_to_front() {
        let (mut master, id) = running_master();
        master.mark_failed(id).unwrap();
        master.retry_task(id).unwrap();
        assert_eq!(master.task(id).unwrap().status, TaskStatus::Pending);

        let other = master
            .submit(
                Task::builder()
                    .id(50)
                    .user("x")
                    .min_vram_gb(1.0)
                    .priority(Priority::High)
                    .build(),
            )
            .unwrap();
        assert!(master.move_task_to_front(id).unwrap());
        let order = master.scheduler().pending_order_at(noon());
        assert_eq!(order, vec![id, other]);
    }

    #[test]
    fn test_flag_zombie_gpus() {
        let mut master = Master::default();
        master.register_node(Node::new("A", vec![Gpu::new(0, 24.0), Gpu::new(1, 24.0)]));

        let flagged: HashSet<u32> = [1].into_iter().collect();
        assert_eq!(master.flag_zombie_gpus("A", &flagged), 1);
        assert_eq!(master.flag_zombie_gpus("A", &flagged), 0);
        assert!(master.node("A").unwrap().gpus[1].zombie);

        assert_eq!(master.flag_zombie_gpus("A", &HashSet::new()), 1);
        assert!(!master.node("A").unwrap().gpus[1].zombie);
        assert_eq!(master.flag_zombie_gpus("missing", &flagged), 0);
    }

    #[test]
    fn test_summary() {
        let mut master = Master::builder().with_history_capacity(8).build();
        master.register_node(Node::new("A", vec![Gpu::new(0, 24.0), Gpu::new(1, 24.0)]));
        for user in ["me", "me", "you"] {
            master.submit_request(submit("12G"), user).unwrap();
        }
        master.submit_request(submit("99G"), "you").unwrap();
        master.schedule_once_at(noon());
        master.mark_succeeded(1).unwrap();

        let summary = master.summary("me");
        assert_eq!(summary.total_tasks, 4);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.running, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.total_gpus, 2);
        assert_eq!(summary.busy_gpus, 2);
        assert_eq!(summary.my_running, 1);
        assert_eq!(summary.running_tasks.len(), 2);
        assert_eq!(summary.recent.len(), 1);
        assert_eq!(summary.recent[0].status, TaskStatus::Succeeded);
        assert_eq!(summary.recent[0].node.as_deref(), Some("A"));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut master = Master::builder().with_history_capacity(3).build();
        for _ in 0..6 {
            let id = master.submit_request(submit("1G"), "me").unwrap();
            master.mark_failed(id).unwrap();
        }
        let ids: Vec<u32> = master.history().map(|h| h.task_id).collect();
        assert_eq!(ids, vec![4, 5, 6]);

        let recent: Vec<u32> = master.summary("me").recent.iter().map(|h| h.task_id).collect();
        assert_eq!(recent, vec![6, 5, 4]);
    }
}
