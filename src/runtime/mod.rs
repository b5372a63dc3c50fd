//! Daemon runtime: ticks the scheduler, launches placed tasks, and feeds
//! process lifecycle events back into the shared master.

mod monitors;

pub use monitors::wait_for_placement;

use crate::agent::sampler::ProcessSampler;
use crate::agent::{Agent, TaskExit};
use crate::api::Placement;
use crate::config::DaemonConfig;
use crate::core::error::{LabGpuError, Result};
use crate::core::task::TaskStatus;
use crate::master::{escalate, Master, PreemptOutcome, KILL_TIMEOUT};
use compact_str::CompactString;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;

/// The master behind a mutex; every tick runs under the lock.
pub type SharedMaster = Arc<Mutex<Master>>;

/// Shared notification handle to wake up the scheduler
pub type SchedulerNotify = Arc<Notify>;

#[derive(Debug)]
pub enum RuntimeEvent {
    Started {
        task_id: u32,
        pid: u32,
        log_path: PathBuf,
    },
    Exited {
        task_id: u32,
        pid: u32,
        exit: TaskExit,
    },
    /// The process could not be launched at all.
    LaunchFailed { task_id: u32, error: String },
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub log_root: PathBuf,
    pub node_name: CompactString,
    pub tick_interval: Duration,
    pub zombie_scan_interval: Duration,
    pub zombie_min_duration: Duration,
}

impl RuntimeSettings {
    pub fn from_config(daemon: &DaemonConfig) -> anyhow::Result<Self> {
        Ok(Self {
            log_root: daemon.log_root()?,
            node_name: daemon.node_name().into(),
            tick_interval: daemon.tick_interval(),
            zombie_scan_interval: daemon.zombie_scan_interval(),
            zombie_min_duration: daemon.zombie_min_duration(),
        })
    }
}

/// Everything needed to launch one placed task without holding the lock.
struct Launch {
    task_id: u32,
    cmd: String,
    env: Option<String>,
    vram_gb: f64,
}

pub struct Runtime {
    master: SharedMaster,
    notify: SchedulerNotify,
    events: mpsc::UnboundedSender<RuntimeEvent>,
    settings: RuntimeSettings,
}

impl Runtime {
    /// The receiver must be handed to [`Runtime::run`].
    pub fn new(
        master: Master,
        settings: RuntimeSettings,
    ) -> (Self, mpsc::UnboundedReceiver<RuntimeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let runtime = Self {
            master: Arc::new(Mutex::new(master)),
            notify: Arc::new(Notify::new()),
            events,
            settings,
        };
        (runtime, rx)
    }

    pub fn shared(&self) -> SharedMaster {
        self.master.clone()
    }

    pub fn notifier(&self) -> SchedulerNotify {
        self.notify.clone()
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// One scheduling tick. Placed tasks are launched in the background.
    pub async fn tick(&self) -> Vec<Placement> {
        let (placements, launches, agent) = {
            let mut master = self.master.lock().await;
            let placements = master.schedule_once();
            let launches: Vec<Launch> = placements
                .iter()
                .filter_map(|p| master.task(p.task_id))
                .map(|task| Launch {
                    task_id: task.id,
                    cmd: task.cmd.clone(),
                    env: task.env.clone(),
                    vram_gb: task.min_vram_gb,
                })
                .collect();
            (placements, launches, master.agent().clone())
        };

        for launch in launches {
            self.spawn_launch(agent.clone(), launch);
        }
        placements
    }

    fn spawn_launch(&self, agent: Agent, launch: Launch) {
        let events = self.events.clone();
        let log_root = self.settings.log_root.clone();

        tokio::spawn(async move {
            let task_id = launch.task_id;
            let mut started_pid = 0;
            let started_events = events.clone();
            let result = agent
                .run_task(
                    task_id,
                    &launch.cmd,
                    launch.env.as_deref(),
                    launch.vram_gb,
                    &log_root,
                    |pid, log_path| {
                        started_pid = pid;
                        let _ = started_events.send(RuntimeEvent::Started {
                            task_id,
                            pid,
                            log_path: log_path.to_path_buf(),
                        });
                    },
                )
                .await;

            let event = match result {
                Ok(exit) => RuntimeEvent::Exited {
                    task_id,
                    pid: started_pid,
                    exit,
                },
                Err(e) => RuntimeEvent::LaunchFailed {
                    task_id,
                    error: e.to_string(),
                },
            };
            if events.send(event).is_err() {
                tracing::warn!("Runtime stopped before task {} was reported", task_id);
            }
        });
    }

    /// Apply one lifecycle event. Exits free resources, so they wake the scheduler.
    pub async fn handle_event(&self, event: RuntimeEvent) -> Result<()> {
        let mut master = self.master.lock().await;
        match event {
            RuntimeEvent::Started {
                task_id,
                pid,
                log_path,
            } => {
                tracing::info!(
                    "Task {} running as pid {}, logging to {}",
                    task_id,
                    pid,
                    log_path.display()
                );
                master.register_runtime(task_id, pid, log_path);
            }
            RuntimeEvent::Exited { task_id, pid, exit } => {
                master.on_process_exit(task_id, pid, exit.exit_code, exit.oom.as_ref())?;
                self.notify.notify_one();
            }
            RuntimeEvent::LaunchFailed { task_id, error } => {
                tracing::error!("Task {} could not be launched: {}", task_id, error);
                master.clear_runtime(task_id);
                master.mark_failed(task_id)?;
                self.notify.notify_one();
            }
        }
        Ok(())
    }

    /// Same escalation as [`Master::preempt_task`], but the lock is only held
    /// to look up and clear the runtime entry.
    pub async fn preempt(
        &self,
        task_id: u32,
        soft_timeout: Duration,
        term_timeout: Duration,
    ) -> PreemptOutcome {
        preempt_shared(self.master.clone(), task_id, soft_timeout, term_timeout).await
    }

    /// Preempt with short windows, then mark the task FAILED.
    pub async fn kill(&self, task_id: u32) -> Result<PreemptOutcome> {
        let outcome = self.preempt(task_id, KILL_TIMEOUT, KILL_TIMEOUT).await;
        let mut master = self.master.lock().await;
        let status = master
            .task(task_id)
            .map(|t| t.status)
            .ok_or(LabGpuError::UnknownTask(task_id))?;
        if !status.is_terminal() {
            master.mark_failed(task_id)?;
        }
        Ok(outcome)
    }

    /// Preempt every running task at once. Used on shutdown.
    pub async fn drain(&self, soft_timeout: Duration, term_timeout: Duration) -> usize {
        let running: Vec<u32> = {
            let master = self.master.lock().await;
            master
                .scheduler()
                .tasks()
                .into_iter()
                .filter(|t| t.status == TaskStatus::Running)
                .map(|t| t.id)
                .collect()
        };

        let mut escalations = JoinSet::new();
        for &task_id in &running {
            escalations.spawn(preempt_shared(
                self.master.clone(),
                task_id,
                soft_timeout,
                term_timeout,
            ));
        }
        while let Some(joined) = escalations.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Preemption task failed: {}", e);
            }
        }
        running.len()
    }

    /// Drive the daemon until `shutdown` resolves.
    pub async fn run<F>(
        &self,
        mut events: mpsc::UnboundedReceiver<RuntimeEvent>,
        mut sampler: Option<Box<dyn ProcessSampler>>,
        shutdown: F,
    ) where
        F: Future<Output = ()>,
    {
        let mut tick = tokio::time::interval(self.settings.tick_interval);
        let mut scan = tokio::time::interval(self.settings.zombie_scan_interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutting down scheduler loop");
                    break;
                }
                Some(event) = events.recv() => {
                    if let Err(e) = self.handle_event(event).await {
                        tracing::warn!("Failed to apply task event: {}", e);
                    }
                }
                _ = tick.tick() => {
                    self.tick().await;
                }
                _ = self.notify.notified() => {
                    tracing::debug!("Scheduler woken up");
                    self.tick().await;
                }
                _ = scan.tick(), if sampler.is_some() => {
                    if let Some(sampler) = sampler.as_deref_mut() {
                        if let Err(e) = self.scan_zombies(sampler).await {
                            tracing::warn!("Zombie scan failed: {:#}", e);
                        }
                    }
                }
            }
        }
    }
}

async fn preempt_shared(
    master: SharedMaster,
    task_id: u32,
    soft_timeout: Duration,
    term_timeout: Duration,
) -> PreemptOutcome {
    let (runtime, agent, poll) = {
        let master = master.lock().await;
        match master.runtime(task_id) {
            Some(runtime) => (runtime.clone(), master.agent().clone(), master.poll_interval()),
            None => return PreemptOutcome::NotRunning,
        }
    };

    let outcome = escalate(&agent, &runtime, soft_timeout, term_timeout, poll).await;

    let mut master = master.lock().await;
    if master
        .runtime(task_id)
        .is_some_and(|r| r.pid == runtime.pid)
    {
        master.clear_runtime(task_id);
    }
    tracing::info!("Preemption of task {} ended: {}", task_id, outcome);
    outcome
}
