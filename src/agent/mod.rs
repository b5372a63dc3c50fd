//! Per-node process supervision: launching tasks, reading their exit, and
//! delivering preemption signals.

pub mod control;
pub mod oom;
pub mod sampler;
pub mod zombie;

use crate::core::error::{LabGpuError, Result};
use crate::core::task::OomSignal;
use crate::core::task_log_path;
use control::{ProcessControl, UnixSignals};
use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use zombie::{ProcessSample, ZombieThresholds};

pub use oom::STDERR_TAIL_LINES;

/// Appended to a task's log on soft preemption.
pub const PREEMPT_WARNING: &str =
    "[WARN] Preemption requested. Please save checkpoint within 5 mins.";

pub const DEFAULT_CONDA_PROFILE: &str = "~/anaconda3/etc/profile.d/conda.sh";

pub type OomCallback = Arc<dyn Fn(&OomSignal) + Send + Sync>;

/// How a supervised task ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskExit {
    /// `128 + signo` when the process was killed by a signal.
    pub exit_code: i32,
    pub oom: Option<OomSignal>,
}

impl TaskExit {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Clone)]
pub struct Agent {
    control: Arc<dyn ProcessControl>,
    on_oom: Option<OomCallback>,
    conda_profile: String,
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("on_oom", &self.on_oom.is_some())
            .field("conda_profile", &self.conda_profile)
            .finish()
    }
}

impl Agent {
    pub fn new() -> Self {
        Self::with_control(Arc::new(UnixSignals))
    }

    pub fn with_control(control: Arc<dyn ProcessControl>) -> Self {
        Self {
            control,
            on_oom: None,
            conda_profile: DEFAULT_CONDA_PROFILE.to_string(),
        }
    }

    pub fn with_on_oom(mut self, on_oom: OomCallback) -> Self {
        self.on_oom = Some(on_oom);
        self
    }

    pub fn with_conda_profile(mut self, profile: impl Into<String>) -> Self {
        self.conda_profile = profile.into();
        self
    }

    pub fn control(&self) -> &dyn ProcessControl {
        self.control.as_ref()
    }

    pub fn parse_oom<S: AsRef<str>>(
        &self,
        stderr_lines: &[S],
        current_used_gb: f64,
    ) -> Option<OomSignal> {
        oom::parse_oom(stderr_lines, current_used_gb)
    }

    /// A zero exit is a success whatever the log says. Otherwise look for an
    /// OOM diagnostic and report it through the callback.
    pub fn handle_process_exit<S: AsRef<str>>(
        &self,
        task_id: u32,
        exit_code: i32,
        stderr_lines: &[S],
        current_used_gb: f64,
    ) -> Option<OomSignal> {
        if exit_code == 0 {
            return None;
        }

        let mut signal = self.parse_oom(stderr_lines, current_used_gb)?;
        signal.task_id = task_id;
        tracing::info!(
            "Task {} ran out of GPU memory ({:.2} GB short)",
            task_id,
            signal.missing_gb
        );
        if let Some(on_oom) = &self.on_oom {
            on_oom(&signal);
        }
        Some(signal)
    }

    pub fn detect_zombies(
        &self,
        samples: &[ProcessSample],
        thresholds: &ZombieThresholds,
    ) -> Vec<u32> {
        zombie::detect_zombies(samples, thresholds)
    }

    /// Warn in the task log, then ask the process to checkpoint.
    pub async fn soft_preempt(&self, pid: u32, log_path: &Path) -> std::io::Result<()> {
        if let Err(e) = append_line(log_path, PREEMPT_WARNING).await {
            tracing::warn!(
                "Failed to write preemption warning to {}: {}",
                log_path.display(),
                e
            );
        }
        self.control.soft_signal(pid)
    }

    pub fn hard_preempt(&self, pid: u32) -> std::io::Result<()> {
        self.control.terminate(pid)
    }

    pub fn force_kill(&self, pid: u32) -> std::io::Result<()> {
        self.control.kill(pid)
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.control.is_alive(pid)
    }

    /// Shell command for a task, activating its conda environment first if it has one.
    pub fn build_command(&self, cmd: &str, env: Option<&str>) -> String {
        match env {
            Some(env) if !env.is_empty() => format!(
                "source {} && conda activate {} && {}",
                self.conda_profile, env, cmd
            ),
            _ => cmd.to_string(),
        }
    }

    /// Run a task to completion under `bash -c`.
    ///
    /// Both output streams are drained concurrently into `<log_root>/<id>.log`;
    /// the last stderr lines are kept for OOM detection. `on_start` receives the
    /// pid and log path as soon as the process exists. Returns once the process
    /// has exited and both streams are closed.
    pub async fn run_task<F>(
        &self,
        task_id: u32,
        cmd: &str,
        env: Option<&str>,
        current_used_gb: f64,
        log_root: &Path,
        on_start: F,
    ) -> Result<TaskExit>
    where
        F: FnOnce(u32, &Path),
    {
        tokio::fs::create_dir_all(log_root)
            .await
            .map_err(|source| LabGpuError::LogDirectory {
                path: log_root.to_path_buf(),
                source,
            })?;

        let log_path = task_log_path(log_root, task_id);
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|source| LabGpuError::LogFile {
                path: log_path.clone(),
                source,
            })?;

        let mut child = Command::new("bash")
            .arg("-c")
            .arg(self.build_command(cmd, env))
            // Own process group: preemption signals reach everything the shell starts.
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| LabGpuError::Spawn { task_id, source })?;

        let pid = child.id().unwrap_or_default();
        tracing::debug!("Task {} started as pid {}", task_id, pid);
        on_start(pid, &log_path);

        let log = Mutex::new(log_file);
        let mut stderr_tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        tokio::join!(
            drain(child.stdout.take(), &log, None),
            drain(child.stderr.take(), &log, Some(&mut stderr_tail)),
        );

        let status = child
            .wait()
            .await
            .map_err(|source| LabGpuError::Spawn { task_id, source })?;
        let exit_code = status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));

        let stderr_lines: Vec<String> = stderr_tail.into();
        let oom = self.handle_process_exit(task_id, exit_code, &stderr_lines, current_used_gb);
        Ok(TaskExit { exit_code, oom })
    }
}

/// Copy a stream line by line into the shared log, optionally keeping the
/// last lines in `tail`. Log write failures do not stop the drain.
async fn drain<R>(stream: Option<R>, log: &Mutex<File>, mut tail: Option<&mut VecDeque<String>>)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut log_ok = true;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Stopped reading task output: {}", e);
                break;
            }
        }
        if !buf.ends_with(b"\n") {
            buf.push(b'\n');
        }

        if log_ok {
            let mut file = log.lock().await;
            if let Err(e) = write_flush(&mut file, &buf).await {
                tracing::warn!("Failed to write task log: {}", e);
                log_ok = false;
            }
        }

        if let Some(tail) = tail.as_deref_mut() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            let line = String::from_utf8_lossy(&buf);
            tail.push_back(line.trim_end_matches(['\n', '\r']).to_string());
        }
    }
}

async fn write_flush(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    write_flush(&mut file, format!("{line}\n").as_bytes()).await
}
