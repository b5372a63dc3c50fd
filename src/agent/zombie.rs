use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One resource reading for a process holding GPU memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub used_vram_gb: f64,
    pub util_pct: f64,
    /// Cumulative bytes read, in KB.
    pub io_read_kb: f64,
    /// Cumulative bytes written, in KB.
    pub io_write_kb: f64,
    /// How long the process has been observed.
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZombieThresholds {
    /// Utilization (percent) at or below which a process counts as idle.
    pub idle_util_pct: f64,
    pub min_duration: Duration,
}

impl Default for ZombieThresholds {
    fn default() -> Self {
        Self {
            idle_util_pct: 1.0,
            min_duration: Duration::from_secs(300),
        }
    }
}

impl ProcessSample {
    /// Holds VRAM, sits idle for long enough, and never touched the disk.
    pub fn is_zombie(&self, thresholds: &ZombieThresholds) -> bool {
        self.used_vram_gb > 0.0
            && self.util_pct <= thresholds.idle_util_pct
            && self.duration >= thresholds.min_duration
            && self.io_read_kb == 0.0
            && self.io_write_kb == 0.0
    }
}

/// Pids of the zombie candidates among `samples`, in sample order.
pub fn detect_zombies(samples: &[ProcessSample], thresholds: &ZombieThresholds) -> Vec<u32> {
    samples
        .iter()
        .filter(|s| s.is_zombie(thresholds))
        .map(|s| s.pid)
        .collect()
}
