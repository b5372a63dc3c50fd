use crate::core::error::LabGpuError;
use crate::utils::parsers::parse_clock_time;
use anyhow::Context;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Wall-clock window in which low-priority and backfill work is favored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NightWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl NightWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, LabGpuError> {
        Ok(Self::new(parse_clock_time(start)?, parse_clock_time(end)?))
    }

    /// Closed interval; wraps midnight when `start > end`.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }
}

impl Default for NightWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::MIN,
            end: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerPolicy {
    pub night: NightWindow,
    /// Idle utilization (fraction of 1.0) under which a GPU holder counts as idle by day.
    pub base_idle_util_threshold: f64,
    /// Same, during the night window.
    pub night_idle_util_threshold: f64,
    /// Longest declared time limit that still qualifies for backfill.
    pub backfill_time_limit: Duration,
    pub night_low_bonus: f64,
    /// Give up on a task after this many OOM recoveries. `None` retries forever.
    pub max_oom_retries: Option<u32>,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            night: NightWindow::default(),
            base_idle_util_threshold: 0.05,
            night_idle_util_threshold: 0.20,
            backfill_time_limit: Duration::from_secs(3600),
            night_low_bonus: 0.5,
            max_oom_retries: None,
        }
    }
}

impl SchedulerPolicy {
    pub fn is_night_at(&self, time: NaiveTime) -> bool {
        self.night.contains(time)
    }

    /// Idle threshold in percent, as sampled utilization is reported.
    pub fn idle_util_threshold_pct(&self, night: bool) -> f64 {
        let fraction = if night {
            self.night_idle_util_threshold
        } else {
            self.base_idle_util_threshold
        };
        fraction * 100.0
    }

    /// Apply the fields present in `overrides`; absent fields keep their value.
    pub fn apply(&mut self, overrides: &PolicyOverrides) -> Result<(), LabGpuError> {
        if let Some(start) = &overrides.night_start {
            self.night.start = parse_clock_time(start)?;
        }
        if let Some(end) = &overrides.night_end {
            self.night.end = parse_clock_time(end)?;
        }
        if let Some(v) = overrides.base_idle_util_threshold {
            self.base_idle_util_threshold = v;
        }
        if let Some(v) = overrides.night_idle_util_threshold {
            self.night_idle_util_threshold = v;
        }
        if let Some(v) = overrides.backfill_time_limit_s {
            self.backfill_time_limit = Duration::from_secs(v);
        }
        if let Some(v) = overrides.night_low_bonus {
            self.night_low_bonus = v;
        }
        if let Some(v) = overrides.max_oom_retries {
            self.max_oom_retries = Some(v);
        }
        Ok(())
    }
}

/// The overridable policy fields. Unknown keys in a policy document are ignored;
/// values are coerced to each field's type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverrides {
    pub night_start: Option<String>,
    pub night_end: Option<String>,
    pub base_idle_util_threshold: Option<f64>,
    pub night_idle_util_threshold: Option<f64>,
    pub backfill_time_limit_s: Option<u64>,
    pub night_low_bonus: Option<f64>,
    pub max_oom_retries: Option<u32>,
}

/// Load a policy document (YAML, or TOML by extension).
///
/// Returns `Ok(None)` when the file does not exist.
pub fn load_policy(path: &Path) -> anyhow::Result<Option<PolicyOverrides>> {
    if !path.exists() {
        return Ok(None);
    }

    let format = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => config::FileFormat::Toml,
        _ => config::FileFormat::Yaml,
    };

    let overrides = config::Config::builder()
        .add_source(config::File::from(path).format(format))
        .build()
        .with_context(|| format!("Failed to read policy file {}", path.display()))?
        .try_deserialize::<PolicyOverrides>()
        .with_context(|| format!("Invalid policy file {}", path.display()))?;

    Ok(Some(overrides))
}
