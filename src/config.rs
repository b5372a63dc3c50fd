use crate::api::NodeRegistration;
use crate::core::error::LabGpuError;
use crate::core::get_config_dir;
use crate::core::policy::{PolicyOverrides, SchedulerPolicy};
use crate::master::{DEFAULT_HISTORY_CAPACITY, DEFAULT_SOFT_TIMEOUT, DEFAULT_TERM_TIMEOUT};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Overrides on top of the built-in scheduling policy.
    #[serde(default)]
    pub policy: PolicyOverrides,
    /// Statically registered nodes, in placement scan order.
    #[serde(default)]
    pub nodes: Vec<NodeRegistration>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DaemonConfig {
    /// Directory holding one `<task_id>.log` per task (default: `<data_dir>/labgpu/tasks`)
    #[serde(default)]
    pub log_root: Option<PathBuf>,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_zombie_scan_interval_secs")]
    pub zombie_scan_interval_secs: u64,
    #[serde(default = "default_zombie_min_duration_secs")]
    pub zombie_min_duration_secs: u64,
    /// Register this host's GPUs through NVML at startup
    #[serde(default)]
    pub discover_local_gpus: bool,
    /// Name for the local node (default: "local")
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub gpu_type: Option<String>,
    /// Script sourced before `conda activate`
    #[serde(default)]
    pub conda_profile: Option<String>,
    #[serde(default = "default_soft_timeout_secs")]
    pub soft_timeout_secs: u64,
    #[serde(default = "default_term_timeout_secs")]
    pub term_timeout_secs: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_tick_interval_secs() -> u64 {
    5
}

fn default_zombie_scan_interval_secs() -> u64 {
    60
}

fn default_zombie_min_duration_secs() -> u64 {
    300
}

fn default_soft_timeout_secs() -> u64 {
    DEFAULT_SOFT_TIMEOUT.as_secs()
}

fn default_term_timeout_secs() -> u64 {
    DEFAULT_TERM_TIMEOUT.as_secs()
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_root: None,
            tick_interval_secs: default_tick_interval_secs(),
            zombie_scan_interval_secs: default_zombie_scan_interval_secs(),
            zombie_min_duration_secs: default_zombie_min_duration_secs(),
            discover_local_gpus: false,
            node_name: None,
            gpu_type: None,
            conda_profile: None,
            soft_timeout_secs: default_soft_timeout_secs(),
            term_timeout_secs: default_term_timeout_secs(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl DaemonConfig {
    pub fn log_root(&self) -> anyhow::Result<PathBuf> {
        match &self.log_root {
            Some(root) => Ok(root.clone()),
            None => crate::core::default_log_root(),
        }
    }

    pub fn node_name(&self) -> &str {
        self.node_name.as_deref().unwrap_or("local")
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn zombie_scan_interval(&self) -> Duration {
        Duration::from_secs(self.zombie_scan_interval_secs.max(1))
    }

    pub fn zombie_min_duration(&self) -> Duration {
        Duration::from_secs(self.zombie_min_duration_secs)
    }

    pub fn soft_timeout(&self) -> Duration {
        Duration::from_secs(self.soft_timeout_secs)
    }

    pub fn term_timeout(&self) -> Duration {
        Duration::from_secs(self.term_timeout_secs)
    }
}

impl Config {
    /// The default policy with this config's overrides applied.
    pub fn scheduler_policy(&self) -> Result<SchedulerPolicy, LabGpuError> {
        let mut policy = SchedulerPolicy::default();
        policy.apply(&self.policy)?;
        Ok(policy)
    }
}

/// Load the daemon configuration.
///
/// Sources, later ones winning: the explicit file, `<config_dir>/labgpu/labgpu.toml`,
/// then `LABGPU_` environment variables with `__` between nesting levels
/// (e.g. `LABGPU_DAEMON__TICK_INTERVAL_SECS=2`).
pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    // User-provided config file
    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            tracing::warn!("Config file {:?} not found", config_path);
        }
    }

    // Default config file
    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("labgpu.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    build_config(&config_vec, env_source())
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix("LABGPU")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn build_config(
    files: &[PathBuf],
    env: config::Environment,
) -> Result<Config, config::ConfigError> {
    let settings = config::Config::builder();
    let settings = files.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings.add_source(env).build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env() -> config::Environment {
        env_source().source(Some(config::Map::new()))
    }

    #[test]
    fn test_defaults() {
        let config = build_config(&[], no_env()).unwrap();
        assert_eq!(config.daemon.tick_interval_secs, 5);
        assert_eq!(config.daemon.zombie_scan_interval_secs, 60);
        assert_eq!(config.daemon.zombie_min_duration(), Duration::from_secs(300));
        assert_eq!(config.daemon.soft_timeout(), Duration::from_secs(300));
        assert_eq!(config.daemon.term_timeout(), Duration::from_secs(30));
        assert_eq!(config.daemon.node_name(), "local");
        assert!(!config.daemon.discover_local_gpus);
        assert!(config.nodes.is_empty());
        assert_eq!(config.scheduler_policy().unwrap(), SchedulerPolicy::default());
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[daemon]
log_root = "/nas/logs"
tick_interval_secs = 2
node_name = "gpu-01"

[policy]
night_start = "22:00"
night_end = "06:00"
max_oom_retries = 4

[[nodes]]
name = "gpu-02"
gpu_type = "A100"
gpus = [{{ id = 0, total_vram_gb = 40.0 }}, {{ id = 1, total_vram_gb = 40.0, used_vram_gb = 2.5 }}]
"#
        )
        .unwrap();

        let config = build_config(&[file.path().to_path_buf()], no_env()).unwrap();
        assert_eq!(config.daemon.log_root().unwrap(), PathBuf::from("/nas/logs"));
        assert_eq!(config.daemon.tick_interval(), Duration::from_secs(2));
        assert_eq!(config.daemon.node_name(), "gpu-01");

        let policy = config.scheduler_policy().unwrap();
        assert_eq!(policy.max_oom_retries, Some(4));
        assert!(policy.is_night_at(chrono::NaiveTime::from_hms_opt(23, 0, 0).unwrap()));

        assert_eq!(config.nodes.len(), 1);
        let node = config.nodes[0].clone().into_node();
        assert_eq!(node.name, "gpu-02");
        assert_eq!(node.gpus[1].used_vram_gb, 2.5);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[daemon]\ntick_interval_secs = 2").unwrap();

        let mut vars = config::Map::new();
        vars.insert("LABGPU_DAEMON__TICK_INTERVAL_SECS".to_string(), "9".to_string());
        vars.insert("LABGPU_POLICY__NIGHT_LOW_BONUS".to_string(), "1.25".to_string());
        let env = env_source().source(Some(vars));

        let config = build_config(&[file.path().to_path_buf()], env).unwrap();
        assert_eq!(config.daemon.tick_interval_secs, 9);
        assert_eq!(config.policy.night_low_bonus, Some(1.25));
    }

    #[test]
    fn test_invalid_policy_clock() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[policy]\nnight_start = \"7pm\"").unwrap();

        let config = build_config(&[file.path().to_path_buf()], no_env()).unwrap();
        assert!(matches!(
            config.scheduler_policy(),
            Err(LabGpuError::InvalidClockTime(_))
        ));
    }
}
