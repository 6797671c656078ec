use crate::errors::ConfigError;
use crate::escalation::EscalationPolicy;
use crate::hang::HangDetector;
use crate::model::Walltime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub poll: PollConfig,
    pub container: ContainerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub max_files: usize,
    pub max_age_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_files: 50,
            max_age_days: 7,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    Lsf,
    Slurm,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::Lsf => write!(f, "lsf"),
            SchedulerKind::Slurm => write!(f, "slurm"),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lsf" => Ok(SchedulerKind::Lsf),
            "slurm" => Ok(SchedulerKind::Slurm),
            other => Err(ConfigError::General(format!(
                "Unknown scheduler '{}'. Valid values are: lsf, slurm",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub kind: SchedulerKind,
    /// Raw arguments appended to every submission, e.g. `-q long`.
    pub extra_args: Vec<String>,
    /// Directory searched for the scheduler binaries before `PATH`.
    pub tools_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of submissions, including the first.
    pub attempts: u32,
    pub multiplier: u32,
    pub max_memory_gb: u64,
    pub max_walltime_hours: Option<u64>,
    pub kill_hung_jobs: bool,
    pub hang_threshold: f64,
    pub hang_check_interval_mins: u64,
    pub min_poll_secs: u64,
    pub max_poll_secs: u64,
    pub pending_poll_secs: u64,
    pub max_query_failures: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            multiplier: 2,
            max_memory_gb: 450,
            max_walltime_hours: None,
            kill_hung_jobs: false,
            hang_threshold: crate::hang::LOOSE_THRESHOLD,
            hang_check_interval_mins: 120,
            min_poll_secs: 60,
            max_poll_secs: 180,
            pending_poll_secs: 20 * 60,
            max_query_failures: 10,
        }
    }
}

impl RetryConfig {
    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            multiplier: self.multiplier,
            max_memory_gb: self.max_memory_gb,
            max_walltime: self.max_walltime_hours.map(Walltime::from_hours),
        }
    }

    pub fn hang_detector(&self) -> HangDetector {
        HangDetector {
            threshold: self.hang_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
    /// Re-queries of a malformed status response before giving up on the
    /// iteration.
    pub status_retries: u32,
    pub status_retry_secs: u64,
    pub backoff_base_secs: u64,
    pub max_interruptions: u32,
    pub max_backoff_total_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            status_retries: 4,
            status_retry_secs: 20,
            backoff_base_secs: 10,
            max_interruptions: 5,
            max_backoff_total_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub runtime: String,
    pub bind_mounts: Vec<String>,
    /// Shell line run before the container, e.g. `module load singularity`.
    pub env_setup: Option<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "singularity".to_string(),
            bind_mounts: Vec::new(),
            env_setup: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.attempts == 0 {
            return Err(ConfigError::General(
                "retry.attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier == 0 {
            return Err(ConfigError::General(
                "retry.multiplier must be at least 1".to_string(),
            ));
        }
        if self.retry.max_memory_gb == 0 {
            return Err(ConfigError::General(
                "retry.max_memory_gb must be at least 1".to_string(),
            ));
        }
        if !(self.retry.hang_threshold > 0.0 && self.retry.hang_threshold <= 1.0) {
            return Err(ConfigError::General(format!(
                "retry.hang_threshold must be in (0, 1], got {}",
                self.retry.hang_threshold
            )));
        }
        if self.retry.min_poll_secs > self.retry.max_poll_secs {
            return Err(ConfigError::General(format!(
                "retry.min_poll_secs ({}) exceeds retry.max_poll_secs ({})",
                self.retry.min_poll_secs, self.retry.max_poll_secs
            )));
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        if let Some(dir) = &self.scheduler.tools_dir {
            self.scheduler.tools_dir = Some(expand_path(&dir.to_string_lossy()));
        }
        for mount in &mut self.container.bind_mounts {
            *mount = shellexpand::tilde(mount.as_str()).into_owned();
        }
    }
}

pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

pub fn config_path() -> Option<PathBuf> {
    xdg::BaseDirectories::with_prefix("runwarden")
        .get_config_home()
        .map(|dir| dir.join(CONFIG_FILE))
}

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let mut config: Config = if path.exists() {
        let content = fs_err::read_to_string(path)?;
        toml::from_str(&content)?
    } else {
        tracing::debug!(
            "No config file at '{}', using defaults",
            path.display()
        );
        Config::default()
    };
    config.expand_paths();
    config.validate()?;
    Ok(config)
}

pub fn load_config() -> Result<Config, ConfigError> {
    match config_path() {
        Some(path) => load_config_from(&path),
        None => Err(ConfigError::HomeDirectoryNotFound),
    }
}
