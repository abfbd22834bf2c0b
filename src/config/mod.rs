//! Scheduler configuration.
//!
//! Configuration is read from a YAML file and then overridden by `STILQ_*`
//! environment variables. Credentials live in the file or the environment,
//! never in code.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::backend::Reservation;
use crate::scheduler::job::ExecutionMode;

/// Inputs at or above this size run on the cluster by default (64 MiB).
pub const DEFAULT_REMOTE_THRESHOLD_BYTES: u64 = 64 * 1024 * 1024;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// File locations shared by submitters and the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Queue table.
    pub queue_file: PathBuf,
    /// Execution log table.
    pub execution_log_file: PathBuf,
    /// Driver lock file.
    pub lock_file: PathBuf,
    /// Per-task log directory.
    pub log_dir: PathBuf,
    /// Tool output directory.
    pub workspace_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            queue_file: PathBuf::from("task_queue.csv"),
            execution_log_file: PathBuf::from("execution_log.csv"),
            lock_file: PathBuf::from("/tmp/stilq_driver.lock"),
            log_dir: PathBuf::from("logs"),
            workspace_dir: PathBuf::from("release_pattern"),
        }
    }
}

/// Pattern-generation tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub program: String,
    /// Shell snippet run before the tool (e.g. `source /etc/profile && module load tdl`).
    pub preamble: Option<String>,
    pub extra_args: Vec<String>,
    /// Mode used for tasks submitted without one.
    pub default_mode: ExecutionMode,
    /// Setup profile per mode.
    pub profiles: BTreeMap<ExecutionMode, PathBuf>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: "ategen".to_string(),
            preamble: None,
            extra_args: vec!["-input_file_type:STIL".to_string()],
            default_mode: ExecutionMode::Smt8,
            profiles: BTreeMap::new(),
        }
    }
}

/// Cluster execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub size_threshold_bytes: u64,
    pub partition: String,
    pub memory: String,
    pub cpus_per_task: u32,
    /// Tag for every job of this workload; admission counts jobs by it.
    pub job_name: String,
    pub launcher: String,
    pub query_program: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            size_threshold_bytes: DEFAULT_REMOTE_THRESHOLD_BYTES,
            partition: "hw-h".to_string(),
            memory: "64G".to_string(),
            cpus_per_task: 2,
            job_name: "stilq".to_string(),
            launcher: "srun".to_string(),
            query_program: "squeue".to_string(),
        }
    }
}

impl RemoteConfig {
    pub fn reservation(&self) -> Reservation {
        Reservation {
            partition: self.partition.clone(),
            memory: self.memory.clone(),
            cpus: self.cpus_per_task,
            job_name: self.job_name.clone(),
        }
    }
}

/// Admission control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum jobs in flight (tool licenses available).
    pub capacity: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { capacity: 1 }
    }
}

/// Batch notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    /// When false, notifications are only logged.
    pub enabled: bool,
    pub from: String,
    pub password: Option<String>,
    /// Domain appended to the submitter's login to form their address.
    pub domain: String,
    /// Mail transfer program; reads the message on stdin.
    pub program: String,
    pub args: Vec<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            from: String::new(),
            password: None,
            domain: "localhost".to_string(),
            program: "sendmail".to_string(),
            args: vec!["-t".to_string(), "-i".to_string()],
        }
    }
}

/// Driver lock settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Age after which a leftover lock file is considered stale.
    /// Unset: a leftover lock blocks the driver until removed by hand.
    pub stale_after_secs: Option<u64>,
}

/// Complete scheduler configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub paths: PathsConfig,
    pub tool: ToolConfig,
    pub remote: RemoteConfig,
    pub admission: AdmissionConfig,
    pub email: EmailConfig,
    pub lock: LockConfig,
    /// When set, a task is skipped unless `<dir>/<project name>` exists.
    pub pattern_source_dir: Option<PathBuf>,
}

impl SchedulerConfig {
    /// Loads the YAML file, applies environment overrides, and validates.
    ///
    /// # Environment Variables
    ///
    /// - `STILQ_QUEUE_FILE`: Queue table path
    /// - `STILQ_EXECUTION_LOG`: Execution log path
    /// - `STILQ_LOCK_FILE`: Driver lock file path
    /// - `STILQ_LOG_DIR`: Per-task log directory
    /// - `STILQ_CAPACITY`: Admission capacity
    /// - `STILQ_REMOTE_THRESHOLD_BYTES`: Remote execution threshold
    /// - `STILQ_MAIL_FROM`: Notification sender
    /// - `STILQ_MAIL_PASSWORD`: Notification sender credentials
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file is missing or unparsable, an
    /// override is invalid, or validation fails.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses the YAML file without overrides or validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies `STILQ_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("STILQ_QUEUE_FILE") {
            self.paths.queue_file = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("STILQ_EXECUTION_LOG") {
            self.paths.execution_log_file = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("STILQ_LOCK_FILE") {
            self.paths.lock_file = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("STILQ_LOG_DIR") {
            self.paths.log_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("STILQ_CAPACITY") {
            self.admission.capacity = parse_env_value(&val, "STILQ_CAPACITY")?;
        }

        if let Ok(val) = std::env::var("STILQ_REMOTE_THRESHOLD_BYTES") {
            self.remote.size_threshold_bytes = parse_env_value(&val, "STILQ_REMOTE_THRESHOLD_BYTES")?;
        }

        if let Ok(val) = std::env::var("STILQ_MAIL_FROM") {
            self.email.from = val;
        }

        if let Ok(val) = std::env::var("STILQ_MAIL_PASSWORD") {
            self.email.password = Some(val);
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tool.program.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "tool.program cannot be empty".to_string(),
            ));
        }

        if !self.tool.profiles.contains_key(&self.tool.default_mode) {
            return Err(ConfigError::ValidationFailed(format!(
                "tool.profiles has no entry for the default mode '{}'",
                self.tool.default_mode
            )));
        }

        if self.admission.capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "admission.capacity must be greater than 0".to_string(),
            ));
        }

        if self.remote.cpus_per_task == 0 {
            return Err(ConfigError::ValidationFailed(
                "remote.cpus_per_task must be greater than 0".to_string(),
            ));
        }

        if self.remote.job_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "remote.job_name cannot be empty".to_string(),
            ));
        }

        if self.email.enabled && self.email.from.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "email.from is required when notifications are enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Stale-lock policy as a duration.
    pub fn stale_lock_after(&self) -> Option<Duration> {
        self.lock.stale_after_secs.map(Duration::from_secs)
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
