//! Execution routing: where a task runs and with which setup profile.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use tracing::debug;

use super::backend::Reservation;
use crate::config::SchedulerConfig;
use crate::error::RouteError;
use crate::scheduler::job::{ExecutionMode, TaskRecord};

/// Where the tool process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locality {
    /// Directly on the driver's host.
    Local,
    /// Through the cluster launcher with a fixed reservation.
    Remote(Reservation),
}

impl Locality {
    pub fn is_remote(&self) -> bool {
        matches!(self, Locality::Remote(_))
    }
}

/// Resolved execution choices for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub locality: Locality,
    pub mode: ExecutionMode,
    /// Setup profile passed to the tool.
    pub profile: PathBuf,
    /// Input size the locality was decided on.
    pub input_bytes: u64,
}

/// Maps input size to locality and task mode to setup profile.
#[derive(Debug, Clone)]
pub struct ExecutionRouter {
    threshold_bytes: u64,
    reservation: Reservation,
    default_mode: ExecutionMode,
    profiles: BTreeMap<ExecutionMode, PathBuf>,
}

impl ExecutionRouter {
    pub fn new(
        threshold_bytes: u64,
        reservation: Reservation,
        default_mode: ExecutionMode,
        profiles: BTreeMap<ExecutionMode, PathBuf>,
    ) -> Self {
        Self {
            threshold_bytes,
            reservation,
            default_mode,
            profiles,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            config.remote.size_threshold_bytes,
            config.remote.reservation(),
            config.tool.default_mode,
            config.tool.profiles.clone(),
        )
    }

    /// Inputs of at least the threshold run remotely.
    pub fn locality_for_size(&self, bytes: u64) -> Locality {
        if bytes >= self.threshold_bytes {
            Locality::Remote(self.reservation.clone())
        } else {
            Locality::Local
        }
    }

    /// Resolves the task's mode to a configured profile.
    ///
    /// Unknown modes and modes without a profile are errors; there is no
    /// fallback to the default profile.
    pub fn profile_for(&self, task: &TaskRecord) -> Result<(ExecutionMode, PathBuf), RouteError> {
        let mode = task.execution_mode()?.unwrap_or(self.default_mode);
        self.profiles
            .get(&mode)
            .map(|profile| (mode, profile.clone()))
            .ok_or_else(|| RouteError::UnconfiguredMode(mode.to_string()))
    }

    /// Resolves both choices for `task`. The mode is checked first so that
    /// a bad mode is reported even if the input is unreadable.
    pub fn route(&self, task: &TaskRecord) -> Result<ExecutionPlan, RouteError> {
        let (mode, profile) = self.profile_for(task)?;
        let input_bytes = fs::metadata(&task.input_path)
            .map_err(|source| RouteError::Stat {
                path: task.input_path.clone(),
                source,
            })?
            .len();
        let locality = self.locality_for_size(input_bytes);

        debug!(
            input = %task.input_path.display(),
            input_bytes,
            remote = locality.is_remote(),
            %mode,
            "Routed task"
        );

        Ok(ExecutionPlan {
            locality,
            mode,
            profile,
            input_bytes,
        })
    }
}
