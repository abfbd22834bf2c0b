//! Remote execution backend.
//!
//! Large inputs run on a cluster scheduler. The core needs two things from
//! it: how many jobs of this workload are in flight (for admission control)
//! and the launcher prefix that runs a command under a resource reservation.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::BackendError;

/// Resources requested for one remote job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Cluster partition/queue.
    pub partition: String,
    /// Memory ceiling in the launcher's notation (e.g. `64G`).
    pub memory: String,
    pub cpus: u32,
    /// Job name every job of this workload is tagged with.
    pub job_name: String,
}

/// A cluster scheduler the driver can query and submit through.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Number of jobs currently queued or running under `job_name`.
    async fn in_flight(&self, job_name: &str) -> Result<usize, BackendError>;

    /// Wraps `command` so it runs under `reservation`.
    fn launch_command(&self, reservation: &Reservation, command: Vec<String>) -> Vec<String>;
}

/// SLURM backend driven through `squeue` and `srun`.
#[derive(Debug, Clone)]
pub struct SlurmBackend {
    query_program: String,
    launcher: String,
}

impl SlurmBackend {
    pub fn new(query_program: impl Into<String>, launcher: impl Into<String>) -> Self {
        Self {
            query_program: query_program.into(),
            launcher: launcher.into(),
        }
    }
}

impl Default for SlurmBackend {
    fn default() -> Self {
        Self::new("squeue", "srun")
    }
}

#[async_trait]
impl ClusterBackend for SlurmBackend {
    async fn in_flight(&self, job_name: &str) -> Result<usize, BackendError> {
        let output = Command::new(&self.query_program)
            .args(["-h", "-n", job_name, "-o", "%i"])
            .output()
            .await
            .map_err(|source| BackendError::Spawn {
                program: self.query_program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(BackendError::QueryFailed {
                program: self.query_program.clone(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let count = count_job_lines(&String::from_utf8_lossy(&output.stdout));
        debug!(job_name, count, "Queried in-flight jobs");
        Ok(count)
    }

    fn launch_command(&self, reservation: &Reservation, command: Vec<String>) -> Vec<String> {
        let mut launch = vec![
            self.launcher.clone(),
            "-p".to_string(),
            reservation.partition.clone(),
            format!("--mem={}", reservation.memory),
            format!("--cpus-per-task={}", reservation.cpus),
            "-J".to_string(),
            reservation.job_name.clone(),
        ];
        launch.extend(command);
        launch
    }
}

fn count_job_lines(stdout: &str) -> usize {
    stdout.lines().filter(|l| !l.trim().is_empty()).count()
}
