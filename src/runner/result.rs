//! Outcome of one tool invocation.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Local};

use crate::scheduler::job::{TaskStatus, TIMESTAMP_FORMAT};

/// What happened when the tool ran (or failed to start).
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// True iff the process exited with status zero.
    pub success: bool,
    /// Exit code, `None` if the process never started or was killed by a signal.
    pub exit_code: Option<i32>,
    /// stdout and stderr merged, or the error description.
    pub output: String,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    /// Wall-clock seconds, rounded to two decimals.
    pub duration_secs: f64,
}

impl RunOutcome {
    /// Outcome for a task that never reached a process: the tool could not be
    /// started, or the task was rejected before launch.
    pub fn not_started(reason: impl Into<String>) -> Self {
        let now = Local::now();
        Self {
            success: false,
            exit_code: None,
            output: reason.into(),
            started_at: now,
            finished_at: now,
            duration_secs: 0.0,
        }
    }

    /// Terminal task status this outcome maps to.
    pub fn status(&self) -> TaskStatus {
        if self.success {
            TaskStatus::Complete
        } else {
            TaskStatus::Failed
        }
    }

    /// Appends the outcome to the per-task log file.
    pub fn append_to_log(&self, log_path: &Path) -> std::io::Result<()> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(log_path)?;
        let label = if self.success { "SUCCESS" } else { "FAILED" };
        writeln!(
            file,
            "[{}] {}:\n{}",
            Local::now().format(TIMESTAMP_FORMAT),
            label,
            self.output
        )
    }
}

/// Seconds rounded to two decimals, as recorded in the execution log.
pub fn round_secs(secs: f64) -> f64 {
    (secs * 100.0).round() / 100.0
}
