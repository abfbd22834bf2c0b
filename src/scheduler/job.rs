//! Task records and their lifecycle.
//!
//! This module defines the core types stored in the queue table:
//!
//! - `TaskRecord`: one input artifact waiting for (or done with) conversion
//! - `TaskStatus`: lifecycle state with its transition table
//! - `ExecutionMode`: closed set of tool configuration variants

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::batch::BatchId;
use crate::error::{QueueError, RouteError};

/// Column names of the queue table, in order.
pub const QUEUE_COLUMNS: [&str; 7] = [
    "Timestamp",
    "SubmittedBy",
    "Email",
    "BatchID",
    "InputPath",
    "Mode",
    "Status",
];

/// Timestamp format used in every table.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Lifecycle state of a task.
///
/// Valid transitions:
/// - Pending -> Running (selected by a driver cycle)
/// - Pending -> Skipped (input artifact gone at selection time)
/// - Running -> Complete (tool exited 0)
/// - Running -> Failed (non-zero exit, tool could not start, or routing failed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Complete,
        TaskStatus::Failed,
        TaskStatus::Skipped,
    ];

    /// Column value written to the queue table.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Skipped => "SKIPPED",
        }
    }

    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// States reachable from `self` in one step.
    pub fn successors(self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[TaskStatus::Running, TaskStatus::Skipped],
            TaskStatus::Running => &[TaskStatus::Complete, TaskStatus::Failed],
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Skipped => &[],
        }
    }

    /// Check if a transition between two statuses is allowed.
    pub fn can_transition(self, to: TaskStatus) -> bool {
        self.successors().contains(&to)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| QueueError::UnknownStatus(s.to_string()))
    }
}

/// Tool configuration variant requested for a task.
///
/// Each mode maps to one setup profile in the configuration; a task with no
/// mode uses the configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// SmarTest 7 pattern target.
    Smt7,
    /// SmarTest 8 pattern target.
    Smt8,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Smt7 => "smt7",
            ExecutionMode::Smt8 => "smt8",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "smt7" => Ok(ExecutionMode::Smt7),
            "smt8" => Ok(ExecutionMode::Smt8),
            _ => Err(RouteError::UnknownMode(s.to_string())),
        }
    }
}

/// Why a queue row could not be read as a task.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RowDefect {
    #[error("expected {expected} columns, found {found}")]
    ColumnCount { expected: usize, found: usize },

    #[error("unknown status '{0}'")]
    UnknownStatus(String),
}

/// One row of the queue table.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    /// Submission time, formatted with [`TIMESTAMP_FORMAT`].
    pub submitted_at: String,
    /// Login name of the submitter.
    pub submitted_by: String,
    /// Where the batch notification goes.
    pub email: String,
    /// Batch this task belongs to.
    pub batch_id: BatchId,
    /// Absolute path of the input artifact.
    pub input_path: PathBuf,
    /// Raw mode column; empty means "use the default profile".
    pub mode: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
}

impl TaskRecord {
    /// Parses a queue row. Rows with the wrong column count or an unknown
    /// status are defects, not errors: callers keep them verbatim.
    pub fn from_record(record: &StringRecord) -> Result<Self, RowDefect> {
        if record.len() != QUEUE_COLUMNS.len() {
            return Err(RowDefect::ColumnCount {
                expected: QUEUE_COLUMNS.len(),
                found: record.len(),
            });
        }
        let status = record[6]
            .parse::<TaskStatus>()
            .map_err(|_| RowDefect::UnknownStatus(record[6].to_string()))?;

        Ok(Self {
            submitted_at: record[0].to_string(),
            submitted_by: record[1].to_string(),
            email: record[2].to_string(),
            batch_id: BatchId::from(&record[3]),
            input_path: PathBuf::from(&record[4]),
            mode: record[5].to_string(),
            status,
        })
    }

    /// Serializes the task back into a queue row.
    pub fn to_record(&self) -> StringRecord {
        let input = self.input_path.to_string_lossy();
        StringRecord::from(vec![
            self.submitted_at.as_str(),
            self.submitted_by.as_str(),
            self.email.as_str(),
            self.batch_id.as_str(),
            input.as_ref(),
            self.mode.as_str(),
            self.status.as_str(),
        ])
    }

    /// Moves the task to `to`, rejecting anything outside the transition table.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), QueueError> {
        if !self.status.can_transition(to) {
            return Err(QueueError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Parsed execution mode, `None` when the column is empty.
    pub fn execution_mode(&self) -> Result<Option<ExecutionMode>, RouteError> {
        let raw = self.mode.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse().map(Some)
    }

    /// Project name handed to the tool; see [`project_name`].
    pub fn project_name(&self) -> String {
        project_name(&self.input_path)
    }
}

/// Derives a project name from an input path: the file name with every
/// extension stripped and trailing underscores trimmed.
///
/// `/data/core_top_.stil.gz` becomes `core_top`.
pub fn project_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().trim().to_string())
        .unwrap_or_default();
    let stem = match name.char_indices().skip(1).find(|(_, c)| *c == '.') {
        Some((idx, _)) => &name[..idx],
        None => name.as_str(),
    };
    stem.trim_end_matches('_').to_string()
}
