//! Append-only execution log.

use std::path::{Path, PathBuf};

use csv::StringRecord;

use super::result::RunOutcome;
use crate::error::TableError;
use crate::scheduler::batch::BatchId;
use crate::scheduler::job::{TaskStatus, TIMESTAMP_FORMAT};
use crate::storage::table::LockedTable;

/// Column names of the execution log.
pub const EXECUTION_LOG_COLUMNS: [&str; 6] = [
    "StartTime",
    "EndTime",
    "BatchID",
    "InputPath",
    "DurationSeconds",
    "Status",
];

/// One completed execution attempt. Written once, never updated.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub start_time: String,
    pub end_time: String,
    pub batch_id: BatchId,
    pub input_path: PathBuf,
    pub duration_secs: f64,
    pub status: TaskStatus,
}

impl ExecutionRecord {
    pub fn from_outcome(batch_id: &BatchId, input_path: &Path, outcome: &RunOutcome) -> Self {
        Self {
            start_time: outcome.started_at.format(TIMESTAMP_FORMAT).to_string(),
            end_time: outcome.finished_at.format(TIMESTAMP_FORMAT).to_string(),
            batch_id: batch_id.clone(),
            input_path: input_path.to_path_buf(),
            duration_secs: outcome.duration_secs,
            status: outcome.status(),
        }
    }

    fn to_record(&self) -> StringRecord {
        let input = self.input_path.to_string_lossy();
        let duration = self.duration_secs.to_string();
        StringRecord::from(vec![
            self.start_time.as_str(),
            self.end_time.as_str(),
            self.batch_id.as_str(),
            input.as_ref(),
            duration.as_str(),
            self.status.as_str(),
        ])
    }
}

/// Handle to the execution log file.
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    path: PathBuf,
}

impl ExecutionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record, writing the header if the log is new.
    pub fn append(&self, record: &ExecutionRecord) -> Result<(), TableError> {
        let header = StringRecord::from(EXECUTION_LOG_COLUMNS.to_vec());
        LockedTable::exclusive(&self.path)?.append(&header, &[record.to_record()])
    }
}
