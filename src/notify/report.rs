//! Batch completion report.

use std::fmt;
use std::path::PathBuf;

use super::Notification;
use crate::scheduler::batch::BatchId;
use crate::scheduler::job::{TaskRecord, TaskStatus};

/// Overall outcome of a closed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
        }
    }
}

/// Aggregated outcome of a batch whose tasks are all terminal.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: BatchId,
    /// Submitter address of the batch's first task.
    pub recipient: String,
    /// One entry per task, in submission order.
    pub tasks: Vec<(PathBuf, TaskStatus)>,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchReport {
    /// Builds the report if the batch is closed.
    ///
    /// Returns `None` for an empty batch or one with any pending or running
    /// task.
    pub fn closed(batch_id: &BatchId, tasks: &[&TaskRecord]) -> Option<Self> {
        let first = tasks.first()?;
        if tasks.iter().any(|t| !t.status.is_terminal()) {
            return None;
        }

        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        Some(Self {
            batch_id: batch_id.clone(),
            recipient: first.email.clone(),
            tasks: tasks
                .iter()
                .map(|t| (t.input_path.clone(), t.status))
                .collect(),
            passed: count(TaskStatus::Complete),
            failed: count(TaskStatus::Failed),
            skipped: count(TaskStatus::Skipped),
        })
    }

    /// `Pass` iff nothing failed. Skipped tasks do not fail a batch.
    pub fn verdict(&self) -> Verdict {
        if self.failed == 0 {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }

    pub fn total(&self) -> usize {
        self.tasks.len()
    }

    pub fn subject(&self) -> String {
        format!("[{}] Pattern Release : {}", self.verdict(), self.batch_id)
    }

    pub fn body(&self) -> String {
        let summary = self
            .tasks
            .iter()
            .map(|(input, status)| format!("{}  -->  {}", input.display(), status))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Batch: {}\n\nSummary:\n{}\n\nResult: {} Passed, {} Failed, {} Skipped",
            self.batch_id, summary, self.passed, self.failed, self.skipped
        )
    }

    pub fn notification(&self, from: &str) -> Notification {
        Notification {
            from: from.to_string(),
            to: self.recipient.clone(),
            subject: self.subject(),
            body: self.body(),
        }
    }
}
