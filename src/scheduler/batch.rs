//! Batch identifiers, grouping, and FIFO task selection.
//!
//! Batches are drained in the order their first row appears in the queue;
//! within a batch, tasks run in submission order. There is no priority.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::job::{TaskRecord, TaskStatus};
use super::queue::QueueTable;

/// Identifier shared by every task of one submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Generates `<source stem>_<yyMMdd_HHmm>`.
    ///
    /// Minute granularity means two submissions of the same source table in
    /// the same minute share one batch.
    pub fn generate(source: &Path, now: DateTime<Local>) -> Self {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "batch".to_string());
        Self(format!("{}_{}", stem, now.format("%y%m%d_%H%M")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BatchId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Rows of one batch, by position in the queue table.
#[derive(Debug, Clone)]
pub struct BatchGroup {
    pub id: BatchId,
    /// Row indices in file order.
    pub rows: Vec<usize>,
}

/// Groups parsed tasks by batch, preserving first-seen batch order.
pub fn group_by_batch(table: &QueueTable) -> Vec<BatchGroup> {
    let mut groups: Vec<BatchGroup> = Vec::new();
    for (row, task) in table.tasks() {
        match groups.iter_mut().find(|g| g.id == task.batch_id) {
            Some(group) => group.rows.push(row),
            None => groups.push(BatchGroup {
                id: task.batch_id.clone(),
                rows: vec![row],
            }),
        }
    }
    groups
}

/// Picks the next task to run: the first pending row of the first batch
/// that still has one.
pub fn select_next(table: &QueueTable) -> Option<usize> {
    group_by_batch(table).into_iter().find_map(|group| {
        group
            .rows
            .into_iter()
            .find(|&row| matches!(table.task(row), Some(t) if t.status == TaskStatus::Pending))
    })
}

/// Per-status counts for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub pending: usize,
    pub running: usize,
    pub complete: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchCounts {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a TaskRecord>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Complete => counts.complete += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.complete + self.failed + self.skipped
    }

    /// A batch is closed once no member is pending or running.
    pub fn is_closed(&self) -> bool {
        self.total() > 0 && self.pending == 0 && self.running == 0
    }
}

/// Status line for one batch, as shown by `stilq status`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOverview {
    pub id: BatchId,
    pub submitted_by: String,
    pub counts: BatchCounts,
}

/// Summarizes every batch in arrival order.
pub fn overview(table: &QueueTable) -> Vec<BatchOverview> {
    group_by_batch(table)
        .into_iter()
        .map(|group| {
            let tasks: Vec<&TaskRecord> =
                group.rows.iter().filter_map(|&row| table.task(row)).collect();
            BatchOverview {
                submitted_by: tasks
                    .first()
                    .map(|t| t.submitted_by.clone())
                    .unwrap_or_default(),
                counts: BatchCounts::from_tasks(tasks),
                id: group.id,
            }
        })
        .collect()
}
