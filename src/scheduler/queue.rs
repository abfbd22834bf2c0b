//! File-backed task queue with locked read-modify-write.
//!
//! The queue is one CSV table shared by submitters (append-only) and the
//! driver (status updates). Every mutation happens inside a [`QueueTxn`],
//! which holds an exclusive `flock` on the queue file from load to rewrite.
//!
//! # Malformed rows
//!
//! Rows that do not parse as tasks are kept verbatim in their original
//! position, logged, and ignored by selection. They are never repaired or
//! dropped on rewrite.

use std::path::{Path, PathBuf};

use csv::StringRecord;
use tracing::{debug, warn};

use super::job::{RowDefect, TaskRecord, TaskStatus, QUEUE_COLUMNS};
use crate::error::QueueError;
use crate::storage::table::{LockedTable, RawTable};

/// One row of the queue table.
#[derive(Debug, Clone)]
pub enum QueueRow {
    Task(TaskRecord),
    Malformed {
        record: StringRecord,
        defect: RowDefect,
    },
}

/// Identifies a task across two separate transactions.
///
/// Rows are never removed or reordered, so the row index is stable; the
/// remaining fields guard against a table edited by hand in between.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskKey {
    pub row: usize,
    pub submitted_at: String,
    pub batch_id: String,
    pub input_path: PathBuf,
}

impl TaskKey {
    pub fn of(row: usize, task: &TaskRecord) -> Self {
        Self {
            row,
            submitted_at: task.submitted_at.clone(),
            batch_id: task.batch_id.to_string(),
            input_path: task.input_path.clone(),
        }
    }

    fn matches(&self, task: &TaskRecord) -> bool {
        task.submitted_at == self.submitted_at
            && task.batch_id.as_str() == self.batch_id
            && task.input_path == self.input_path
    }
}

/// In-memory view of the whole queue table.
#[derive(Debug, Clone)]
pub struct QueueTable {
    header: StringRecord,
    rows: Vec<QueueRow>,
    dirty: bool,
}

impl QueueTable {
    fn from_raw(raw: RawTable, path: &Path) -> Self {
        let header = match raw.header {
            Some(header) => {
                if header.len() != QUEUE_COLUMNS.len() {
                    warn!(
                        path = %path.display(),
                        columns = header.len(),
                        "Queue header does not match the current schema"
                    );
                }
                header
            }
            None => default_header(),
        };

        let rows = raw
            .rows
            .into_iter()
            .enumerate()
            .map(|(idx, record)| match TaskRecord::from_record(&record) {
                Ok(task) => QueueRow::Task(task),
                Err(defect) => {
                    // +2: one for the header, one for 1-based line numbers.
                    warn!(
                        path = %path.display(),
                        line = idx + 2,
                        %defect,
                        "Skipping malformed queue row"
                    );
                    QueueRow::Malformed { record, defect }
                }
            })
            .collect();

        Self {
            header,
            rows,
            dirty: false,
        }
    }

    /// All rows, including malformed ones, in file order.
    pub fn rows(&self) -> &[QueueRow] {
        &self.rows
    }

    /// Parsed tasks with their row index, in file order.
    pub fn tasks(&self) -> impl Iterator<Item = (usize, &TaskRecord)> + '_ {
        self.rows.iter().enumerate().filter_map(|(idx, row)| match row {
            QueueRow::Task(task) => Some((idx, task)),
            QueueRow::Malformed { .. } => None,
        })
    }

    /// The task at `row`, if that row parsed.
    pub fn task(&self, row: usize) -> Option<&TaskRecord> {
        match self.rows.get(row) {
            Some(QueueRow::Task(task)) => Some(task),
            _ => None,
        }
    }

    /// Every task of `batch_id`, in file order.
    pub fn batch(&self, batch_id: &str) -> Vec<&TaskRecord> {
        self.tasks()
            .filter(|(_, t)| t.batch_id.as_str() == batch_id)
            .map(|(_, t)| t)
            .collect()
    }

    pub fn malformed_count(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| matches!(r, QueueRow::Malformed { .. }))
            .count()
    }

    /// Finds the row a key refers to, falling back to a scan if the row
    /// index no longer matches.
    pub fn locate(&self, key: &TaskKey) -> Option<usize> {
        if matches!(self.task(key.row), Some(t) if key.matches(t)) {
            return Some(key.row);
        }
        self.tasks()
            .find(|(_, t)| key.matches(t))
            .map(|(idx, _)| idx)
    }

    /// Applies a validated status transition to the task at `row`.
    pub fn transition(&mut self, row: usize, to: TaskStatus) -> Result<&TaskRecord, QueueError> {
        let input = self
            .task(row)
            .map(|t| t.input_path.display().to_string())
            .unwrap_or_default();
        match self.rows.get_mut(row) {
            Some(QueueRow::Task(task)) => {
                task.transition(to)?;
                self.dirty = true;
                Ok(task)
            }
            _ => Err(QueueError::TaskVanished { row, input }),
        }
    }

    /// Whether the table changed since it was loaded.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn records(&self) -> Vec<StringRecord> {
        self.rows
            .iter()
            .map(|row| match row {
                QueueRow::Task(task) => task.to_record(),
                QueueRow::Malformed { record, .. } => record.clone(),
            })
            .collect()
    }
}

fn default_header() -> StringRecord {
    StringRecord::from(QUEUE_COLUMNS.to_vec())
}

/// Handle to the queue file.
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes the exclusive queue lock. The lock is held until the returned
    /// transaction is dropped.
    pub fn begin(&self) -> Result<QueueTxn, QueueError> {
        Ok(QueueTxn {
            table: LockedTable::exclusive(&self.path)?,
        })
    }

    /// Appends tasks in one locked write.
    pub fn append(&self, tasks: &[TaskRecord]) -> Result<(), QueueError> {
        self.begin()?.append(tasks)
    }

    /// Runs `f` against the loaded table under the exclusive lock and writes
    /// the table back if `f` changed it.
    ///
    /// Nothing is written when `f` fails.
    pub fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut QueueTable) -> Result<T, E>,
        E: From<QueueError>,
    {
        let mut txn = self.begin()?;
        let mut table = txn.load()?;
        let value = f(&mut table)?;
        if table.is_dirty() {
            txn.rewrite(&table)?;
        }
        Ok(value)
    }

    /// Loads the table under a shared lock.
    pub fn snapshot(&self) -> Result<QueueTable, QueueError> {
        match LockedTable::shared(&self.path)? {
            Some(mut table) => Ok(QueueTable::from_raw(table.read()?, &self.path)),
            None => Ok(QueueTable::from_raw(RawTable::default(), &self.path)),
        }
    }
}

/// An exclusive-lock session on the queue file.
pub struct QueueTxn {
    table: LockedTable,
}

impl QueueTxn {
    /// Reads the full table in file order.
    pub fn load(&mut self) -> Result<QueueTable, QueueError> {
        let path = self.table.path().to_path_buf();
        let table = QueueTable::from_raw(self.table.read()?, &path);
        debug!(
            path = %path.display(),
            rows = table.rows.len(),
            malformed = table.malformed_count(),
            "Queue loaded"
        );
        Ok(table)
    }

    /// Replaces the table contents.
    pub fn rewrite(&mut self, table: &QueueTable) -> Result<(), QueueError> {
        self.table.rewrite(&table.header, &table.records())?;
        Ok(())
    }

    /// Appends tasks at the end of the table.
    pub fn append(&mut self, tasks: &[TaskRecord]) -> Result<(), QueueError> {
        let records: Vec<StringRecord> = tasks.iter().map(TaskRecord::to_record).collect();
        self.table.append(&default_header(), &records)?;
        Ok(())
    }
}
