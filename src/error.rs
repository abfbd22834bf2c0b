//! Error types for stilq operations.
//!
//! Defines error types for each subsystem:
//! - Locked CSV table access
//! - Queue transactions and task state transitions
//! - The driver's process lock
//! - Submission validation
//! - Execution routing and the remote backend
//! - Batch notifications
//! - The driver cycle

use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::job::TaskStatus;

/// Errors raised by locked CSV table access.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("Failed to lock '{path}': {reason}")]
    LockFailed { path: PathBuf, reason: String },

    #[error("CSV error in '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task at row {row} ({input}) is no longer in the queue")]
    TaskVanished { row: usize, input: String },

    #[error("Unknown task status '{0}'")]
    UnknownStatus(String),
}

/// Errors raised by the driver process lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to create lock file '{path}': {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move aside stale lock file '{path}': {source}")]
    RemoveStale {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that abort a submission before anything is written.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Source table not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("Source table must contain an InputPath column (or legacy STIL_Path)")]
    MissingInputColumn,

    #[error("Source table contains no tasks")]
    Empty,

    #[error("Row {row}: missing input path")]
    MissingPath { row: usize },

    #[error("Row {row}: input path must be absolute: {path}")]
    NotAbsolute { row: usize, path: String },

    #[error("Row {row}: input file not found at specified path: {path}")]
    NotFound { row: usize, path: String },

    #[error("Row {row}: input path does not match its actual location: {path}")]
    PathMismatch { row: usize, path: String },

    #[error("Unrecognized execution mode '{0}'")]
    UnknownMode(String),

    #[error("Execution mode '{0}' has no configured profile")]
    UnconfiguredMode(String),

    #[error("Failed to read source table: {0}")]
    Source(#[from] csv::Error),

    #[error("Failed to write to queue: {0}")]
    Queue(#[from] QueueError),
}

/// Errors resolving how a task should run.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Unrecognized execution mode '{0}'")]
    UnknownMode(String),

    #[error("Execution mode '{0}' has no configured profile")]
    UnconfiguredMode(String),

    #[error("Cannot stat input '{path}': {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors querying the remote execution backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with code {code}: {stderr}")]
    QueryFailed {
        program: String,
        code: i32,
        stderr: String,
    },
}

/// Errors delivering a batch notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to start mail program '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Mail program exited with code {code}: {stderr}")]
    Rejected { code: i32, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that end a driver cycle early.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Process lock error: {0}")]
    Lock(#[from] LockError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
