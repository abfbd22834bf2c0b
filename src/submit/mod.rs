//! Submission of source tables to the queue.
//!
//! A submission is all-or-nothing: every row is validated before the queue
//! is touched, and the accepted rows are appended in one locked write under
//! a single batch id.

pub mod source;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::info;

use crate::config::SchedulerConfig;
use crate::error::SubmitError;
use crate::scheduler::batch::BatchId;
use crate::scheduler::job::{ExecutionMode, TaskRecord, TaskStatus, TIMESTAMP_FORMAT};
use crate::scheduler::queue::QueueStore;

pub use source::{read_inputs, validate_inputs};

/// Who submitted a batch and where its report goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitter {
    pub user: String,
    pub email: String,
}

impl Submitter {
    /// The login user from `$USER` (or `$LOGNAME`), addressed at `domain`
    /// unless `email` overrides it.
    pub fn from_env(domain: &str, email: Option<String>) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let email = email.unwrap_or_else(|| format!("{}@{}", user, domain));
        Self { user, email }
    }
}

/// Result of an accepted submission.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub batch_id: BatchId,
    pub count: usize,
}

/// Validates source tables and appends them to the queue.
pub struct SubmissionValidator {
    store: QueueStore,
    profiles: BTreeMap<ExecutionMode, PathBuf>,
}

impl SubmissionValidator {
    pub fn new(store: QueueStore, profiles: BTreeMap<ExecutionMode, PathBuf>) -> Self {
        Self { store, profiles }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            QueueStore::new(config.paths.queue_file.clone()),
            config.tool.profiles.clone(),
        )
    }

    /// Parses a submission-wide mode and checks that it has a profile.
    pub fn check_mode(&self, mode: &str) -> Result<ExecutionMode, SubmitError> {
        let mode: ExecutionMode = mode
            .parse()
            .map_err(|_| SubmitError::UnknownMode(mode.to_string()))?;
        if !self.profiles.contains_key(&mode) {
            return Err(SubmitError::UnconfiguredMode(mode.to_string()));
        }
        Ok(mode)
    }

    /// Validates `source` and queues every row as one new batch.
    ///
    /// Tasks without a mode run with the configured default profile.
    pub fn submit(
        &self,
        source: &Path,
        mode: Option<&str>,
        submitter: &Submitter,
    ) -> Result<SubmitReceipt, SubmitError> {
        let mode = mode.map(|m| self.check_mode(m)).transpose()?;
        let inputs = validate_inputs(&read_inputs(source)?)?;

        let now = Local::now();
        let batch_id = BatchId::generate(source, now);
        let submitted_at = now.format(TIMESTAMP_FORMAT).to_string();
        let tasks: Vec<TaskRecord> = inputs
            .into_iter()
            .map(|input_path| TaskRecord {
                submitted_at: submitted_at.clone(),
                submitted_by: submitter.user.clone(),
                email: submitter.email.clone(),
                batch_id: batch_id.clone(),
                input_path,
                mode: mode.map(|m| m.to_string()).unwrap_or_default(),
                status: TaskStatus::Pending,
            })
            .collect();

        self.store.append(&tasks)?;
        info!(
            batch = %batch_id,
            tasks = tasks.len(),
            user = %submitter.user,
            "Batch submitted"
        );

        Ok(SubmitReceipt {
            batch_id,
            count: tasks.len(),
        })
    }
}
