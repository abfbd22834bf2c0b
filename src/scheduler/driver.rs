//! One driver cycle: lock, admit, claim, run, commit, notify.
//!
//! A cycle runs at most one task. It is meant to be triggered externally
//! (cron or a systemd timer) and always ends by releasing the process lock.
//!
//! ```text
//! ProcessLock ─► AdmissionController ─► claim (queue txn) ─► ExecutionRouter
//!                                           │                     │
//!                                        SKIPPED               JobRunner
//!                                           │                     │
//!                                           │          commit (queue txn) ─► ExecutionLog
//!                                           ▼                     ▼
//!                                     BatchCompletionNotifier ◄───┘
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use super::admission::{Admission, AdmissionController};
use super::batch::{select_next, BatchId};
use super::job::{TaskRecord, TaskStatus};
use super::lock::{LockAcquisition, LockHolder, ProcessLock};
use super::queue::{QueueStore, QueueTable, TaskKey};
use crate::config::SchedulerConfig;
use crate::error::{DriverError, QueueError};
use crate::notify::{BatchClosed, BatchCompletionNotifier, Notifier};
use crate::runner::{
    ClusterBackend, ExecutionLog, ExecutionRecord, ExecutionRouter, JobRunner, RunOutcome,
    RunRequest, ToolSettings,
};

/// Why a pending task was skipped instead of run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The input file is gone or is no longer a regular file.
    InputMissing(PathBuf),
    /// The project's pattern source directory does not exist.
    PatternSourceMissing(PathBuf),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InputMissing(path) => write!(f, "input missing: {}", path.display()),
            SkipReason::PatternSourceMissing(path) => {
                write!(f, "pattern source missing: {}", path.display())
            }
        }
    }
}

/// A task moved to RUNNING by this cycle.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub key: TaskKey,
    pub task: TaskRecord,
}

impl fmt::Display for ClaimedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Executing task: {} (batch {})",
            self.task.input_path.display(),
            self.task.batch_id
        )
    }
}

enum Claim {
    Run(ClaimedTask),
    Skip { task: TaskRecord, reason: SkipReason },
}

/// What one cycle did.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// Another driver holds the process lock.
    LockHeld { holder: Option<LockHolder> },
    /// Too many jobs in flight, or the count is unknown.
    AdmissionBlocked(Admission),
    NoPendingWork,
    Skipped {
        batch_id: BatchId,
        input: PathBuf,
        reason: SkipReason,
        closed: Option<BatchClosed>,
    },
    Executed {
        batch_id: BatchId,
        input: PathBuf,
        status: TaskStatus,
        duration_secs: f64,
        log_path: PathBuf,
        closed: Option<BatchClosed>,
    },
}

impl CycleOutcome {
    /// The batch this cycle closed, if any.
    pub fn closed_batch(&self) -> Option<&BatchClosed> {
        match self {
            CycleOutcome::Skipped { closed, .. } | CycleOutcome::Executed { closed, .. } => {
                closed.as_ref()
            }
            _ => None,
        }
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::LockHeld { holder: Some(h) } => write!(
                f,
                "Driver already running (pid {} since {}); exiting",
                h.pid,
                h.acquired_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
            ),
            CycleOutcome::LockHeld { holder: None } => {
                write!(f, "Driver already running; exiting")
            }
            CycleOutcome::AdmissionBlocked(Admission::Unknown { reason }) => {
                write!(f, "Admission blocked: in-flight jobs unknown ({})", reason)
            }
            CycleOutcome::AdmissionBlocked(
                Admission::Blocked { in_flight, capacity } | Admission::Open { in_flight, capacity },
            ) => write!(
                f,
                "Admission blocked: {} of {} licenses in use",
                in_flight, capacity
            ),
            CycleOutcome::NoPendingWork => write!(f, "No pending tasks"),
            CycleOutcome::Skipped { input, reason, .. } => {
                write!(f, "Skipped task: {} ({})", input.display(), reason)
            }
            CycleOutcome::Executed {
                input,
                status,
                duration_secs,
                ..
            } => write!(
                f,
                "Task finished: {} -> {} in {:.2}s",
                input.display(),
                status,
                duration_secs
            ),
        }
    }
}

/// Runs driver cycles against one queue.
pub struct Driver {
    store: QueueStore,
    lock_path: PathBuf,
    stale_after: Option<Duration>,
    log_dir: PathBuf,
    pattern_source_dir: Option<PathBuf>,
    admission: AdmissionController,
    router: ExecutionRouter,
    runner: JobRunner,
    execution_log: ExecutionLog,
    completion: BatchCompletionNotifier,
}

impl Driver {
    pub fn from_config(
        config: &SchedulerConfig,
        backend: Arc<dyn ClusterBackend>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store: QueueStore::new(config.paths.queue_file.clone()),
            lock_path: config.paths.lock_file.clone(),
            stale_after: config.stale_lock_after(),
            log_dir: config.paths.log_dir.clone(),
            pattern_source_dir: config.pattern_source_dir.clone(),
            admission: AdmissionController::new(
                backend.clone(),
                config.remote.job_name.clone(),
                config.admission.capacity,
            ),
            router: ExecutionRouter::from_config(config),
            runner: JobRunner::new(ToolSettings::from_config(config), backend),
            execution_log: ExecutionLog::new(config.paths.execution_log_file.clone()),
            completion: BatchCompletionNotifier::new(notifier, config.email.from.clone()),
        }
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub async fn run_cycle(&self) -> Result<CycleOutcome, DriverError> {
        self.run_cycle_with(|_| {}).await
    }

    /// Runs one cycle, calling `on_start` after the task is committed as
    /// RUNNING and before the tool starts.
    ///
    /// The process lock is held for the whole cycle and released on every
    /// return path, including errors.
    pub async fn run_cycle_with<F>(&self, on_start: F) -> Result<CycleOutcome, DriverError>
    where
        F: FnOnce(&ClaimedTask),
    {
        let _lock = match ProcessLock::acquire(&self.lock_path, self.stale_after)? {
            LockAcquisition::Acquired(lock) => lock,
            LockAcquisition::AlreadyHeld { holder } => {
                info!(
                    lock = %self.lock_path.display(),
                    pid = holder.as_ref().map(|h| h.pid),
                    "Driver lock held, skipping cycle"
                );
                return Ok(CycleOutcome::LockHeld { holder });
            }
        };

        let admission = self.admission.check().await;
        if !admission.is_open() {
            info!(?admission, "Admission blocked, skipping cycle");
            return Ok(CycleOutcome::AdmissionBlocked(admission));
        }

        let claim = self.store.transact(|table| self.claim(table))?;
        match claim {
            None => {
                debug!("No pending tasks");
                Ok(CycleOutcome::NoPendingWork)
            }
            Some(Claim::Skip { task, reason }) => {
                info!(
                    batch = %task.batch_id,
                    input = %task.input_path.display(),
                    %reason,
                    "Task skipped"
                );
                let closed = self.close_batch(&task.batch_id).await;
                Ok(CycleOutcome::Skipped {
                    batch_id: task.batch_id,
                    input: task.input_path,
                    reason,
                    closed,
                })
            }
            Some(Claim::Run(claimed)) => {
                on_start(&claimed);
                self.execute(claimed).await
            }
        }
    }

    /// Selects the next task and commits its first transition.
    fn claim(&self, table: &mut QueueTable) -> Result<Option<Claim>, QueueError> {
        let Some(row) = select_next(table) else {
            return Ok(None);
        };

        let skip = table.task(row).and_then(|task| self.missing_artifact(task));
        match skip {
            Some(reason) => {
                let task = table.transition(row, TaskStatus::Skipped)?.clone();
                Ok(Some(Claim::Skip { task, reason }))
            }
            None => {
                let task = table.transition(row, TaskStatus::Running)?.clone();
                Ok(Some(Claim::Run(ClaimedTask {
                    key: TaskKey::of(row, &task),
                    task,
                })))
            }
        }
    }

    fn missing_artifact(&self, task: &TaskRecord) -> Option<SkipReason> {
        if !task.input_path.is_file() {
            return Some(SkipReason::InputMissing(task.input_path.clone()));
        }
        let source_dir = self.pattern_source_dir.as_ref()?.join(task.project_name());
        if !source_dir.is_dir() {
            return Some(SkipReason::PatternSourceMissing(source_dir));
        }
        None
    }

    async fn execute(&self, claimed: ClaimedTask) -> Result<CycleOutcome, DriverError> {
        let ClaimedTask { key, task } = claimed;
        let log_path = task_log_path(&self.log_dir, &task.batch_id, Local::now());

        let outcome = match self.router.route(&task) {
            Ok(plan) => {
                let request = RunRequest {
                    input: &task.input_path,
                    batch_id: &task.batch_id,
                    log_path: &log_path,
                    plan: &plan,
                };
                self.runner.run(&request).await
            }
            Err(e) => {
                warn!(
                    batch = %task.batch_id,
                    input = %task.input_path.display(),
                    error = %e,
                    "Task rejected before launch"
                );
                let outcome = RunOutcome::not_started(e.to_string());
                if let Err(e) = outcome.append_to_log(&log_path) {
                    warn!(log = %log_path.display(), error = %e, "Failed to write task log");
                }
                outcome
            }
        };

        let status = outcome.status();
        let committed = self.store.transact(|table| commit(table, &key, status));

        // The run happened whether or not the queue accepted its status.
        let record = ExecutionRecord::from_outcome(&task.batch_id, &task.input_path, &outcome);
        if let Err(e) = self.execution_log.append(&record) {
            warn!(
                log = %self.execution_log.path().display(),
                error = %e,
                "Failed to append execution log"
            );
        }
        committed?;
        info!(
            batch = %task.batch_id,
            input = %task.input_path.display(),
            %status,
            duration_secs = outcome.duration_secs,
            "Task finished"
        );

        let closed = self.close_batch(&task.batch_id).await;
        Ok(CycleOutcome::Executed {
            batch_id: task.batch_id,
            input: task.input_path,
            status,
            duration_secs: outcome.duration_secs,
            log_path,
            closed,
        })
    }

    async fn close_batch(&self, batch_id: &BatchId) -> Option<BatchClosed> {
        match self.completion.on_terminal(&self.store, batch_id).await {
            Ok(closed) => closed,
            Err(e) => {
                warn!(batch = %batch_id, error = %e, "Failed to check batch completion");
                None
            }
        }
    }
}

fn commit(table: &mut QueueTable, key: &TaskKey, status: TaskStatus) -> Result<(), QueueError> {
    let row = table.locate(key).ok_or_else(|| QueueError::TaskVanished {
        row: key.row,
        input: key.input_path.display().to_string(),
    })?;
    table.transition(row, status)?;
    Ok(())
}

/// Per-task log file: `<log_dir>/<batch id>_<YYYYmmdd_HHMMSS>.log`.
pub fn task_log_path(log_dir: &Path, batch_id: &BatchId, at: DateTime<Local>) -> PathBuf {
    log_dir.join(format!("{}_{}.log", batch_id, at.format("%Y%m%d_%H%M%S")))
}
