//! Integration tests for the driver cycle.
//!
//! The external tool is stood in for by `true` / `false`, the cluster
//! backend and the mail transport by in-test fakes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use stilq::error::{BackendError, DriverError, NotifyError, QueueError};
use stilq::notify::{Notification, Notifier};
use stilq::runner::{ClusterBackend, Reservation};
use stilq::scheduler::{
    Admission, BatchId, CycleOutcome, Driver, ExecutionMode, QueueStore, SkipReason, TaskRecord,
    TaskStatus,
};
use stilq::submit::{SubmissionValidator, Submitter};
use stilq::SchedulerConfig;

struct FakeBackend {
    in_flight: Option<usize>,
}

#[async_trait]
impl ClusterBackend for FakeBackend {
    async fn in_flight(&self, _job_name: &str) -> Result<usize, BackendError> {
        self.in_flight.ok_or_else(|| BackendError::QueryFailed {
            program: "squeue".to_string(),
            code: 1,
            stderr: "slurm_load_jobs error: Unable to contact slurm controller".to_string(),
        })
    }

    fn launch_command(&self, _reservation: &Reservation, command: Vec<String>) -> Vec<String> {
        command
    }
}

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for Outbox {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

impl Outbox {
    fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

struct Fixture {
    _temp: TempDir,
    root: PathBuf,
    config: SchedulerConfig,
    outbox: Arc<Outbox>,
}

impl Fixture {
    fn new(program: &str) -> Self {
        let temp = TempDir::new().unwrap();
        let root = fs::canonicalize(temp.path()).unwrap();

        let mut config = SchedulerConfig::default();
        config.paths.queue_file = root.join("queue.csv");
        config.paths.execution_log_file = root.join("execution_log.csv");
        config.paths.lock_file = root.join("driver.lock");
        config.paths.log_dir = root.join("logs");
        config.paths.workspace_dir = root.join("workspace");
        config.tool.program = program.to_string();
        config
            .tool
            .profiles
            .insert(ExecutionMode::Smt8, root.join("smt8.set"));
        config.email.from = "stilq@example.com".to_string();

        Self {
            _temp: temp,
            root,
            config,
            outbox: Arc::new(Outbox::default()),
        }
    }

    fn driver_with(&self, in_flight: Option<usize>) -> Driver {
        Driver::from_config(
            &self.config,
            Arc::new(FakeBackend { in_flight }),
            self.outbox.clone(),
        )
    }

    fn driver(&self) -> Driver {
        self.driver_with(Some(0))
    }

    fn store(&self) -> QueueStore {
        QueueStore::new(self.config.paths.queue_file.clone())
    }

    fn input(&self, name: &str) -> PathBuf {
        let path = self.root.join(name);
        fs::write(&path, "Signals { }").unwrap();
        path
    }

    fn submit(&self, source_name: &str, inputs: &[&Path]) -> BatchId {
        let source = self.root.join(source_name);
        let mut content = String::from("InputPath\n");
        for input in inputs {
            content.push_str(&format!("{}\n", input.display()));
        }
        fs::write(&source, content).unwrap();

        let submitter = Submitter {
            user: "alice".to_string(),
            email: "alice@example.com".to_string(),
        };
        SubmissionValidator::from_config(&self.config)
            .submit(&source, None, &submitter)
            .unwrap()
            .batch_id
    }

    fn statuses(&self) -> Vec<(PathBuf, TaskStatus)> {
        self.store()
            .snapshot()
            .unwrap()
            .tasks()
            .map(|(_, t)| (t.input_path.clone(), t.status))
            .collect()
    }

    fn execution_log_rows(&self) -> Vec<csv::StringRecord> {
        let path = &self.config.paths.execution_log_file;
        if !path.exists() {
            return Vec::new();
        }
        csv::Reader::from_path(path)
            .unwrap()
            .records()
            .map(|r| r.unwrap())
            .collect()
    }

    fn queue_bytes(&self) -> Vec<u8> {
        fs::read(&self.config.paths.queue_file).unwrap()
    }
}

#[tokio::test]
async fn test_single_task_completes_and_notifies() {
    let fx = Fixture::new("true");
    let input = fx.input("core.stil");
    fx.submit("release.csv", &[&input]);

    let outcome = fx.driver().run_cycle().await.unwrap();
    match &outcome {
        CycleOutcome::Executed {
            status,
            duration_secs,
            log_path,
            ..
        } => {
            assert_eq!(*status, TaskStatus::Complete);
            assert!(*duration_secs >= 0.0);
            assert!(log_path.exists());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert_eq!(fx.statuses(), vec![(input.clone(), TaskStatus::Complete)]);

    let rows = fx.execution_log_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][3], input.display().to_string());
    assert!(rows[0][4].parse::<f64>().unwrap() >= 0.0);
    assert_eq!(&rows[0][5], "COMPLETE");

    let sent = fx.outbox.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "alice@example.com");
    assert!(sent[0].subject.starts_with("[PASS] Pattern Release : release_"));
    assert!(sent[0].body.contains("1 Passed, 0 Failed"));

    assert!(!fx.config.paths.lock_file.exists());
    assert!(matches!(
        fx.driver().run_cycle().await.unwrap(),
        CycleOutcome::NoPendingWork
    ));
}

#[tokio::test]
async fn test_batch_closes_exactly_once() {
    let fx = Fixture::new("false");
    let inputs: Vec<PathBuf> = (1..=3).map(|i| fx.input(&format!("p{i}.stil"))).collect();
    let refs: Vec<&Path> = inputs.iter().map(PathBuf::as_path).collect();
    fx.submit("release.csv", &refs);

    let driver = fx.driver();
    for cycle in 1..=3 {
        let outcome = driver.run_cycle().await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Executed {
                status: TaskStatus::Failed,
                ..
            }
        ));
        assert_eq!(outcome.closed_batch().is_some(), cycle == 3);
        assert_eq!(fx.outbox.sent().len(), usize::from(cycle == 3));
    }

    assert!(fx
        .statuses()
        .iter()
        .all(|(_, status)| *status == TaskStatus::Failed));

    let sent = fx.outbox.sent();
    assert!(sent[0].subject.starts_with("[FAIL]"));
    assert!(sent[0].body.contains("Result: 0 Passed, 3 Failed, 0 Skipped"));
    assert_eq!(fx.execution_log_rows().len(), 3);
}

#[tokio::test]
async fn test_earlier_batch_drains_first() {
    let fx = Fixture::new("true");
    let a1 = fx.input("a1.stil");
    let a2 = fx.input("a2.stil");
    let b1 = fx.input("b1.stil");
    fx.submit("first.csv", &[&a1, &a2]);
    fx.submit("second.csv", &[&b1]);

    let driver = fx.driver();
    driver.run_cycle().await.unwrap();
    assert_eq!(
        fx.statuses(),
        vec![
            (a1.clone(), TaskStatus::Complete),
            (a2.clone(), TaskStatus::Pending),
            (b1.clone(), TaskStatus::Pending),
        ]
    );

    driver.run_cycle().await.unwrap();
    assert_eq!(fx.statuses()[2], (b1.clone(), TaskStatus::Pending));

    driver.run_cycle().await.unwrap();
    assert_eq!(fx.statuses()[2], (b1, TaskStatus::Complete));
    assert_eq!(fx.outbox.sent().len(), 2);
}

#[tokio::test]
async fn test_admission_at_capacity_changes_nothing() {
    let fx = Fixture::new("true");
    let input = fx.input("core.stil");
    fx.submit("release.csv", &[&input]);
    let before = fx.queue_bytes();

    let outcome = fx.driver_with(Some(1)).run_cycle().await.unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::AdmissionBlocked(Admission::Blocked {
            in_flight: 1,
            capacity: 1
        })
    ));
    assert_eq!(fx.queue_bytes(), before);
    assert!(fx.execution_log_rows().is_empty());
    assert!(!fx.config.paths.lock_file.exists());
}

#[tokio::test]
async fn test_unknown_in_flight_count_blocks() {
    let fx = Fixture::new("true");
    let input = fx.input("core.stil");
    fx.submit("release.csv", &[&input]);
    let before = fx.queue_bytes();

    let outcome = fx.driver_with(None).run_cycle().await.unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::AdmissionBlocked(Admission::Unknown { .. })
    ));
    assert_eq!(fx.queue_bytes(), before);
}

#[tokio::test]
async fn test_held_lock_changes_nothing() {
    let fx = Fixture::new("true");
    let input = fx.input("core.stil");
    fx.submit("release.csv", &[&input]);
    fs::write(&fx.config.paths.lock_file, "").unwrap();
    let before = fx.queue_bytes();

    let outcome = fx.driver().run_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::LockHeld { holder: None }));
    assert_eq!(fx.queue_bytes(), before);
    // Another driver's lock is never removed.
    assert!(fx.config.paths.lock_file.exists());
}

#[tokio::test]
async fn test_missing_input_is_skipped() {
    let fx = Fixture::new("true");
    let keep = fx.input("keep.stil");
    let gone = fx.input("gone.stil");
    fx.submit("release.csv", &[&gone, &keep]);
    fs::remove_file(&gone).unwrap();

    let driver = fx.driver();
    let outcome = driver.run_cycle().await.unwrap();
    match &outcome {
        CycleOutcome::Skipped { reason, closed, .. } => {
            assert_eq!(*reason, SkipReason::InputMissing(gone.clone()));
            assert!(closed.is_none());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(fx.execution_log_rows().is_empty());

    driver.run_cycle().await.unwrap();
    let sent = fx.outbox.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].subject.starts_with("[PASS]"));
    assert!(sent[0].body.contains("1 Passed, 0 Failed, 1 Skipped"));
    assert!(sent[0]
        .body
        .contains(&format!("{}  -->  SKIPPED", gone.display())));
}

#[tokio::test]
async fn test_missing_pattern_source_is_skipped() {
    let mut fx = Fixture::new("true");
    let sources = fx.root.join("sources");
    fs::create_dir_all(sources.join("present")).unwrap();
    fx.config.pattern_source_dir = Some(sources.clone());

    let absent = fx.input("absent_.stil");
    let present = fx.input("present.stil");
    fx.submit("release.csv", &[&absent, &present]);

    let driver = fx.driver();
    match driver.run_cycle().await.unwrap() {
        CycleOutcome::Skipped { reason, .. } => {
            assert_eq!(reason, SkipReason::PatternSourceMissing(sources.join("absent")));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(matches!(
        driver.run_cycle().await.unwrap(),
        CycleOutcome::Executed {
            status: TaskStatus::Complete,
            ..
        }
    ));
}

#[tokio::test]
async fn test_unknown_mode_fails_without_launch() {
    let fx = Fixture::new("true");
    let input = fx.input("core.stil");
    fx.store()
        .append(&[TaskRecord {
            submitted_at: "2025-03-01 10:00:00".to_string(),
            submitted_by: "alice".to_string(),
            email: "alice@example.com".to_string(),
            batch_id: BatchId::from("manual_250301_1000"),
            input_path: input.clone(),
            mode: "smt9".to_string(),
            status: TaskStatus::Pending,
        }])
        .unwrap();

    let outcome = fx.driver().run_cycle().await.unwrap();
    let log_path = match outcome {
        CycleOutcome::Executed {
            status: TaskStatus::Failed,
            duration_secs,
            log_path,
            ..
        } => {
            assert_eq!(duration_secs, 0.0);
            log_path
        }
        other => panic!("unexpected outcome: {other:?}"),
    };

    let task_log = fs::read_to_string(log_path).unwrap();
    assert!(task_log.contains("FAILED:"));
    assert!(task_log.contains("smt9"));

    let rows = fx.execution_log_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][5], "FAILED");
    assert_eq!(fx.outbox.sent().len(), 1);
}

#[tokio::test]
async fn test_malformed_rows_survive_cycles() {
    let fx = Fixture::new("true");
    let input = fx.input("core.stil");
    fx.submit("release.csv", &[&input]);

    let mut content = fs::read_to_string(&fx.config.paths.queue_file).unwrap();
    content.push_str("garbage,row\n");
    fs::write(&fx.config.paths.queue_file, content).unwrap();

    fx.driver().run_cycle().await.unwrap();

    let content = fs::read_to_string(&fx.config.paths.queue_file).unwrap();
    assert!(content.contains("garbage,row"));
    assert_eq!(fx.statuses(), vec![(input, TaskStatus::Complete)]);
}

#[tokio::test]
async fn test_running_is_committed_before_the_tool_starts() {
    let fx = Fixture::new("true");
    let input = fx.input("core.stil");
    fx.submit("release.csv", &[&input]);

    let mut seen = None;
    let outcome = fx
        .driver()
        .run_cycle_with(|claimed| {
            // The queue lock is free here: a second reader gets in.
            let table = fx.store().snapshot().unwrap();
            let status = table
                .tasks()
                .find(|(_, t)| t.input_path == claimed.task.input_path)
                .map(|(_, t)| t.status);
            seen = Some(status);
        })
        .await
        .unwrap();

    assert_eq!(seen, Some(Some(TaskStatus::Running)));
    assert!(matches!(
        outcome,
        CycleOutcome::Executed {
            status: TaskStatus::Complete,
            ..
        }
    ));
}

#[tokio::test]
async fn test_failed_commit_still_logs_the_run() {
    let fx = Fixture::new("true");
    let input = fx.input("core.stil");
    fx.submit("release.csv", &[&input]);
    let queue_file = fx.config.paths.queue_file.clone();

    let err = fx
        .driver()
        .run_cycle_with(|_| {
            fs::write(
                &queue_file,
                "Timestamp,SubmittedBy,Email,BatchID,InputPath,Mode,Status\n",
            )
            .unwrap();
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DriverError::Queue(QueueError::TaskVanished { .. })
    ));
    let rows = fx.execution_log_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][3], input.display().to_string());
    assert_eq!(&rows[0][5], "COMPLETE");
    assert!(!fx.config.paths.lock_file.exists());
}
