//! Job runner - builds the tool command line and runs it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::backend::ClusterBackend;
use super::result::{round_secs, RunOutcome};
use super::router::{ExecutionPlan, Locality};
use crate::config::SchedulerConfig;
use crate::scheduler::batch::BatchId;
use crate::scheduler::job::project_name;

/// How the pattern-generation tool is invoked.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    /// Tool executable.
    pub program: String,
    /// Shell snippet run before the tool, e.g. environment-module setup.
    pub preamble: Option<String>,
    /// Fixed leading arguments, e.g. `-input_file_type:STIL`.
    pub extra_args: Vec<String>,
    /// Directory the tool writes its project into.
    pub workspace_dir: PathBuf,
}

impl ToolSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            program: config.tool.program.clone(),
            preamble: config.tool.preamble.clone(),
            extra_args: config.tool.extra_args.clone(),
            workspace_dir: config.paths.workspace_dir.clone(),
        }
    }
}

/// One invocation of the tool.
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub input: &'a Path,
    pub batch_id: &'a BatchId,
    pub log_path: &'a Path,
    pub plan: &'a ExecutionPlan,
}

/// Runs the external tool for one task.
pub struct JobRunner {
    settings: ToolSettings,
    backend: Arc<dyn ClusterBackend>,
}

impl JobRunner {
    pub fn new(settings: ToolSettings, backend: Arc<dyn ClusterBackend>) -> Self {
        Self { settings, backend }
    }

    /// Tool executable followed by its arguments.
    pub fn tool_args(&self, request: &RunRequest<'_>) -> Vec<String> {
        let mut args = Vec::with_capacity(self.settings.extra_args.len() + 8);
        args.push(self.settings.program.clone());
        args.extend(self.settings.extra_args.iter().cloned());
        args.push(format!("-workdir:{}", self.settings.workspace_dir.display()));
        args.push(format!("-project_name:{}", project_name(request.input)));
        args.push(format!("-logfile:{}", request.log_path.display()));
        args.push(format!("-setup:{}", request.plan.profile.display()));
        args.push("-licwait".to_string());
        args.push("-timestamp".to_string());
        args.push(request.input.display().to_string());
        args
    }

    /// Full command line: preamble shell, then the cluster launcher for
    /// remote runs.
    ///
    /// The preamble form passes the tool and its arguments positionally to
    /// `bash -c`, so nothing is re-parsed by the shell.
    pub fn command_line(&self, request: &RunRequest<'_>) -> Vec<String> {
        let tool = self.tool_args(request);
        let command = match &self.settings.preamble {
            Some(preamble) if !preamble.trim().is_empty() => {
                let mut wrapped = vec![
                    "bash".to_string(),
                    "-c".to_string(),
                    format!("{} && exec \"$0\" \"$@\"", preamble.trim()),
                ];
                wrapped.extend(tool);
                wrapped
            }
            _ => tool,
        };

        match &request.plan.locality {
            Locality::Local => command,
            Locality::Remote(reservation) => self.backend.launch_command(reservation, command),
        }
    }

    /// Runs the tool and waits for it.
    ///
    /// Never fails: a process that cannot be started is reported as an
    /// unsuccessful outcome with zero duration. The merged output is also
    /// appended to the per-task log file.
    pub async fn run(&self, request: &RunRequest<'_>) -> RunOutcome {
        if let Some(parent) = request.log_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(dir = %parent.display(), error = %e, "Failed to create log directory");
            }
        }

        let argv = self.command_line(request);
        let outcome = match argv.split_first() {
            Some((program, args)) => self.spawn(program, args, request).await,
            None => RunOutcome::not_started("empty command line"),
        };

        if let Err(e) = outcome.append_to_log(request.log_path) {
            warn!(log = %request.log_path.display(), error = %e, "Failed to write task log");
        }
        outcome
    }

    async fn spawn(&self, program: &str, args: &[String], request: &RunRequest<'_>) -> RunOutcome {
        info!(
            batch_id = %request.batch_id,
            input = %request.input.display(),
            remote = request.plan.locality.is_remote(),
            "Starting tool"
        );
        debug!("Command: {} {}", program, args.join(" "));

        let started_at = Local::now();
        let start = Instant::now();
        let result = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await;

        match result {
            Ok(output) => {
                let duration_secs = round_secs(start.elapsed().as_secs_f64());
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let outcome = RunOutcome {
                    success: output.status.success(),
                    exit_code: output.status.code(),
                    output: format!("{}\n{}", stdout, stderr),
                    started_at,
                    finished_at: Local::now(),
                    duration_secs,
                };
                info!(
                    batch_id = %request.batch_id,
                    exit_code = ?outcome.exit_code,
                    duration_secs,
                    "Tool finished"
                );
                outcome
            }
            Err(e) => {
                error!(program, error = %e, "Failed to start tool");
                RunOutcome::not_started(format!("Failed to start '{}': {}", program, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::backend::{Reservation, SlurmBackend};
    use crate::scheduler::job::ExecutionMode;
    use tempfile::TempDir;

    fn runner(program: &str, preamble: Option<&str>) -> JobRunner {
        JobRunner::new(
            ToolSettings {
                program: program.to_string(),
                preamble: preamble.map(String::from),
                extra_args: vec!["-input_file_type:STIL".to_string()],
                workspace_dir: PathBuf::from("/release"),
            },
            Arc::new(SlurmBackend::default()),
        )
    }

    fn plan(locality: Locality) -> ExecutionPlan {
        ExecutionPlan {
            locality,
            mode: ExecutionMode::Smt8,
            profile: PathBuf::from("/cfg/setup.py"),
            input_bytes: 10,
        }
    }

    #[test]
    fn test_tool_args() {
        let batch = BatchId::from("list_250301_0907");
        let plan = plan(Locality::Local);
        let request = RunRequest {
            input: Path::new("/data/core_top_.stil.gz"),
            batch_id: &batch,
            log_path: Path::new("/logs/list.log"),
            plan: &plan,
        };

        assert_eq!(
            runner("ategen", None).tool_args(&request),
            vec![
                "ategen",
                "-input_file_type:STIL",
                "-workdir:/release",
                "-project_name:core_top",
                "-logfile:/logs/list.log",
                "-setup:/cfg/setup.py",
                "-licwait",
                "-timestamp",
                "/data/core_top_.stil.gz",
            ]
        );
    }

    #[test]
    fn test_command_line_remote_with_preamble() {
        let batch = BatchId::from("b");
        let plan = plan(Locality::Remote(Reservation {
            partition: "hw-h".to_string(),
            memory: "64G".to_string(),
            cpus: 2,
            job_name: "stilq".to_string(),
        }));
        let request = RunRequest {
            input: Path::new("/data/a.stil"),
            batch_id: &batch,
            log_path: Path::new("/logs/b.log"),
            plan: &plan,
        };

        let argv = runner("ategen", Some("module load tdl")).command_line(&request);
        assert_eq!(&argv[..7], &["srun", "-p", "hw-h", "--mem=64G", "--cpus-per-task=2", "-J", "stilq"]);
        assert_eq!(argv[7], "bash");
        assert_eq!(argv[9], "module load tdl && exec \"$0\" \"$@\"");
        assert_eq!(argv[10], "ategen");
        assert_eq!(argv.last().unwrap(), "/data/a.stil");
    }

    #[tokio::test]
    async fn test_run_success_writes_log() {
        let temp = TempDir::new().unwrap();
        let log_path = temp.path().join("logs").join("b.log");
        let batch = BatchId::from("b");
        let plan = plan(Locality::Local);
        let request = RunRequest {
            input: Path::new("/data/a.stil"),
            batch_id: &batch,
            log_path: &log_path,
            plan: &plan,
        };

        let outcome = runner("true", None).run(&request).await;
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.duration_secs >= 0.0);
        assert!(fs::read_to_string(&log_path).unwrap().contains("SUCCESS:"));
    }

    #[tokio::test]
    async fn test_run_nonzero_exit() {
        let temp = TempDir::new().unwrap();
        let log_path = temp.path().join("b.log");
        let batch = BatchId::from("b");
        let plan = plan(Locality::Local);
        let request = RunRequest {
            input: Path::new("/data/a.stil"),
            batch_id: &batch,
            log_path: &log_path,
            plan: &plan,
        };

        let outcome = runner("false", None).run(&request).await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_run_missing_binary() {
        let temp = TempDir::new().unwrap();
        let log_path = temp.path().join("b.log");
        let batch = BatchId::from("b");
        let plan = plan(Locality::Local);
        let request = RunRequest {
            input: Path::new("/data/a.stil"),
            batch_id: &batch,
            log_path: &log_path,
            plan: &plan,
        };

        let outcome = runner("/nonexistent/ategen", None).run(&request).await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, None);
        assert_eq!(outcome.duration_secs, 0.0);
        assert!(outcome.output.contains("/nonexistent/ategen"));
        assert!(fs::read_to_string(&log_path).unwrap().contains("FAILED:"));
    }
}
