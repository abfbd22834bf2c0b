//! Job execution for queued tasks.
//!
//! This module turns a selected task into one run of the external
//! pattern-generation tool and records what happened.
//!
//! # Architecture
//!
//! ```text
//! TaskRecord → ExecutionRouter → ExecutionPlan → JobRunner → RunOutcome → ExecutionLog
//!                                                    │
//!                                          (remote) ClusterBackend launcher
//! ```
//!
//! The runner:
//! 1. Resolves the setup profile from the task's mode
//! 2. Chooses local or cluster execution from the input size
//! 3. Runs the tool, capturing merged output and wall-clock time
//! 4. Appends the outcome to the per-task log and the execution log

pub mod backend;
pub mod executor;
pub mod log;
pub mod result;
pub mod router;

pub use backend::{ClusterBackend, Reservation, SlurmBackend};
pub use executor::{JobRunner, RunRequest, ToolSettings};
pub use log::{ExecutionLog, ExecutionRecord};
pub use result::RunOutcome;
pub use router::{ExecutionPlan, ExecutionRouter, Locality};
