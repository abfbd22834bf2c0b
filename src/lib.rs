//! stilq: single-consumer job queue for license-limited pattern conversion.
//!
//! Users submit CSV tables of input files; each table becomes a batch of
//! tasks in a shared, file-locked queue. A driver, triggered externally,
//! runs at most one task per cycle and notifies the submitter when the
//! last task of a batch finishes.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod notify;
pub mod runner;
pub mod scheduler;
pub mod storage;
pub mod submit;

// Re-export commonly used error types
pub use config::{ConfigError, SchedulerConfig};
pub use error::{
    BackendError, DriverError, LockError, NotifyError, QueueError, RouteError, SubmitError,
    TableError,
};
