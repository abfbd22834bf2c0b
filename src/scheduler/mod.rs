//! Task scheduling: queue state, batch selection, and the driver cycle.
//!
//! The queue is a CSV table on shared storage. Submitters append batches;
//! a single driver process, triggered externally, claims and runs at most
//! one task per cycle.
//!
//! # Architecture
//!
//! ```text
//!   stilq submit ──append──►┌───────────────┐
//!                           │  queue (CSV)  │◄── flock per transaction
//!   stilq drive ──txn──────►└───────────────┘
//!        │
//!        ├── ProcessLock          one driver at a time
//!        ├── AdmissionController  license capacity
//!        └── select_next          FIFO by batch
//! ```
//!
//! # Task lifecycle
//!
//! ```text
//! PENDING ──► RUNNING ──► COMPLETE | FAILED
//!    └──────► SKIPPED
//! ```

pub mod admission;
pub mod batch;
pub mod driver;
pub mod job;
pub mod lock;
pub mod queue;

pub use admission::{Admission, AdmissionController};
pub use batch::{select_next, BatchCounts, BatchId, BatchOverview};
pub use driver::{ClaimedTask, CycleOutcome, Driver, SkipReason};
pub use job::{ExecutionMode, TaskRecord, TaskStatus};
pub use lock::{LockAcquisition, LockHolder, ProcessLock};
pub use queue::{QueueStore, QueueTable, TaskKey};
