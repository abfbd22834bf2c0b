//! Command-line interface for stilq.
//!
//! Provides commands for submitting batches, running driver cycles, and
//! inspecting the queue.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
