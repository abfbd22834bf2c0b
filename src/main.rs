//! stilq CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments first to get log_level
    let cli = stilq::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level / -v > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_filter());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    stilq::cli::run_with_cli(cli).await
}
