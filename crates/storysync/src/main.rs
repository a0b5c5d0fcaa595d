//! storysync admin binary.

use anyhow::Result;
use storysync::cli::Cli;
use tracing_subscriber::EnvFilter;

/// Main entry point for the storysync CLI.
///
/// Uses tokio's current_thread runtime: every command is a short sequence of
/// local file operations.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Controlled via RUST_LOG, e.g. RUST_LOG=storysync=debug,storysync_jsonl=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("storysync=info,storysync_jsonl=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Starting storysync CLI");

    let cli = Cli::parse_args();
    cli.execute().await?;

    tracing::debug!("storysync CLI completed successfully");
    Ok(())
}
