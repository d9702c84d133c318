//! chainvault - incremental backup engine
//!
//! Main binary entry point for the command-line interface.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::debug;

use chainvault::cli::{self, Cli};
use chainvault::logging;
use chainvault::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.log_file {
        Some(path) => logging::init_file_logging(path, cli.verbose)?,
        None => logging::init_logging(cli.verbose)?,
    }

    let config = cli.load_config().context("failed to load configuration")?;
    debug!("Storage root: {}", config.storage.root.display());

    let engine = tokio::task::spawn_blocking(move || Engine::open(config))
        .await?
        .context("failed to open backup engine")?;

    cli::run(cli.command, Arc::new(engine)).await
}
