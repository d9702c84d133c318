//! Command-line interface for chainvault.
//!
//! Thin clap front-end over [`Engine`]: every subcommand opens the engine from
//! the configuration file and calls one engine operation on the blocking pool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::engine::Engine;

pub mod app;
pub mod backup;
pub mod restore;
pub mod retention;
pub mod schedule;
pub mod verify;

/// chainvault - incremental backups with sealed archives and safe retention
#[derive(Parser)]
#[command(name = "chainvault")]
#[command(about = "File-level backup engine with incremental/differential chains and dependency-aware retention")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (defaults to the per-user config location)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Manage registered applications
    App(app::AppArgs),
    /// Create a backup of an application
    Backup(backup::BackupArgs),
    /// List backups of an application, newest first
    List(backup::ListArgs),
    /// Restore a backup into an empty destination
    Restore(restore::RestoreArgs),
    /// Restore the newest verified backup of an application and check it
    Recover(restore::RecoverArgs),
    /// Verify a backup in a scratch sandbox
    Verify(verify::VerifyArgs),
    /// Apply or inspect retention
    Retention(retention::RetentionArgs),
    /// Run configured schedules until interrupted
    Schedule(schedule::ScheduleArgs),
}

impl Cli {
    /// Load the configuration this invocation points at
    pub fn load_config(&self) -> crate::Result<Config> {
        match &self.config {
            Some(path) => Config::load(path),
            None => Config::load_or_default(),
        }
    }
}

/// Run an engine call on the blocking pool
pub(crate) async fn blocking<T, F>(engine: &Arc<Engine>, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&Engine) -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let engine = Arc::clone(engine);
    Ok(tokio::task::spawn_blocking(move || f(&engine)).await??)
}

/// Dispatch a parsed command
pub async fn run(command: Commands, engine: Arc<Engine>) -> anyhow::Result<()> {
    match command {
        Commands::App(args) => app::run(args, engine).await,
        Commands::Backup(args) => backup::run(args, engine).await,
        Commands::List(args) => backup::list(args, engine).await,
        Commands::Restore(args) => restore::run(args, engine).await,
        Commands::Recover(args) => restore::recover(args, engine).await,
        Commands::Verify(args) => verify::run(args, engine).await,
        Commands::Retention(args) => retention::run(args, engine).await,
        Commands::Schedule(args) => schedule::run(args, engine).await,
    }
}

/// Human-readable byte count
pub(crate) fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
