//! Application registry commands.

use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use super::blocking;
use crate::engine::Engine;
use crate::models::RetentionPolicy;

/// Arguments for the app command
#[derive(Args)]
pub struct AppArgs {
    #[command(subcommand)]
    pub command: AppCommand,
}

#[derive(Subcommand)]
pub enum AppCommand {
    /// Register a new application
    Add {
        name: String,
        /// Root directory to back up
        source: PathBuf,
        /// Delete backups older than this many days
        #[arg(long)]
        max_age_days: Option<u32>,
        /// Keep at most this many backups
        #[arg(long)]
        max_count: Option<usize>,
    },
    /// List registered applications
    List,
    /// Allow new backups of an application
    Enable { name: String },
    /// Reject new backups of an application
    Disable { name: String },
}

/// Run the app command
pub async fn run(args: AppArgs, engine: Arc<Engine>) -> anyhow::Result<()> {
    match args.command {
        AppCommand::Add {
            name,
            source,
            max_age_days,
            max_count,
        } => {
            if max_count == Some(0) {
                anyhow::bail!("--max-count must be at least 1");
            }
            let retention = (max_age_days.is_some() || max_count.is_some())
                .then(|| RetentionPolicy::new(max_age_days, max_count));
            let source = std::fs::canonicalize(&source).unwrap_or(source);

            let app = blocking(&engine, move |engine| {
                engine.register_application(&name, source, retention)
            })
            .await?;
            println!("Registered '{}' -> {}", app.name, app.source_root.display());
        }
        AppCommand::List => {
            let apps = blocking(&engine, |engine| engine.list_applications()).await?;
            if apps.is_empty() {
                println!("No applications registered");
            }
            for app in apps {
                println!(
                    "{:<20} {:<8} max_age={} max_count={}  {}",
                    app.name,
                    if app.active { "active" } else { "inactive" },
                    app.retention
                        .max_age_days
                        .map_or("-".to_string(), |d| format!("{}d", d)),
                    app.retention
                        .max_count
                        .map_or("-".to_string(), |c| c.to_string()),
                    app.source_root.display()
                );
            }
        }
        AppCommand::Enable { name } => {
            blocking(&engine, move |engine| engine.set_application_active(&name, true)).await?;
            println!("Application enabled");
        }
        AppCommand::Disable { name } => {
            blocking(&engine, move |engine| engine.set_application_active(&name, false)).await?;
            println!("Application disabled");
        }
    }
    Ok(())
}
