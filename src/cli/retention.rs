//! Retention commands.

use clap::{Args, Subcommand};
use std::sync::Arc;

use super::{blocking, format_size};
use crate::engine::Engine;

/// Arguments for the retention command
#[derive(Args)]
pub struct RetentionArgs {
    #[command(subcommand)]
    pub command: RetentionCommand,
}

#[derive(Subcommand)]
pub enum RetentionCommand {
    /// Delete expired backups that nothing depends on
    Apply {
        app: String,
        /// Show the plan without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Show how an application stands against its policy
    Status { app: String },
}

/// Run the retention command
pub async fn run(args: RetentionArgs, engine: Arc<Engine>) -> anyhow::Result<()> {
    match args.command {
        RetentionCommand::Apply { app, dry_run: true } => {
            let plan = blocking(&engine, move |engine| engine.plan_retention(&app)).await?;
            println!("Would delete {} backups:", plan.evict.len());
            for eviction in &plan.evict {
                println!("  {} ({})", eviction.id, eviction.reason);
            }
            for deferral in &plan.deferred {
                println!(
                    "  kept {} ({}): needed by {}",
                    deferral.id, deferral.reason, deferral.needed_by
                );
            }
        }
        RetentionCommand::Apply { app, dry_run: false } => {
            let deleted = blocking(&engine, move |engine| engine.apply_retention(&app)).await?;
            println!("Deleted {} backups", deleted.len());
            for id in deleted {
                println!("  {}", id);
            }
        }
        RetentionCommand::Status { app } => {
            let status = blocking(&engine, move |engine| engine.retention_status(&app)).await?;
            println!("Retention status for '{}'", status.app_name);
            println!(
                "  Policy: max_age_days={:?} max_count={:?}",
                status.policy.max_age_days, status.policy.max_count
            );
            println!("  Total backups: {}", status.total_backups);
            println!("  Older than max age: {}", status.exceeding_age);
            println!("  Beyond max count: {}", status.exceeding_count);
            println!("  Protected by dependents: {}", status.protected.len());
            println!("  Deletable now: {}", status.evictable.len());
            println!("  Stored size: {}", format_size(status.total_size));
        }
    }
    Ok(())
}
