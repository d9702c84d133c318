//! Schedule command: run configured schedules in the foreground.

use clap::Args;
use std::sync::Arc;
use std::time::Duration;

use super::blocking;
use crate::engine::Engine;
use crate::scheduler::BackupScheduler;

/// Arguments for the schedule command
#[derive(Args)]
pub struct ScheduleArgs {
    /// Remove leftover sandboxes older than this many hours on startup
    #[arg(long, default_value = "24")]
    pub scratch_max_age_hours: u64,
}

/// Run the schedule command until Ctrl-C
pub async fn run(args: ScheduleArgs, engine: Arc<Engine>) -> anyhow::Result<()> {
    let max_age = scratch_max_age(args.scratch_max_age_hours);
    let removed = blocking(&engine, move |engine| engine.cleanup_stale_scratch(max_age)).await?;
    if removed > 0 {
        println!("Removed {} stale scratch directories", removed);
    }

    let scheduler = BackupScheduler::from_config(engine);
    if scheduler.schedules().is_empty() {
        anyhow::bail!("no schedules configured");
    }
    for schedule in scheduler.schedules() {
        println!(
            "  {} backup of '{}' every {} minutes{}",
            schedule.backup_type,
            schedule.app,
            schedule.interval_minutes,
            if schedule.apply_retention { " (with retention)" } else { "" }
        );
    }

    let handle = scheduler.spawn();
    println!("Scheduler running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    println!("Stopping scheduler...");
    handle.shutdown().await;
    Ok(())
}

/// Sandbox age limit for `hours`, clamped instead of overflowing
fn scratch_max_age(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}
