//! Backup and list commands.

use clap::Args;
use std::sync::Arc;

use super::{blocking, format_size};
use crate::engine::Engine;
use crate::models::BackupType;

/// Arguments for the backup command
#[derive(Args)]
pub struct BackupArgs {
    /// Application to back up
    pub app: String,

    /// Backup type: full, incremental or differential
    #[arg(short = 't', long = "type", default_value = "incremental")]
    pub backup_type: BackupType,
}

/// Arguments for the list command
#[derive(Args)]
pub struct ListArgs {
    /// Application whose backups to list
    pub app: String,

    /// Print records as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the backup command
pub async fn run(args: BackupArgs, engine: Arc<Engine>) -> anyhow::Result<()> {
    println!("Starting {} backup of '{}'", args.backup_type, args.app);

    let app = args.app.clone();
    let outcome = blocking(&engine, move |engine| engine.create_backup(&app, args.backup_type)).await?;
    let record = &outcome.record;

    println!("Backup completed successfully!");
    println!("  Backup ID: {}", record.id);
    println!("  Type: {}", record.backup_type);
    if let Some(parent) = record.parent_backup_id {
        println!("  Parent: {}", parent);
    }
    println!("  Manifest entries: {}", record.entry_count);
    println!("  Stored size: {}", format_size(record.size));
    println!("  Encrypted: {}", record.encrypted);

    if outcome.is_partial() {
        println!("  Skipped {} files:", outcome.warnings.len());
        for warning in &outcome.warnings {
            println!("    {}", warning);
        }
    }
    Ok(())
}

/// Run the list command
pub async fn list(args: ListArgs, engine: Arc<Engine>) -> anyhow::Result<()> {
    let app = args.app.clone();
    let backups = blocking(&engine, move |engine| engine.list_backups(&app)).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&backups)?);
        return Ok(());
    }

    if backups.is_empty() {
        println!("No backups for '{}'", args.app);
        return Ok(());
    }

    println!(
        "{:<36}  {:<12}  {:<20}  {:>10}  {:>7}  {}",
        "ID", "TYPE", "CREATED", "SIZE", "ENTRIES", "VERIFIED"
    );
    for record in &backups {
        println!(
            "{:<36}  {:<12}  {:<20}  {:>10}  {:>7}  {}",
            record.id,
            record.backup_type,
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            format_size(record.size),
            record.entry_count,
            if record.verified { "yes" } else { "no" }
        );
    }
    Ok(())
}
