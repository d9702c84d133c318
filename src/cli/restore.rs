//! Restore and recover command implementations.

use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

use super::{blocking, format_size};
use crate::engine::Engine;
use crate::models::BackupId;

/// Arguments for the restore command
#[derive(Args)]
pub struct RestoreArgs {
    /// Backup to restore
    pub backup_id: BackupId,

    /// Destination directory; must be absent or empty
    pub destination: PathBuf,
}

/// Arguments for the recover command
#[derive(Args)]
pub struct RecoverArgs {
    /// Application to recover
    pub app: String,

    /// Destination directory; must be absent or empty
    pub destination: PathBuf,
}

/// Run the restore command
pub async fn run(args: RestoreArgs, engine: Arc<Engine>) -> anyhow::Result<()> {
    println!(
        "Restoring {} -> {}",
        args.backup_id,
        args.destination.display()
    );

    let id = args.backup_id;
    let destination = args.destination.clone();
    let report = blocking(&engine, move |engine| engine.restore_backup(&id, &destination)).await?;

    println!("Restore completed successfully!");
    println!("  Chain: {} backups", report.chain.len());
    println!("  Files written: {}", report.files_written);
    println!("  Tombstones applied: {}", report.tombstones_applied);
    println!("  Bytes written: {}", format_size(report.bytes_written));
    println!("  Duration: {:?}", report.duration);
    Ok(())
}

/// Run the recover command: newest verified backup, restored and checked
pub async fn recover(args: RecoverArgs, engine: Arc<Engine>) -> anyhow::Result<()> {
    println!(
        "Recovering '{}' -> {}",
        args.app,
        args.destination.display()
    );

    let app = args.app.clone();
    let destination = args.destination.clone();
    let report = blocking(&engine, move |engine| {
        engine.recover_latest_verified(&app, &destination)
    })
    .await?;

    println!(
        "  Backup: {} ({}, {})",
        report.backup.id,
        report.backup.backup_type,
        report.backup.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!("  Chain: {} backups", report.restore.chain.len());
    println!("  Files written: {}", report.restore.files_written);
    println!("  Files checked: {}", report.verification.files_checked);

    if !report.succeeded() {
        for path in &report.verification.corrupt_files {
            println!("  Corrupt: {}", path.display());
        }
        for path in &report.verification.missing_files {
            println!("  Missing: {}", path.display());
        }
        for path in &report.verification.unexpected_files {
            println!("  Unexpected: {}", path.display());
        }
        for path in &report.verification.missing_key_files {
            println!("  Missing key file: {}", path.display());
        }
        for error in &report.verification.errors {
            println!("  Error: {}", error);
        }
        anyhow::bail!(
            "recovered tree in {} does not match backup {}",
            args.destination.display(),
            report.backup.id
        );
    }
    println!("Recovery completed successfully!");
    Ok(())
}
