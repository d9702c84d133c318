//! Verify command implementation.

use clap::Args;
use std::sync::Arc;

use super::blocking;
use crate::engine::Engine;
use crate::models::BackupId;

/// Arguments for the verify command
#[derive(Args)]
pub struct VerifyArgs {
    /// Backup to verify
    pub backup_id: BackupId,

    /// Print the full report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the verify command
pub async fn run(args: VerifyArgs, engine: Arc<Engine>) -> anyhow::Result<()> {
    let id = args.backup_id;
    let report = blocking(&engine, move |engine| engine.verify_backup_report(&id)).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Backup {}: {}",
            report.backup_id,
            if report.verified { "VERIFIED" } else { "FAILED" }
        );
        println!("  Archive hashes: {}", if report.archive_hash_ok { "ok" } else { "mismatch" });
        println!("  Files checked: {}", report.files_checked);
        for path in &report.corrupt_files {
            println!("  corrupt: {}", path.display());
        }
        for path in &report.missing_files {
            println!("  missing: {}", path.display());
        }
        for path in &report.unexpected_files {
            println!("  unexpected: {}", path.display());
        }
        for path in &report.missing_key_files {
            println!("  missing key file: {}", path.display());
        }
        for error in &report.errors {
            println!("  error: {}", error);
        }
    }

    if !report.verified {
        anyhow::bail!("verification of {} failed", report.backup_id);
    }
    Ok(())
}
