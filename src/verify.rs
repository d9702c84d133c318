//! Sandbox verification of stored backups
//!
//! A backup is verified by replaying its chain into a throwaway sandbox,
//! re-hashing every reconstructed file against the cumulative manifest and
//! checking that the configured key files are present. The sandbox is removed
//! whatever the outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, span, warn, Level};

use crate::cancel::CancelToken;
use crate::catalog::Catalog;
use crate::chain::{ChainResolver, FileView};
use crate::config::ScanConfig;
use crate::models::{BackupId, BackupRecord};
use crate::restore::ChainReplayer;
use crate::scanner::Scanner;
use crate::{Error, Result};

const SCRATCH_PREFIXES: [&str; 2] = ["restore-", "verify-"];

/// Detailed outcome of one verification run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub backup_id: BackupId,
    pub verified: bool,
    /// Every archive in the chain opened and matched its recorded hash
    pub archive_hash_ok: bool,
    pub files_checked: usize,
    pub corrupt_files: Vec<PathBuf>,
    pub missing_files: Vec<PathBuf>,
    pub unexpected_files: Vec<PathBuf>,
    pub missing_key_files: Vec<PathBuf>,
    pub errors: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl VerificationReport {
    fn new(backup_id: BackupId) -> Self {
        Self {
            backup_id,
            verified: false,
            archive_hash_ok: false,
            files_checked: 0,
            corrupt_files: Vec::new(),
            missing_files: Vec::new(),
            unexpected_files: Vec::new(),
            missing_key_files: Vec::new(),
            errors: Vec::new(),
            checked_at: Utc::now(),
        }
    }

    fn passed(&self) -> bool {
        self.archive_hash_ok
            && self.corrupt_files.is_empty()
            && self.missing_files.is_empty()
            && self.unexpected_files.is_empty()
            && self.missing_key_files.is_empty()
            && self.errors.is_empty()
    }
}

/// Verifies backups in isolated scratch sandboxes
pub struct IntegrityVerifier<'a> {
    catalog: &'a Catalog,
    replayer: ChainReplayer<'a>,
    scratch_dir: &'a Path,
    key_files: &'a [PathBuf],
}

impl<'a> IntegrityVerifier<'a> {
    pub fn new(
        catalog: &'a Catalog,
        replayer: ChainReplayer<'a>,
        scratch_dir: &'a Path,
        key_files: &'a [PathBuf],
    ) -> Self {
        Self {
            catalog,
            replayer,
            scratch_dir,
            key_files,
        }
    }

    /// Verify `target`, marking it verified in the catalog only on a clean pass.
    ///
    /// Integrity problems are collected in the report. Only cancellation and
    /// failures to set up the sandbox are returned as errors.
    pub fn verify(&self, target: &BackupRecord, cancel: &CancelToken) -> Result<VerificationReport> {
        let span = span!(Level::INFO, "verify", backup_id = %target.id);
        let _enter = span.enter();

        fs::create_dir_all(self.scratch_dir)?;
        let sandbox = tempfile::Builder::new()
            .prefix("verify-")
            .tempdir_in(self.scratch_dir)?;
        let tree = sandbox.path().join("tree");
        fs::create_dir_all(&tree)?;

        let mut report = VerificationReport::new(target.id);
        match self.check(target, &tree, cancel, &mut report) {
            Ok(()) => {}
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => report.errors.push(e.to_string()),
        }

        if let Err(e) = sandbox.close() {
            warn!("Failed to remove verification sandbox: {}", e);
        }

        report.verified = report.passed();
        if report.verified {
            self.catalog.mark_verified(&target.id)?;
            info!("Backup {} verified ({} files)", target.id, report.files_checked);
        } else {
            warn!(
                "Backup {} failed verification: {} corrupt, {} missing, {} unexpected, {} key files missing, {} errors",
                target.id,
                report.corrupt_files.len(),
                report.missing_files.len(),
                report.unexpected_files.len(),
                report.missing_key_files.len(),
                report.errors.len()
            );
        }
        Ok(report)
    }

    /// Compare a tree restored from `target` against its manifest view.
    ///
    /// The archives were already checked by the restore, so only the files
    /// are compared. The catalog is left untouched.
    pub fn check_restored_tree(
        &self,
        target: &BackupRecord,
        tree: &Path,
        cancel: &CancelToken,
    ) -> Result<VerificationReport> {
        let mut report = VerificationReport::new(target.id);
        report.archive_hash_ok = true;
        let expected = ChainResolver::new(self.catalog).file_view(target)?;
        self.compare_tree(&expected, tree, cancel, &mut report)?;

        report.verified = report.passed();
        if report.verified {
            info!(
                "Restored tree of {} matches its manifest ({} files)",
                target.id, report.files_checked
            );
        } else {
            warn!(
                "Restored tree of {} differs: {} corrupt, {} missing, {} unexpected",
                target.id,
                report.corrupt_files.len(),
                report.missing_files.len(),
                report.unexpected_files.len()
            );
        }
        Ok(report)
    }

    fn check(
        &self,
        target: &BackupRecord,
        tree: &Path,
        cancel: &CancelToken,
        report: &mut VerificationReport,
    ) -> Result<()> {
        let resolver = ChainResolver::new(self.catalog);
        let chain = resolver.resolve(target)?;
        let expected = resolver.file_view(target)?;

        self.replayer.replay(&chain, &target.id, tree, cancel)?;
        report.archive_hash_ok = true;

        self.compare_tree(&expected, tree, cancel, report)?;
        debug!(
            "Checked {} files against manifest of {}",
            report.files_checked, target.id
        );
        Ok(())
    }

    fn compare_tree(
        &self,
        expected: &FileView,
        tree: &Path,
        cancel: &CancelToken,
        report: &mut VerificationReport,
    ) -> Result<()> {
        let sandbox_scan = ScanConfig {
            exclude: Vec::new(),
            follow_symlinks: false,
        };
        let outcome = Scanner::new(tree, &sandbox_scan)?.scan_parallel(cancel)?;
        for warning in outcome.warnings {
            report.errors.push(warning.to_string());
        }

        let mut actual: BTreeMap<PathBuf, _> = outcome
            .files
            .into_iter()
            .map(|file| (file.stat.path.clone(), file))
            .collect();

        for (path, entry) in expected {
            match actual.remove(path) {
                Some(file) if file.hash == entry.hash && file.stat.size == entry.size => {
                    report.files_checked += 1;
                }
                Some(_) => {
                    report.files_checked += 1;
                    report.corrupt_files.push(path.clone());
                }
                None => report.missing_files.push(path.clone()),
            }
        }
        report.unexpected_files.extend(actual.into_keys());

        for key_file in self.key_files {
            if !expected.contains_key(key_file) || !tree.join(key_file).is_file() {
                report.missing_key_files.push(key_file.clone());
            }
        }
        Ok(())
    }
}

/// Remove restore and verification sandboxes older than `max_age`
pub fn cleanup_stale_scratch(scratch_dir: &Path, max_age: Duration) -> Result<usize> {
    let entries = match fs::read_dir(scratch_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !SCRATCH_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
            continue;
        }

        let modified = entry.metadata()?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age >= max_age {
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    debug!("Removed stale scratch directory {}", entry.path().display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
            }
        }
    }

    if removed > 0 {
        info!("Cleaned up {} stale scratch directories", removed);
    }
    Ok(removed)
}
