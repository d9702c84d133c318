//! Restore by replaying a backup chain
//!
//! Every chain member is fetched, opened and unpacked in order into a private
//! staging tree; tombstones remove paths as they are met. The destination is
//! only touched once the whole chain replayed cleanly.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, span, warn, Level};
use walkdir::WalkDir;

use crate::archive::{self, is_safe_relative};
use crate::cancel::CancelToken;
use crate::catalog::Catalog;
use crate::chain::ChainResolver;
use crate::crypto::CryptoSealer;
use crate::digest::ContentHash;
use crate::models::{BackupId, BackupRecord};
use crate::storage::BlobStore;
use crate::{Error, Result};

/// Outcome of a successful restore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    pub backup_id: BackupId,
    pub destination: PathBuf,
    /// Chain members replayed, oldest first
    pub chain: Vec<BackupId>,
    /// Files present in the restored tree
    pub files_written: usize,
    pub tombstones_applied: usize,
    pub bytes_written: u64,
    pub duration: std::time::Duration,
}

/// Counters gathered while replaying into a staging tree
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayStats {
    pub entries_unpacked: usize,
    pub tombstones_applied: usize,
}

/// Fetches, opens and replays chain members
pub struct ChainReplayer<'a> {
    catalog: &'a Catalog,
    store: &'a dyn BlobStore,
    sealer: Option<&'a CryptoSealer>,
}

impl<'a> ChainReplayer<'a> {
    pub fn new(
        catalog: &'a Catalog,
        store: &'a dyn BlobStore,
        sealer: Option<&'a CryptoSealer>,
    ) -> Self {
        Self {
            catalog,
            store,
            sealer,
        }
    }

    /// Plaintext archive of `record`, checked against its recorded hash.
    ///
    /// Failures are reported as `IntegrityError` for the backup being
    /// restored and as `ChainBroken` for any other link.
    pub fn load_archive(&self, record: &BackupRecord, target: &BackupId) -> Result<Vec<u8>> {
        let fail = |reason: String| {
            if record.id == *target {
                Error::IntegrityError {
                    backup_id: record.id,
                    reason,
                }
            } else {
                Error::ChainBroken {
                    link: record.id,
                    reason,
                }
            }
        };

        let stored = match self.store.fetch(&record.archive) {
            Ok(bytes) => bytes,
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::ChainBroken {
                    link: record.id,
                    reason: format!("archive {} is missing", record.archive),
                })
            }
            Err(e) => return Err(e),
        };

        let plaintext = if record.encrypted {
            let sealer = self
                .sealer
                .ok_or_else(|| fail("archive is encrypted but no master key is loaded".to_string()))?;
            match sealer.open(&record.id, &stored) {
                Ok(plaintext) => plaintext,
                Err(Error::IntegrityError { reason, .. }) => return Err(fail(reason)),
                Err(e) => return Err(e),
            }
        } else {
            stored
        };

        let actual = ContentHash::from_bytes(&plaintext);
        if actual != record.content_hash {
            return Err(fail(format!(
                "archive hash {} does not match recorded {}",
                actual, record.content_hash
            )));
        }
        Ok(plaintext)
    }

    /// Replay `chain` into `tree`, which must exist
    pub fn replay(
        &self,
        chain: &[BackupRecord],
        target: &BackupId,
        tree: &Path,
        cancel: &CancelToken,
    ) -> Result<ReplayStats> {
        let resolver = ChainResolver::new(self.catalog);
        let manifests = resolver.manifests(chain)?;
        let mut stats = ReplayStats::default();

        for (record, entries) in chain.iter().zip(&manifests) {
            cancel.check()?;
            let plaintext = self.load_archive(record, target)?;
            let unpacked = archive::unpack(&plaintext, tree, cancel)?;
            stats.entries_unpacked += unpacked.len();

            for entry in entries.iter().filter(|e| e.is_tombstone()) {
                if !is_safe_relative(&entry.path) {
                    return Err(Error::UnsafeArchivePath {
                        path: entry.path.clone(),
                    });
                }
                match fs::remove_file(tree.join(&entry.path)) {
                    Ok(()) => stats.tombstones_applied += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        debug!("Tombstone for absent path {}", entry.path.display())
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            debug!(
                "Replayed {} ({} entries unpacked)",
                record.id,
                unpacked.len()
            );
        }
        Ok(stats)
    }
}

/// Restores backups into user destinations
pub struct Restorer<'a> {
    catalog: &'a Catalog,
    replayer: ChainReplayer<'a>,
    scratch_dir: &'a Path,
    require_verified_chain: bool,
}

impl<'a> Restorer<'a> {
    pub fn new(
        catalog: &'a Catalog,
        replayer: ChainReplayer<'a>,
        scratch_dir: &'a Path,
        require_verified_chain: bool,
    ) -> Self {
        Self {
            catalog,
            replayer,
            scratch_dir,
            require_verified_chain,
        }
    }

    /// Restore `target` into `destination`, which must be absent or empty
    pub fn restore(
        &self,
        target: &BackupRecord,
        destination: &Path,
        cancel: &CancelToken,
    ) -> Result<RestoreReport> {
        let start_time = std::time::Instant::now();
        let span = span!(Level::INFO, "restore", backup_id = %target.id);
        let _enter = span.enter();

        let destination_existed = check_destination(destination)?;

        let chain = ChainResolver::new(self.catalog).resolve(target)?;
        if self.require_verified_chain {
            if let Some(unverified) = chain.iter().find(|record| !record.verified) {
                return Err(Error::ChainBroken {
                    link: unverified.id,
                    reason: "backup has not been verified".to_string(),
                });
            }
        }
        info!(
            "Restoring {} through a chain of {} to {}",
            target.id,
            chain.len(),
            destination.display()
        );

        fs::create_dir_all(self.scratch_dir)?;
        let staging = tempfile::Builder::new()
            .prefix("restore-")
            .tempdir_in(self.scratch_dir)?;
        let tree = staging.path().join("tree");
        fs::create_dir_all(&tree)?;

        let stats = self.replayer.replay(&chain, &target.id, &tree, cancel)?;
        let (files_written, bytes_written) = tree_totals(&tree)?;

        cancel.check()?;
        publish(&tree, destination, destination_existed)?;

        let report = RestoreReport {
            backup_id: target.id,
            destination: destination.to_path_buf(),
            chain: chain.iter().map(|record| record.id).collect(),
            files_written,
            tombstones_applied: stats.tombstones_applied,
            bytes_written,
            duration: start_time.elapsed(),
        };
        info!(
            "Restore completed: {} files ({} bytes), {} tombstones applied in {:?}",
            report.files_written, report.bytes_written, report.tombstones_applied, report.duration
        );
        Ok(report)
    }
}

/// Fails unless `destination` is absent or an empty directory; reports whether it exists
fn check_destination(destination: &Path) -> Result<bool> {
    match fs::read_dir(destination) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(Error::DestinationNotEmpty {
                    path: destination.to_path_buf(),
                });
            }
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(_) if destination.exists() => Err(Error::DestinationNotEmpty {
            path: destination.to_path_buf(),
        }),
        Err(e) => Err(e.into()),
    }
}

fn tree_totals(tree: &Path) -> Result<(usize, u64)> {
    let mut files = 0;
    let mut bytes = 0;
    for entry in WalkDir::new(tree) {
        let entry = entry?;
        if entry.file_type().is_file() {
            files += 1;
            bytes += entry.metadata()?.len();
        }
    }
    Ok((files, bytes))
}

/// Move the staged tree into place
fn publish(tree: &Path, destination: &Path, destination_existed: bool) -> Result<()> {
    if destination_existed {
        fs::remove_dir(destination)?;
    }
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }

    if fs::rename(tree, destination).is_ok() {
        return Ok(());
    }

    // Different filesystem: copy next to the destination, then rename.
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    let sibling = tempfile::Builder::new()
        .prefix(".chainvault-restore-")
        .tempdir_in(parent)?;
    let copied = sibling.path().join("tree");

    let result = copy_tree(tree, &copied).and_then(|()| Ok(fs::rename(&copied, destination)?));
    if let Err(e) = result {
        warn!("Publishing restore to {} failed: {}", destination.display(), e);
        if destination_existed && !destination.exists() {
            fs::create_dir_all(destination)?;
        }
        return Err(e);
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
