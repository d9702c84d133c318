//! Change detection against a baseline view of a source tree

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::digest::ContentHash;
use crate::models::{BackupId, ChangeKind, FileManifestEntry};
use crate::scanner::{self, FileStat, ScanItem, ScanWarning, ScannedFile, Scanner};
use crate::Result;

/// What the baseline knows about one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineEntry {
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub hash: ContentHash,
}

impl From<&FileManifestEntry> for BaselineEntry {
    fn from(entry: &FileManifestEntry) -> Self {
        Self {
            size: entry.size,
            modified: entry.modified,
            hash: entry.hash.clone(),
        }
    }
}

/// Cumulative file view as of some backup, keyed by relative path
pub type Baseline = BTreeMap<PathBuf, BaselineEntry>;

/// A path that disappeared since the baseline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub path: PathBuf,
    pub last_known: BaselineEntry,
}

/// Partitioned result of comparing a scan with a baseline
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub added: Vec<ScannedFile>,
    pub modified: Vec<ScannedFile>,
    pub deleted: Vec<Deletion>,
    /// Paths judged unchanged, by metadata or by hash
    pub unchanged: Vec<PathBuf>,
    pub warnings: Vec<ScanWarning>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Files whose content must go into the archive, sorted by path
    pub fn files_to_archive(&self) -> Vec<&ScannedFile> {
        let mut files: Vec<&ScannedFile> = self.added.iter().chain(&self.modified).collect();
        files.sort_by(|a, b| a.stat.path.cmp(&b.stat.path));
        files
    }

    /// Drop files the archiver left out, keeping their warnings.
    ///
    /// A skipped file gets no manifest row, so restores keep whatever the
    /// chain held for it before and the next job looks at it again.
    pub fn leave_out(&mut self, skipped: &[ScanWarning]) {
        if skipped.is_empty() {
            return;
        }
        let skipped_paths: HashSet<&PathBuf> = skipped.iter().map(|w| &w.path).collect();
        self.added.retain(|f| !skipped_paths.contains(&f.stat.full_path));
        self.modified.retain(|f| !skipped_paths.contains(&f.stat.full_path));
        self.warnings.extend(skipped.iter().cloned());
    }

    /// Manifest rows for this change set, sorted by path
    pub fn manifest_entries(&self, backup_id: BackupId) -> Vec<FileManifestEntry> {
        let scanned = |file: &ScannedFile, change| FileManifestEntry {
            backup_id,
            path: file.stat.path.clone(),
            size: file.stat.size,
            modified: file.stat.modified,
            hash: file.hash.clone(),
            change,
        };

        let mut entries: Vec<FileManifestEntry> = self
            .added
            .iter()
            .map(|f| scanned(f, ChangeKind::Added))
            .chain(self.modified.iter().map(|f| scanned(f, ChangeKind::Modified)))
            .chain(self.deleted.iter().map(|d| FileManifestEntry {
                backup_id,
                path: d.path.clone(),
                size: d.last_known.size,
                modified: d.last_known.modified,
                hash: d.last_known.hash.clone(),
                change: ChangeKind::Deleted,
            }))
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }
}

/// Compares the current state of a source tree with a baseline
pub struct ChangeDetector<'a> {
    scanner: &'a Scanner,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(scanner: &'a Scanner) -> Self {
        Self { scanner }
    }

    /// Classify every file under the scanner root against `baseline`.
    ///
    /// A file whose size and mtime match the baseline is taken as unchanged
    /// without reading it. Everything else is hashed, and the hash decides
    /// whether it counts as modified. With an empty baseline every file is
    /// reported as added.
    pub fn detect(&self, baseline: &Baseline, cancel: &CancelToken) -> Result<ChangeSet> {
        let mut changes = ChangeSet::default();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut unreadable: HashSet<PathBuf> = HashSet::new();
        let mut to_hash: Vec<FileStat> = Vec::new();

        for item in self.scanner.walk() {
            cancel.check()?;
            match item {
                ScanItem::File(stat) => {
                    seen.insert(stat.path.clone());
                    match baseline.get(&stat.path) {
                        Some(known) if known.size == stat.size && known.modified == stat.modified => {
                            changes.unchanged.push(stat.path);
                        }
                        _ => to_hash.push(stat),
                    }
                }
                ScanItem::Warning(warning) => {
                    unreadable.insert(self.relative(&warning.path));
                    changes.warnings.push(warning);
                }
            }
        }

        debug!(
            "{} files unchanged by metadata, {} to hash",
            changes.unchanged.len(),
            to_hash.len()
        );

        let hashed = scanner::hash_all(to_hash, cancel)?;
        for warning in hashed.warnings {
            unreadable.insert(self.relative(&warning.path));
            seen.remove(&self.relative(&warning.path));
            changes.warnings.push(warning);
        }

        for file in hashed.files {
            match baseline.get(&file.stat.path) {
                None => changes.added.push(file),
                Some(known) if known.hash == file.hash => changes.unchanged.push(file.stat.path),
                Some(_) => changes.modified.push(file),
            }
        }

        for (path, known) in baseline {
            // Paths that could not be read, or that sit under an unreadable
            // directory, still exist. Only absent files become tombstones.
            let shadowed = unreadable.iter().any(|u| path.starts_with(u));
            if !seen.contains(path) && !shadowed {
                changes.deleted.push(Deletion {
                    path: path.clone(),
                    last_known: known.clone(),
                });
            }
        }

        changes.unchanged.sort();
        info!(
            "Changes: {} added, {} modified, {} deleted, {} unchanged",
            changes.added.len(),
            changes.modified.len(),
            changes.deleted.len(),
            changes.unchanged.len()
        );
        Ok(changes)
    }

    fn relative(&self, path: &Path) -> PathBuf {
        self.scanner.relative(path).to_path_buf()
    }
}
