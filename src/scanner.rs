//! Source tree scanning
//!
//! `Scanner::walk` yields file metadata lazily; hashes are computed on demand
//! so callers can skip hashing files whose metadata did not change. A file that
//! cannot be read becomes a warning item, never an error that ends the scan.

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, span, warn, Level};
use walkdir::{DirEntry, WalkDir};

use crate::cancel::CancelToken;
use crate::config::ScanConfig;
use crate::digest::{hash_file, ContentHash};
use crate::{Error, Result};

/// A file that could not be read during a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub reason: String,
}

impl ScanWarning {
    pub fn new(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

impl From<ScanWarning> for Error {
    fn from(warning: ScanWarning) -> Self {
        Error::SourceUnreadable {
            path: warning.path,
            reason: warning.reason,
        }
    }
}

/// Metadata of one regular file under the source root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Path relative to the source root
    pub path: PathBuf,
    pub full_path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl FileStat {
    /// Stream the file through the hasher
    pub fn hash(&self) -> std::result::Result<ContentHash, ScanWarning> {
        hash_file(&self.full_path).map_err(|e| ScanWarning::new(&self.full_path, e))
    }
}

/// A file with its content hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub stat: FileStat,
    pub hash: ContentHash,
}

/// Item produced while walking a tree
#[derive(Debug, Clone)]
pub enum ScanItem<T> {
    File(T),
    Warning(ScanWarning),
}

/// Files and warnings gathered by a completed scan
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Sorted by relative path
    pub files: Vec<ScannedFile>,
    pub warnings: Vec<ScanWarning>,
}

/// Walks a source root honoring exclusion patterns
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    excludes: GlobSet,
    follow_symlinks: bool,
}

impl Scanner {
    pub fn new<P: AsRef<Path>>(root: P, config: &ScanConfig) -> Result<Self> {
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            excludes: build_globset(&config.exclude)?,
            follow_symlinks: config.follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check a relative path against the exclusion patterns
    pub fn is_excluded(&self, relative: &Path) -> bool {
        !relative.as_os_str().is_empty() && self.excludes.is_match(relative)
    }

    /// Lazily walk the tree. Each call starts a fresh traversal.
    pub fn walk(&self) -> Walk<'_> {
        let inner = WalkDir::new(&self.root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| !self.is_excluded(self.relative(entry.path())));

        Walk {
            scanner: self,
            inner: Box::new(inner),
        }
    }

    /// Lazily walk and hash every file, one at a time
    pub fn scan(&self) -> impl Iterator<Item = ScanItem<ScannedFile>> + '_ {
        self.walk().map(|item| match item {
            ScanItem::File(stat) => match stat.hash() {
                Ok(hash) => ScanItem::File(ScannedFile { stat, hash }),
                Err(warning) => ScanItem::Warning(warning),
            },
            ScanItem::Warning(warning) => ScanItem::Warning(warning),
        })
    }

    /// Walk the tree, then hash all files in parallel
    pub fn scan_parallel(&self, cancel: &CancelToken) -> Result<ScanOutcome> {
        let span = span!(Level::INFO, "scan", root = %self.root.display());
        let _enter = span.enter();

        let mut stats = Vec::new();
        let mut warnings = Vec::new();
        for item in self.walk() {
            cancel.check()?;
            match item {
                ScanItem::File(stat) => stats.push(stat),
                ScanItem::Warning(warning) => warnings.push(warning),
            }
        }

        let mut outcome = hash_all(stats, cancel)?;
        outcome.warnings.splice(0..0, warnings);

        info!(
            "Scanned {} files ({} warnings)",
            outcome.files.len(),
            outcome.warnings.len()
        );
        Ok(outcome)
    }

    pub(crate) fn relative<'p>(&self, path: &'p Path) -> &'p Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    fn stat_entry(&self, entry: &DirEntry) -> std::result::Result<FileStat, ScanWarning> {
        let metadata = entry
            .metadata()
            .map_err(|e| ScanWarning::new(entry.path(), e))?;
        let modified = metadata
            .modified()
            .map_err(|e| ScanWarning::new(entry.path(), e))?;

        Ok(FileStat {
            path: self.relative(entry.path()).to_path_buf(),
            full_path: entry.path().to_path_buf(),
            size: metadata.len(),
            modified: DateTime::<Utc>::from(modified),
        })
    }
}

/// Lazy traversal returned by [`Scanner::walk`]
pub struct Walk<'a> {
    scanner: &'a Scanner,
    inner: Box<dyn Iterator<Item = walkdir::Result<DirEntry>> + 'a>,
}

impl Iterator for Walk<'_> {
    type Item = ScanItem<FileStat>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.scanner.root.clone());
                    warn!("Skipping entry due to error: {}", e);
                    return Some(ScanItem::Warning(ScanWarning::new(path, e)));
                }
            };

            if entry.path_is_symlink() && !entry.file_type().is_file() {
                let warning = ScanWarning::new(entry.path(), "symbolic link not followed");
                debug!("Skipping {}", warning);
                return Some(ScanItem::Warning(warning));
            }
            if !entry.file_type().is_file() {
                continue;
            }

            return Some(match self.scanner.stat_entry(&entry) {
                Ok(stat) => ScanItem::File(stat),
                Err(warning) => ScanItem::Warning(warning),
            });
        }
    }
}

/// Hash a batch of files on the rayon pool. Output is sorted by path.
pub(crate) fn hash_all(stats: Vec<FileStat>, cancel: &CancelToken) -> Result<ScanOutcome> {
    let hashed: Vec<std::result::Result<ScannedFile, ScanWarning>> = stats
        .into_par_iter()
        .map(|stat| {
            if cancel.is_cancelled() {
                return Err(ScanWarning::new(&stat.full_path, "cancelled"));
            }
            stat.hash().map(|hash| ScannedFile { stat, hash })
        })
        .collect();
    cancel.check()?;

    let mut outcome = ScanOutcome::default();
    for result in hashed {
        match result {
            Ok(file) => outcome.files.push(file),
            Err(warning) => {
                warn!("Skipping unreadable file {}", warning);
                outcome.warnings.push(warning);
            }
        }
    }
    outcome.files.sort_by(|a, b| a.stat.path.cmp(&b.stat.path));
    Ok(outcome)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| Error::Configuration {
            reason: format!("invalid exclude pattern '{}': {}", pattern, e),
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|e| Error::Configuration {
        reason: format!("invalid exclude patterns: {}", e),
    })?;
    debug!("Compiled {} exclude patterns", patterns.len());
    Ok(set)
}
