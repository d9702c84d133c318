//! Catalog data model: applications, backup records and manifest entries

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::digest::ContentHash;
use crate::storage::ArchiveLocation;
use crate::Error;

/// Unique identifier of a backup record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupId(pub Uuid);

impl BackupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BackupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BackupId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(BackupId)
            .map_err(|e| Error::Configuration {
                reason: format!("invalid backup id '{}': {}", s, e),
            })
    }
}

/// Kind of backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
    Differential,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => write!(f, "full"),
            BackupType::Incremental => write!(f, "incremental"),
            BackupType::Differential => write!(f, "differential"),
        }
    }
}

impl FromStr for BackupType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(BackupType::Full),
            "incremental" | "inc" => Ok(BackupType::Incremental),
            "differential" | "diff" => Ok(BackupType::Differential),
            other => Err(Error::Configuration {
                reason: format!("unknown backup type '{}'", other),
            }),
        }
    }
}

/// Age and count limits applied by the retention planner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Backups older than this many days become candidates
    pub max_age_days: Option<u32>,
    /// Only the newest `max_count` backups are kept by count
    pub max_count: Option<usize>,
}

impl RetentionPolicy {
    pub fn new(max_age_days: Option<u32>, max_count: Option<usize>) -> Self {
        Self {
            max_age_days,
            max_count,
        }
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_days.map(|days| Duration::days(i64::from(days)))
    }
}

/// A registered backup source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    /// Unique application name
    pub name: String,
    /// Root of the tree that gets backed up
    pub source_root: PathBuf,
    /// Inactive applications reject new backups
    pub active: bool,
    /// Per-application retention limits
    #[serde(default)]
    pub retention: RetentionPolicy,
    pub created_at: DateTime<Utc>,
}

impl Application {
    pub fn new(name: impl Into<String>, source_root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source_root: source_root.into(),
            active: true,
            retention: RetentionPolicy::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

/// Committed backup of one application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: BackupId,
    pub app_name: String,
    pub backup_type: BackupType,
    /// Required unless `backup_type` is full
    pub parent_backup_id: Option<BackupId>,
    pub created_at: DateTime<Utc>,
    /// Catalog-wide commit order; breaks `created_at` ties
    pub sequence: u64,
    pub archive: ArchiveLocation,
    /// Hash of the plaintext archive
    pub content_hash: ContentHash,
    pub encrypted: bool,
    pub verified: bool,
    /// Stored archive size in bytes
    pub size: u64,
    /// Number of manifest entries
    pub entry_count: usize,
}

impl BackupRecord {
    pub fn is_full(&self) -> bool {
        self.backup_type == BackupType::Full
    }

    /// Ordering key: creation time, then commit sequence
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.sequence)
    }
}

/// Change recorded for one path in a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// One manifest row of a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifestEntry {
    pub backup_id: BackupId,
    /// Path relative to the application's source root
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub hash: ContentHash,
    pub change: ChangeKind,
}

impl FileManifestEntry {
    pub fn is_tombstone(&self) -> bool {
        self.change == ChangeKind::Deleted
    }
}
