//! Error types for chainvault

use crate::models::BackupId;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Application not found: {name}")]
    ApplicationNotFound { name: String },

    #[error("Application already registered: {name}")]
    ApplicationExists { name: String },

    #[error("Application is inactive: {name}")]
    ApplicationInactive { name: String },

    #[error("Backup not found: {id}")]
    BackupNotFound { id: BackupId },

    #[error("No verified backup available for application: {app}")]
    NoVerifiedBackup { app: String },

    #[error("Backup already in progress for application: {app}")]
    BackupInProgress { app: String },

    #[error("Source unreadable: {}: {reason}", path.display())]
    SourceUnreadable { path: PathBuf, reason: String },

    #[error("Archive write failed at {}: {reason}", path.display())]
    ArchiveWriteFailure { path: PathBuf, reason: String },

    #[error("Integrity verification failed for backup {backup_id}: {reason}")]
    IntegrityError { backup_id: BackupId, reason: String },

    #[error("Backup chain broken at {link}: {reason}")]
    ChainBroken { link: BackupId, reason: String },

    #[error("Backup {id} is still required by {} dependent backup(s)", dependents.len())]
    DependentsExist { id: BackupId, dependents: Vec<BackupId> },

    #[error("Restore destination is not empty: {}", path.display())]
    DestinationNotEmpty { path: PathBuf },

    #[error("Archive entry escapes destination: {}", path.display())]
    UnsafeArchivePath { path: PathBuf },

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Master key error at {}: {reason}", path.display())]
    KeyFile { path: PathBuf, reason: String },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;
