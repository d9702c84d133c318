//! # chainvault
//!
//! File-level backup engine for registered applications.
//!
//! ## Features
//!
//! - **Backup chains**: full, incremental and differential backups linked by parent id
//! - **Sealed archives**: deterministic tar.gz archives, optionally encrypted with ChaCha20-Poly1305
//! - **Restore**: chain replay into a staging directory, published atomically
//! - **Verification**: sandboxed restore compared against the manifest with BLAKE3
//! - **Recovery**: restore of the newest verified backup, checked against its manifest
//! - **Retention**: age and count limits that never break a surviving chain
//! - **Scheduling**: periodic backups on a tokio runtime
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chainvault::{BackupType, Config, Engine};
//!
//! # fn main() -> chainvault::Result<()> {
//! let engine = Engine::open(Config::with_root("./vault"))?;
//! engine.register_application("website", "./www", None)?;
//!
//! let outcome = engine.create_backup("website", BackupType::Full)?;
//! println!("Backup completed: {}", outcome.record.id);
//!
//! engine.restore_backup(&outcome.record.id, "./restored".as_ref())?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cancel;
pub mod catalog;
pub mod chain;
pub mod change;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod digest;
pub mod engine;
pub mod error;
pub mod lock;
pub mod logging;
pub mod models;
pub mod restore;
pub mod retention;
pub mod scanner;
pub mod scheduler;
pub mod storage;
pub mod verify;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use config::Config;
pub use engine::{BackupOutcome, Engine, RecoveryReport};
pub use error::{Error, Result};
pub use models::{Application, BackupId, BackupRecord, BackupType, ChangeKind, FileManifestEntry, RetentionPolicy};
pub use restore::RestoreReport;
pub use retention::{RetentionPlan, RetentionStatus};
pub use verify::VerificationReport;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
