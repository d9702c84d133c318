//! Advisory locks
//!
//! At most one backup or retention job runs per application, across threads
//! and across processes sharing a storage root. A second request fails
//! immediately instead of waiting.
//!
//! Lock files live under `<root>/locks/`:
//!
//! ```text
//! store.lock            shared by writers, exclusive for the orphan sweep
//! catalog.lock          exclusive around catalog read-modify-write cycles
//! app-<hash>.lock       one per application
//! ```

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::digest::ContentHash;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Shared,
    Exclusive,
}

/// An OS advisory lock on a file; released when dropped or when the
/// process exits.
pub struct FileLock {
    #[cfg(unix)]
    _file: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileLock")
    }
}

impl FileLock {
    /// Block until a shared lock is held
    pub fn shared(path: &Path) -> Result<Self> {
        Self::acquire(path, Mode::Shared, true)?.ok_or_else(|| lock_busy(path))
    }

    /// Block until an exclusive lock is held
    pub fn exclusive(path: &Path) -> Result<Self> {
        Self::acquire(path, Mode::Exclusive, true)?.ok_or_else(|| lock_busy(path))
    }

    /// Take an exclusive lock, or `None` if anyone else holds the file
    pub fn try_exclusive(path: &Path) -> Result<Option<Self>> {
        Self::acquire(path, Mode::Exclusive, false)
    }

    #[cfg(unix)]
    fn acquire(path: &Path, mode: Mode, wait: bool) -> Result<Option<Self>> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let file = open_lock_file(path)?;
        let arg = match (mode, wait) {
            (Mode::Shared, true) => FlockArg::LockShared,
            (Mode::Shared, false) => FlockArg::LockSharedNonblock,
            (Mode::Exclusive, true) => FlockArg::LockExclusive,
            (Mode::Exclusive, false) => FlockArg::LockExclusiveNonblock,
        };
        match Flock::lock(file, arg) {
            Ok(flock) => Ok(Some(Self { _file: flock })),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(io::Error::from(errno).into()),
        }
    }

    // Only the in-process checks apply here.
    #[cfg(not(unix))]
    fn acquire(path: &Path, _mode: Mode, _wait: bool) -> Result<Option<Self>> {
        Ok(Some(Self {
            _file: open_lock_file(path)?,
        }))
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}

fn lock_busy(path: &Path) -> Error {
    io::Error::new(
        io::ErrorKind::WouldBlock,
        format!("lock {} is busy", path.display()),
    )
    .into()
}

/// Table of applications that currently have a job in flight
#[derive(Debug, Clone)]
pub struct AppLockTable {
    dir: PathBuf,
    held: Arc<Mutex<HashSet<String>>>,
}

impl AppLockTable {
    /// Lock table whose lock files live in `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: Arc::default(),
        }
    }

    /// Take the lock for `app` or fail with `BackupInProgress`
    pub fn try_acquire(&self, app: &str) -> Result<AppLockGuard> {
        if !self.table().insert(app.to_string()) {
            return Err(in_progress(app));
        }

        let file = match FileLock::try_exclusive(&self.lock_path(app)) {
            Ok(Some(file)) => file,
            Ok(None) => {
                self.table().remove(app);
                debug!("Application '{}' is locked by another process", app);
                return Err(in_progress(app));
            }
            Err(e) => {
                self.table().remove(app);
                return Err(e);
            }
        };
        debug!("Acquired lock for application '{}'", app);

        Ok(AppLockGuard {
            app: app.to_string(),
            held: Arc::clone(&self.held),
            _file: file,
        })
    }

    /// Whether this process holds the lock for `app`
    pub fn is_locked(&self, app: &str) -> bool {
        self.table().contains(app)
    }

    // Names are hashed so any application name maps to a safe file name.
    fn lock_path(&self, app: &str) -> PathBuf {
        self.dir
            .join(format!("app-{}.lock", ContentHash::from_bytes(app.as_bytes())))
    }

    fn table(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn in_progress(app: &str) -> Error {
    Error::BackupInProgress {
        app: app.to_string(),
    }
}

/// Releases the application lock on drop
#[derive(Debug)]
pub struct AppLockGuard {
    app: String,
    held: Arc<Mutex<HashSet<String>>>,
    _file: FileLock,
}

impl Drop for AppLockGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.app);
        debug!("Released lock for application '{}'", self.app);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let temp_dir = TempDir::new().unwrap();
        let locks = AppLockTable::new(temp_dir.path());
        let guard = locks.try_acquire("web").unwrap();

        assert!(matches!(
            locks.try_acquire("web"),
            Err(Error::BackupInProgress { ref app }) if app == "web"
        ));
        assert!(locks.try_acquire("db").is_ok());

        drop(guard);
        assert!(!locks.is_locked("web"));
        assert!(locks.try_acquire("web").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_separate_tables_on_one_directory_exclude_each_other() {
        let temp_dir = TempDir::new().unwrap();
        let first = AppLockTable::new(temp_dir.path());
        let second = AppLockTable::new(temp_dir.path());

        let guard = first.try_acquire("web").unwrap();
        assert!(matches!(
            second.try_acquire("web"),
            Err(Error::BackupInProgress { .. })
        ));
        // A refused attempt leaves nothing behind in the refusing table.
        assert!(!second.is_locked("web"));
        assert!(second.try_acquire("db").is_ok());

        drop(guard);
        assert!(second.try_acquire("web").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_exclusive_waits_for_shared_holders() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.lock");

        let reader = FileLock::shared(&path).unwrap();
        let other_reader = FileLock::shared(&path).unwrap();
        assert!(FileLock::try_exclusive(&path).unwrap().is_none());

        drop(reader);
        assert!(FileLock::try_exclusive(&path).unwrap().is_none());
        drop(other_reader);

        let writer = FileLock::try_exclusive(&path).unwrap();
        assert!(writer.is_some());
        assert!(FileLock::try_exclusive(&path).unwrap().is_none());
    }

    #[test]
    fn test_lock_files_are_created_under_the_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("locks");
        let locks = AppLockTable::new(&dir);

        let _guard = locks.try_acquire("name with / slashes").unwrap();
        let names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("app-") && names[0].ends_with(".lock"));
    }
}
