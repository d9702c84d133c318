//! Persistent catalog of applications, backup records and manifests
//!
//! Layout under the catalog directory:
//!
//! ```text
//! applications.json          registered applications
//! backups/<id>.json          one record per committed backup
//! manifests/<id>.json        manifest entries of that backup
//! ```
//!
//! A backup commits by writing its manifest and then its record, each through
//! a temporary file and a rename. The record is the commit marker: a manifest
//! without a record is debris from an interrupted job, removed by
//! [`Catalog::remove_orphan_manifests`] once no writer is active.
//!
//! Writers serialize on an in-process mutex and on `locks/catalog.lock`, so
//! sequence numbers stay unique across processes sharing the root.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::lock::FileLock;
use crate::models::{Application, BackupId, BackupRecord, FileManifestEntry};
use crate::storage::write_atomic;
use crate::{Error, Result};

/// Manifest document format version
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ManifestDocument {
    version: u32,
    backup_id: BackupId,
    entries: Vec<FileManifestEntry>,
}

/// JSON-file catalog with atomic commits
#[derive(Debug)]
pub struct Catalog {
    applications_path: PathBuf,
    backups_path: PathBuf,
    manifests_path: PathBuf,
    tmp_path: PathBuf,
    lock_path: PathBuf,
    /// Serializes read-modify-write cycles and sequence allocation
    write_lock: Mutex<()>,
}

/// Held for the duration of one catalog mutation
struct WriteGuard<'a> {
    _file: FileLock,
    _thread: MutexGuard<'a, ()>,
}

impl Catalog {
    /// Open (or create) the catalog under `root_path`
    pub fn open<P: AsRef<Path>>(root_path: P) -> Result<Self> {
        let root_path = root_path.as_ref();
        let catalog_path = root_path.join("catalog");
        let backups_path = catalog_path.join("backups");
        let manifests_path = catalog_path.join("manifests");
        let tmp_path = root_path.join("tmp");

        fs::create_dir_all(&backups_path)?;
        fs::create_dir_all(&manifests_path)?;
        fs::create_dir_all(&tmp_path)?;

        Ok(Self {
            applications_path: catalog_path.join("applications.json"),
            backups_path,
            manifests_path,
            tmp_path,
            lock_path: root_path.join("locks").join("catalog.lock"),
            write_lock: Mutex::new(()),
        })
    }

    fn lock(&self) -> Result<WriteGuard<'_>> {
        let thread = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(WriteGuard {
            _file: FileLock::exclusive(&self.lock_path)?,
            _thread: thread,
        })
    }

    // Applications

    pub fn applications(&self) -> Result<Vec<Application>> {
        match fs::read(&self.applications_path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn application(&self, name: &str) -> Result<Application> {
        self.applications()?
            .into_iter()
            .find(|app| app.name == name)
            .ok_or_else(|| Error::ApplicationNotFound {
                name: name.to_string(),
            })
    }

    pub fn insert_application(&self, app: Application) -> Result<()> {
        let _guard = self.lock()?;
        let mut apps = self.applications()?;
        if apps.iter().any(|existing| existing.name == app.name) {
            return Err(Error::ApplicationExists { name: app.name });
        }
        info!("Registering application '{}'", app.name);
        apps.push(app);
        self.write_applications(&mut apps)
    }

    /// Replace the stored application with the same name
    pub fn update_application(&self, app: Application) -> Result<()> {
        let _guard = self.lock()?;
        let mut apps = self.applications()?;
        let slot = apps
            .iter_mut()
            .find(|existing| existing.name == app.name)
            .ok_or_else(|| Error::ApplicationNotFound {
                name: app.name.clone(),
            })?;
        *slot = app;
        self.write_applications(&mut apps)
    }

    fn write_applications(&self, apps: &mut [Application]) -> Result<()> {
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        let bytes = serde_json::to_vec_pretty(apps)?;
        write_atomic(&self.tmp_path, &self.applications_path, &bytes)?;
        Ok(())
    }

    // Backups

    /// Commit a backup record with its manifest, assigning its sequence number
    pub fn commit_backup(
        &self,
        mut record: BackupRecord,
        entries: &[FileManifestEntry],
    ) -> Result<BackupRecord> {
        let _guard = self.lock()?;

        record.sequence = self.next_sequence()?;
        record.entry_count = entries.len();

        let document = ManifestDocument {
            version: MANIFEST_VERSION,
            backup_id: record.id,
            entries: entries.to_vec(),
        };
        write_atomic(
            &self.tmp_path,
            &self.manifest_path(&record.id),
            &serde_json::to_vec_pretty(&document)?,
        )?;
        self.write_record(&record)?;

        info!(
            "Committed backup {} ({} #{}, {} entries)",
            record.id, record.backup_type, record.sequence, record.entry_count
        );
        Ok(record)
    }

    fn write_record(&self, record: &BackupRecord) -> Result<()> {
        write_atomic(
            &self.tmp_path,
            &self.record_path(&record.id),
            &serde_json::to_vec_pretty(record)?,
        )?;
        Ok(())
    }

    fn next_sequence(&self) -> Result<u64> {
        Ok(self
            .all_backups()?
            .iter()
            .map(|record| record.sequence)
            .max()
            .map_or(1, |max| max + 1))
    }

    pub fn backup(&self, id: &BackupId) -> Result<BackupRecord> {
        match fs::read(self.record_path(id)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::BackupNotFound { id: *id }),
            Err(e) => Err(e.into()),
        }
    }

    /// Every committed record, in no particular order
    pub fn all_backups(&self) -> Result<Vec<BackupRecord>> {
        let mut records = Vec::new();
        for id in self.list_ids(&self.backups_path)? {
            match self.backup(&id) {
                Ok(record) => records.push(record),
                // Deleted between listing and reading
                Err(Error::BackupNotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Backups of one application, newest first
    pub fn backups_for(&self, app_name: &str) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self
            .all_backups()?
            .into_iter()
            .filter(|record| record.app_name == app_name)
            .collect();
        records.sort_by(|a, b| b.order_key().cmp(&a.order_key()));
        Ok(records)
    }

    pub fn manifest(&self, id: &BackupId) -> Result<Vec<FileManifestEntry>> {
        let path = self.manifest_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::BackupNotFound { id: *id })
            }
            Err(e) => return Err(e.into()),
        };

        let document: ManifestDocument = serde_json::from_slice(&bytes)?;
        if document.version != MANIFEST_VERSION || document.backup_id != *id {
            return Err(Error::IntegrityError {
                backup_id: *id,
                reason: format!(
                    "manifest {} has version {} for backup {}",
                    path.display(),
                    document.version,
                    document.backup_id
                ),
            });
        }
        Ok(document.entries)
    }

    /// Flip the verified flag; the only mutation a committed record allows
    pub fn mark_verified(&self, id: &BackupId) -> Result<BackupRecord> {
        let _guard = self.lock()?;
        let mut record = self.backup(id)?;
        if !record.verified {
            record.verified = true;
            self.write_record(&record)?;
            debug!("Marked backup {} verified", id);
        }
        Ok(record)
    }

    /// Backups whose parent link points at `id`
    pub fn dependents_of(&self, id: &BackupId) -> Result<Vec<BackupId>> {
        let mut dependents: Vec<BackupId> = self
            .all_backups()?
            .into_iter()
            .filter(|record| record.parent_backup_id == Some(*id))
            .map(|record| record.id)
            .collect();
        dependents.sort();
        Ok(dependents)
    }

    /// Delete a record and its manifest. Refused while dependents remain.
    pub fn delete_backup(&self, id: &BackupId) -> Result<BackupRecord> {
        let _guard = self.lock()?;
        let record = self.backup(id)?;

        let dependents = self.dependents_of(id)?;
        if !dependents.is_empty() {
            return Err(Error::DependentsExist {
                id: *id,
                dependents,
            });
        }

        // Record first: without it the manifest is debris, never a half backup.
        fs::remove_file(self.record_path(id))?;
        remove_if_exists(&self.manifest_path(id))?;

        info!("Deleted backup {} from catalog", id);
        Ok(record)
    }

    /// Remove manifests that never got a record.
    ///
    /// Only safe while no backup can be between its manifest and record
    /// writes; the engine calls it under the exclusive store lock.
    pub fn remove_orphan_manifests(&self) -> Result<Vec<BackupId>> {
        let _guard = self.lock()?;
        let committed: HashSet<BackupId> = self.list_ids(&self.backups_path)?.into_iter().collect();

        let mut removed = Vec::new();
        for id in self.list_ids(&self.manifests_path)? {
            if !committed.contains(&id) {
                remove_if_exists(&self.manifest_path(&id))?;
                debug!("Removed orphan manifest {}", id);
                removed.push(id);
            }
        }
        Ok(removed)
    }

    fn list_ids(&self, dir: &Path) -> Result<Vec<BackupId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                if let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<BackupId>().ok())
                {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    fn record_path(&self, id: &BackupId) -> PathBuf {
        self.backups_path.join(format!("{}.json", id))
    }

    fn manifest_path(&self, id: &BackupId) -> PathBuf {
        self.manifests_path.join(format!("{}.json", id))
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
