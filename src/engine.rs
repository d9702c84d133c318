//! The engine instance: owns the catalog, the blob store, the sealer and the
//! per-application lock table, and exposes every operation callers use.
//!
//! Several engines, in one process or many, may share a storage root. Each
//! backup holds `locks/store.lock` shared from persisting its archive until
//! its record is committed; the orphan sweep runs only when it can take that
//! lock exclusively.

use chrono::Utc;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, span, warn, Level};

use crate::archive::Archiver;
use crate::cancel::CancelToken;
use crate::catalog::Catalog;
use crate::chain::ChainResolver;
use crate::change::{Baseline, ChangeDetector};
use crate::config::Config;
use crate::crypto::{CryptoSealer, MasterKey};
use crate::lock::{AppLockTable, FileLock};
use crate::models::{
    Application, BackupId, BackupRecord, BackupType, FileManifestEntry, RetentionPolicy,
};
use crate::restore::{ChainReplayer, RestoreReport, Restorer};
use crate::retention::{self, RetentionPlan, RetentionStatus};
use crate::scanner::{ScanWarning, Scanner};
use crate::storage::{ArchiveLocation, BlobStore, LocalFsStore};
use crate::verify::{self, IntegrityVerifier, VerificationReport};
use crate::{Error, Result};

/// A committed backup plus the files that could not be read
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub record: BackupRecord,
    pub warnings: Vec<ScanWarning>,
}

impl BackupOutcome {
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Outcome of restoring the newest verified backup and checking the result
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub backup: BackupRecord,
    pub restore: RestoreReport,
    /// The published tree compared against the backup's manifest
    pub verification: VerificationReport,
}

impl RecoveryReport {
    pub fn succeeded(&self) -> bool {
        self.verification.verified
    }
}

/// Backup engine bound to one storage root
pub struct Engine {
    config: Config,
    catalog: Catalog,
    store: Box<dyn BlobStore>,
    sealer: Option<CryptoSealer>,
    locks: AppLockTable,
    store_lock_path: PathBuf,
    scratch_dir: PathBuf,
}

impl Engine {
    /// Open the engine on the local filesystem store under `storage.root`
    pub fn open(config: Config) -> Result<Self> {
        let store = LocalFsStore::new(&config.storage.root)?;
        Self::with_store(config, Box::new(store))
    }

    /// Open the engine with a caller-provided blob store
    pub fn with_store(config: Config, store: Box<dyn BlobStore>) -> Result<Self> {
        config.validate()?;
        let root = config.storage.root.clone();
        fs::create_dir_all(&root)?;

        let catalog = Catalog::open(&root)?;
        let key_path = config.key_file_path();
        let sealer = if config.encryption.enabled || key_path.exists() {
            Some(CryptoSealer::new(&MasterKey::load_or_generate(&key_path)?))
        } else {
            None
        };

        let scratch_dir = config.scratch_dir();
        fs::create_dir_all(&scratch_dir)?;

        let locks_dir = root.join("locks");
        let engine = Self {
            config,
            catalog,
            store,
            sealer,
            locks: AppLockTable::new(&locks_dir),
            store_lock_path: locks_dir.join("store.lock"),
            scratch_dir,
        };
        engine.register_configured_applications()?;
        engine.sweep_orphans()?;

        info!("Engine opened at {}", root.display());
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn locks(&self) -> &AppLockTable {
        &self.locks
    }

    fn register_configured_applications(&self) -> Result<()> {
        let known: HashSet<String> = self
            .catalog
            .applications()?
            .into_iter()
            .map(|app| app.name)
            .collect();

        for declared in &self.config.applications {
            if !known.contains(&declared.name) {
                self.catalog
                    .insert_application(declared.to_application(self.config.retention))?;
            }
        }
        Ok(())
    }

    /// Remove debris of interrupted jobs: manifests without a record and
    /// archives no record points at.
    ///
    /// Returns false without touching anything while another job on this
    /// root is between persisting an archive and committing its record.
    pub fn sweep_orphans(&self) -> Result<bool> {
        let Some(_exclusive) = FileLock::try_exclusive(&self.store_lock_path)? else {
            info!("Storage root has a job in flight, skipping orphan sweep");
            return Ok(false);
        };

        let manifests = self.catalog.remove_orphan_manifests()?;
        if !manifests.is_empty() {
            warn!("Removed {} uncommitted manifests", manifests.len());
        }
        self.remove_orphan_archives()?;
        Ok(true)
    }

    /// Delete archive blobs that no committed record points at
    fn remove_orphan_archives(&self) -> Result<()> {
        let referenced: HashSet<ArchiveLocation> = self
            .catalog
            .all_backups()?
            .into_iter()
            .map(|record| record.archive)
            .collect();

        for location in self.store.locations()? {
            if !referenced.contains(&location) {
                warn!("Removing orphan archive {}", location);
                self.store.remove(&location)?;
            }
        }
        Ok(())
    }

    // Applications

    pub fn register_application(
        &self,
        name: &str,
        source_root: impl Into<PathBuf>,
        retention: Option<RetentionPolicy>,
    ) -> Result<Application> {
        if name.trim().is_empty() {
            return Err(Error::Configuration {
                reason: "application name must not be empty".to_string(),
            });
        }
        let app = Application::new(name, source_root)
            .with_retention(retention.unwrap_or(self.config.retention));
        self.catalog.insert_application(app.clone())?;
        Ok(app)
    }

    pub fn list_applications(&self) -> Result<Vec<Application>> {
        self.catalog.applications()
    }

    pub fn set_application_active(&self, name: &str, active: bool) -> Result<Application> {
        let mut app = self.catalog.application(name)?;
        app.active = active;
        self.catalog.update_application(app.clone())?;
        info!(
            "Application '{}' {}",
            name,
            if active { "enabled" } else { "disabled" }
        );
        Ok(app)
    }

    // Backups

    pub fn create_backup(&self, app_name: &str, backup_type: BackupType) -> Result<BackupOutcome> {
        self.create_backup_with_cancel(app_name, backup_type, &CancelToken::new())
    }

    /// Run one backup job. Nothing is committed unless the whole job succeeds.
    pub fn create_backup_with_cancel(
        &self,
        app_name: &str,
        backup_type: BackupType,
        cancel: &CancelToken,
    ) -> Result<BackupOutcome> {
        let app = self.catalog.application(app_name)?;
        if !app.active {
            return Err(Error::ApplicationInactive {
                name: app.name.clone(),
            });
        }
        let _guard = self.locks.try_acquire(app_name)?;

        let span = span!(Level::INFO, "create_backup", app = %app_name, kind = %backup_type);
        let _enter = span.enter();
        let started_at = Utc::now();

        if !app.source_root.is_dir() {
            return Err(Error::SourceUnreadable {
                path: app.source_root.clone(),
                reason: "source root is not a readable directory".to_string(),
            });
        }

        let (effective_type, parent, baseline) = self.plan_baseline(&app, backup_type)?;
        info!(
            "Starting {} backup of '{}' from {}",
            effective_type,
            app.name,
            app.source_root.display()
        );

        let scanner = Scanner::new(&app.source_root, &self.config.scan)?;
        let mut changes = ChangeDetector::new(&scanner).detect(&baseline, cancel)?;
        for warning in &changes.warnings {
            warn!("Unreadable source file {}", warning);
        }

        let id = BackupId::new();
        let packed = Archiver::new(self.config.archive.compression_level)
            .pack(&changes.files_to_archive(), cancel)?;
        changes.leave_out(&packed.skipped);
        debug!("Archive of {} holds {} files", id, packed.file_count);
        cancel.check()?;

        let _writing = FileLock::shared(&self.store_lock_path)?;

        let (stored, encrypted) = match (&self.sealer, self.config.encryption.enabled) {
            (Some(sealer), true) => (sealer.seal(&id, &packed.bytes)?, true),
            _ => (packed.bytes, false),
        };
        let location = self.store.persist(&id, &stored)?;

        let record = BackupRecord {
            id,
            app_name: app.name.clone(),
            backup_type: effective_type,
            parent_backup_id: parent,
            created_at: started_at,
            sequence: 0,
            archive: location.clone(),
            content_hash: packed.content_hash,
            encrypted,
            verified: false,
            size: stored.len() as u64,
            entry_count: 0,
        };
        let entries = changes.manifest_entries(id);

        let committed = cancel
            .check()
            .and_then(|()| self.catalog.commit_backup(record, &entries));
        let record = match committed {
            Ok(record) => record,
            Err(e) => {
                if let Err(cleanup) = self.store.remove(&location) {
                    warn!("Failed to remove uncommitted archive {}: {}", location, cleanup);
                }
                return Err(e);
            }
        };

        info!(
            "Backup {} of '{}' committed: {} entries, {} bytes{}",
            record.id,
            record.app_name,
            record.entry_count,
            record.size,
            if changes.warnings.is_empty() {
                String::new()
            } else {
                format!(", {} files skipped", changes.warnings.len())
            }
        );
        Ok(BackupOutcome {
            record,
            warnings: changes.warnings,
        })
    }

    /// Effective type, parent link and baseline for a new backup
    fn plan_baseline(
        &self,
        app: &Application,
        requested: BackupType,
    ) -> Result<(BackupType, Option<BackupId>, Baseline)> {
        if requested == BackupType::Full {
            return Ok((BackupType::Full, None, Baseline::new()));
        }

        let resolver = ChainResolver::new(&self.catalog);
        let Some(parent) = resolver.select_parent(&app.name, requested)? else {
            warn!(
                "No baseline for {} backup of '{}', performing a full backup",
                requested, app.name
            );
            return Ok((BackupType::Full, None, Baseline::new()));
        };

        match resolver.baseline(&parent) {
            Ok(baseline) => {
                debug!(
                    "Baseline for '{}' is {} ({} files)",
                    app.name,
                    parent.id,
                    baseline.len()
                );
                Ok((requested, Some(parent.id), baseline))
            }
            Err(Error::ChainBroken { link, reason }) => {
                warn!(
                    "Baseline chain of '{}' is broken at {} ({}), performing a full backup",
                    app.name, link, reason
                );
                Ok((BackupType::Full, None, Baseline::new()))
            }
            Err(e) => Err(e),
        }
    }

    /// Backups of an application, newest first
    pub fn list_backups(&self, app_name: &str) -> Result<Vec<BackupRecord>> {
        self.catalog.application(app_name)?;
        self.catalog.backups_for(app_name)
    }

    pub fn get_backup(&self, id: &BackupId) -> Result<BackupRecord> {
        self.catalog.backup(id)
    }

    pub fn backup_manifest(&self, id: &BackupId) -> Result<Vec<FileManifestEntry>> {
        self.catalog.backup(id)?;
        self.catalog.manifest(id)
    }

    // Restore and verification

    fn replayer(&self) -> ChainReplayer<'_> {
        ChainReplayer::new(&self.catalog, self.store.as_ref(), self.sealer.as_ref())
    }

    pub fn restore_backup(&self, id: &BackupId, destination: &Path) -> Result<RestoreReport> {
        self.restore_backup_with_cancel(id, destination, &CancelToken::new())
    }

    pub fn restore_backup_with_cancel(
        &self,
        id: &BackupId,
        destination: &Path,
        cancel: &CancelToken,
    ) -> Result<RestoreReport> {
        let target = self.catalog.backup(id)?;
        Restorer::new(
            &self.catalog,
            self.replayer(),
            &self.scratch_dir,
            self.config.verification.require_verified_chain,
        )
        .restore(&target, destination, cancel)
    }

    /// Sandbox-verify a backup; true only when every check passed
    pub fn verify_backup(&self, id: &BackupId) -> Result<bool> {
        Ok(self.verify_backup_report(id)?.verified)
    }

    pub fn verify_backup_report(&self, id: &BackupId) -> Result<VerificationReport> {
        let target = self.catalog.backup(id)?;
        IntegrityVerifier::new(
            &self.catalog,
            self.replayer(),
            &self.scratch_dir,
            &self.config.verification.key_files,
        )
        .verify(&target, &CancelToken::new())
    }

    /// Restore the newest verified backup of `app_name` into `destination`
    /// and check the published tree against that backup's manifest.
    ///
    /// Fails with `NoVerifiedBackup` when no backup of the application has
    /// passed verification. A tree that does not match is reported, not
    /// returned as an error.
    pub fn recover_latest_verified(
        &self,
        app_name: &str,
        destination: &Path,
    ) -> Result<RecoveryReport> {
        let span = span!(Level::INFO, "recover", app = %app_name);
        let _enter = span.enter();

        let backup = self
            .list_backups(app_name)?
            .into_iter()
            .find(|record| record.verified)
            .ok_or_else(|| Error::NoVerifiedBackup {
                app: app_name.to_string(),
            })?;
        info!(
            "Recovering '{}' from verified backup {} taken {}",
            app_name, backup.id, backup.created_at
        );

        let cancel = CancelToken::new();
        let restore = self.restore_backup_with_cancel(&backup.id, destination, &cancel)?;
        let verification = IntegrityVerifier::new(
            &self.catalog,
            self.replayer(),
            &self.scratch_dir,
            &self.config.verification.key_files,
        )
        .check_restored_tree(&backup, destination, &cancel)?;

        if verification.verified {
            info!(
                "Recovery of '{}' completed: {} files in {}",
                app_name,
                restore.files_written,
                destination.display()
            );
        } else {
            warn!("Recovery of '{}' produced a tree that does not match backup {}", app_name, backup.id);
        }
        Ok(RecoveryReport {
            backup,
            restore,
            verification,
        })
    }

    /// Remove sandbox directories left behind by interrupted runs
    pub fn cleanup_stale_scratch(&self, max_age: Duration) -> Result<usize> {
        verify::cleanup_stale_scratch(&self.scratch_dir, max_age)
    }

    // Retention

    /// What a sweep would do right now
    pub fn plan_retention(&self, app_name: &str) -> Result<RetentionPlan> {
        let app = self.catalog.application(app_name)?;
        let backups = self.catalog.backups_for(app_name)?;
        Ok(retention::plan(&backups, &app.retention, Utc::now()))
    }

    /// Delete expired backups that nothing retained depends on.
    ///
    /// Candidates still needed by a retained backup are deferred and logged;
    /// they are not an error.
    pub fn apply_retention(&self, app_name: &str) -> Result<Vec<BackupId>> {
        let app = self.catalog.application(app_name)?;
        let _guard = self.locks.try_acquire(app_name)?;

        let span = span!(Level::INFO, "apply_retention", app = %app_name);
        let _enter = span.enter();

        let backups = self.catalog.backups_for(app_name)?;
        let plan = retention::plan(&backups, &app.retention, Utc::now());

        let mut deleted = Vec::new();
        for eviction in &plan.evict {
            match self.catalog.delete_backup(&eviction.id) {
                Ok(record) => {
                    if let Err(e) = self.store.remove(&record.archive) {
                        warn!("Failed to remove archive {}: {}", record.archive, e);
                    }
                    info!("Deleted backup {} ({})", eviction.id, eviction.reason);
                    deleted.push(eviction.id);
                }
                Err(Error::DependentsExist { id, dependents }) => {
                    info!(
                        "Deferring deletion of {}: {} dependents remain",
                        id,
                        dependents.len()
                    );
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Retention for '{}': {} deleted, {} deferred",
            app_name,
            deleted.len(),
            plan.deferred.len()
        );
        Ok(deleted)
    }

    pub fn retention_status(&self, app_name: &str) -> Result<RetentionStatus> {
        let app = self.catalog.application(app_name)?;
        let backups = self.catalog.backups_for(app_name)?;
        Ok(retention::status(
            app_name,
            &backups,
            &app.retention,
            Utc::now(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeKind;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        source: PathBuf,
        engine: Engine,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a.txt"), b"alpha").unwrap();

        let engine = Engine::open(Config::with_root(temp_dir.path().join("store"))).unwrap();
        engine.register_application("web", &source, None).unwrap();
        Fixture {
            temp_dir,
            source,
            engine,
        }
    }

    #[test]
    fn test_incremental_without_baseline_falls_back_to_full() -> Result<()> {
        let fx = fixture();
        let outcome = fx.engine.create_backup("web", BackupType::Incremental)?;

        assert_eq!(outcome.record.backup_type, BackupType::Full);
        assert_eq!(outcome.record.parent_backup_id, None);
        assert!(outcome.record.encrypted);
        Ok(())
    }

    #[test]
    fn test_differential_links_to_latest_full() -> Result<()> {
        let fx = fixture();
        let full = fx.engine.create_backup("web", BackupType::Full)?.record;
        fs::write(fx.source.join("b.txt"), b"bravo")?;
        let inc = fx.engine.create_backup("web", BackupType::Incremental)?.record;
        fs::write(fx.source.join("c.txt"), b"charlie")?;
        let diff = fx.engine.create_backup("web", BackupType::Differential)?.record;

        assert_eq!(inc.parent_backup_id, Some(full.id));
        assert_eq!(diff.parent_backup_id, Some(full.id));

        let changes: Vec<(PathBuf, ChangeKind)> = fx
            .engine
            .backup_manifest(&diff.id)?
            .into_iter()
            .map(|e| (e.path, e.change))
            .collect();
        assert_eq!(
            changes,
            vec![
                (PathBuf::from("b.txt"), ChangeKind::Added),
                (PathBuf::from("c.txt"), ChangeKind::Added),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_empty_delta_still_commits() -> Result<()> {
        let fx = fixture();
        let full = fx.engine.create_backup("web", BackupType::Full)?.record;
        let inc = fx.engine.create_backup("web", BackupType::Incremental)?.record;

        assert_eq!(inc.parent_backup_id, Some(full.id));
        assert_eq!(inc.entry_count, 0);
        assert_eq!(fx.engine.list_backups("web")?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_locked_application_rejects_backup() -> Result<()> {
        let fx = fixture();
        let _guard = fx.engine.locks().try_acquire("web")?;

        assert!(matches!(
            fx.engine.create_backup("web", BackupType::Full),
            Err(Error::BackupInProgress { .. })
        ));
        assert!(matches!(
            fx.engine.apply_retention("web"),
            Err(Error::BackupInProgress { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_inactive_and_unknown_applications() -> Result<()> {
        let fx = fixture();
        fx.engine.set_application_active("web", false)?;

        assert!(matches!(
            fx.engine.create_backup("web", BackupType::Full),
            Err(Error::ApplicationInactive { .. })
        ));
        assert!(matches!(
            fx.engine.create_backup("ghost", BackupType::Full),
            Err(Error::ApplicationNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_cancelled_backup_commits_nothing() -> Result<()> {
        let fx = fixture();
        let cancel = CancelToken::new();
        cancel.cancel();

        assert!(matches!(
            fx.engine
                .create_backup_with_cancel("web", BackupType::Full, &cancel),
            Err(Error::Cancelled)
        ));
        assert!(fx.engine.list_backups("web")?.is_empty());
        assert!(fx.engine.store.locations()?.is_empty());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_orphan_sweep_waits_for_writers() -> Result<()> {
        let fx = fixture();
        let committed = fx.engine.create_backup("web", BackupType::Full)?.record;

        let writer = FileLock::shared(&fx.engine.store_lock_path)?;
        let in_flight = fx.engine.store.persist(&BackupId::new(), b"sealed")?;
        assert!(!fx.engine.sweep_orphans()?);
        assert_eq!(fx.engine.store.locations()?.len(), 2);

        drop(writer);
        assert!(fx.engine.sweep_orphans()?);
        assert_eq!(fx.engine.store.locations()?, vec![committed.archive]);
        assert!(!fx.engine.store.locations()?.contains(&in_flight));
        Ok(())
    }

    #[test]
    fn test_recovery_without_verified_backup_fails() -> Result<()> {
        let fx = fixture();
        fx.engine.create_backup("web", BackupType::Full)?;

        let dest = fx.temp_dir.path().join("recovered");
        assert!(matches!(
            fx.engine.recover_latest_verified("web", &dest),
            Err(Error::NoVerifiedBackup { .. })
        ));
        assert!(!dest.exists());
        Ok(())
    }

    #[test]
    fn test_unencrypted_backups_restore() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source)?;
        fs::write(source.join("plain.txt"), b"plain")?;

        let mut config = Config::with_root(temp_dir.path().join("store"));
        config.encryption.enabled = false;
        let engine = Engine::open(config)?;
        engine.register_application("docs", &source, None)?;

        let record = engine.create_backup("docs", BackupType::Full)?.record;
        assert!(!record.encrypted);

        let dest = temp_dir.path().join("restored");
        engine.restore_backup(&record.id, &dest)?;
        assert_eq!(fs::read(dest.join("plain.txt"))?, b"plain");
        Ok(())
    }

    #[test]
    fn test_configured_applications_are_registered_on_open() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut config = Config::with_root(temp_dir.path().join("store"));
        config.applications.push(crate::config::ApplicationConfig {
            name: "reports".to_string(),
            source: temp_dir.path().join("reports"),
            active: false,
            retention: Some(RetentionPolicy::new(None, Some(2))),
        });

        let engine = Engine::open(config.clone())?;
        let apps = engine.list_applications()?;
        assert_eq!(apps.len(), 1);
        assert!(!apps[0].active);
        assert_eq!(apps[0].retention.max_count, Some(2));

        // Reopening keeps the registry as it is.
        drop(engine);
        let engine = Engine::open(config)?;
        assert_eq!(engine.list_applications()?.len(), 1);
        Ok(())
    }
}
