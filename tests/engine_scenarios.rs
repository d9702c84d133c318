//! End-to-end backup, restore, verification and retention through the engine.

use chainvault::storage::{ArchiveLocation, BlobStore, LocalFsStore};
use chainvault::{BackupId, BackupType, ChangeKind, Config, Engine, Error, RetentionPolicy, Result};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use tempfile::TempDir;

struct Setup {
    temp_dir: TempDir,
    source: PathBuf,
    store_root: PathBuf,
}

impl Setup {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let store_root = temp_dir.path().join("store");
        fs::create_dir_all(&source).unwrap();
        Self {
            temp_dir,
            source,
            store_root,
        }
    }

    fn config(&self) -> Config {
        Config::with_root(&self.store_root)
    }

    fn engine(&self) -> Engine {
        let engine = Engine::open(self.config()).unwrap();
        engine.register_application("web", &self.source, None).unwrap();
        engine
    }

    fn write(&self, rel: &str, contents: &[u8]) {
        let path = self.source.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    fn remove(&self, rel: &str) {
        fs::remove_file(self.source.join(rel)).unwrap();
    }

    fn dest(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    fn blob_path(&self, location: &ArchiveLocation) -> PathBuf {
        LocalFsStore::new(&self.store_root)
            .unwrap()
            .blob_path(location)
            .unwrap()
    }
}

fn read_tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let rel = entry.path().strip_prefix(root).unwrap().to_path_buf();
            (rel, fs::read(entry.path()).unwrap())
        })
        .collect()
}

fn flip_byte(path: &Path, offset_from_end: usize) {
    let mut bytes = fs::read(path).unwrap();
    let index = bytes.len() - offset_from_end;
    bytes[index] ^= 0x01;
    fs::write(path, bytes).unwrap();
}

fn changes(engine: &Engine, id: &BackupId) -> Vec<(PathBuf, ChangeKind)> {
    engine
        .backup_manifest(id)
        .unwrap()
        .into_iter()
        .map(|entry| (entry.path, entry.change))
        .collect()
}

#[test]
fn test_full_then_incremental_then_restore() -> Result<()> {
    let setup = Setup::new();
    let engine = setup.engine();
    setup.write("a", &[b'a'; 10]);
    setup.write("b", &[b'b'; 20]);
    setup.write("c", &[b'c'; 30]);

    let full = engine.create_backup("web", BackupType::Full)?.record;
    assert_eq!(full.backup_type, BackupType::Full);
    assert_eq!(
        changes(&engine, &full.id),
        vec![
            (PathBuf::from("a"), ChangeKind::Added),
            (PathBuf::from("b"), ChangeKind::Added),
            (PathBuf::from("c"), ChangeKind::Added),
        ]
    );

    setup.write("b", b"b changed at t1");
    setup.write("d", b"new at t1");
    setup.remove("c");

    let inc = engine.create_backup("web", BackupType::Incremental)?.record;
    assert_eq!(inc.backup_type, BackupType::Incremental);
    assert_eq!(inc.parent_backup_id, Some(full.id));
    assert_eq!(
        changes(&engine, &inc.id),
        vec![
            (PathBuf::from("b"), ChangeKind::Modified),
            (PathBuf::from("c"), ChangeKind::Deleted),
            (PathBuf::from("d"), ChangeKind::Added),
        ]
    );

    let dest = setup.dest("restored");
    let report = engine.restore_backup(&inc.id, &dest)?;
    assert_eq!(report.chain, vec![full.id, inc.id]);
    assert_eq!(report.files_written, 3);
    assert_eq!(report.tombstones_applied, 1);

    let tree = read_tree(&dest);
    assert_eq!(tree[Path::new("a")], vec![b'a'; 10]);
    assert_eq!(tree[Path::new("b")], b"b changed at t1".to_vec());
    assert_eq!(tree[Path::new("d")], b"new at t1".to_vec());
    assert!(!dest.join("c").exists());
    Ok(())
}

#[test]
fn test_differential_restore_skips_intermediate_incrementals() -> Result<()> {
    let setup = Setup::new();
    let engine = setup.engine();
    setup.write("a", b"alpha");
    setup.write("b", b"bravo");
    setup.write("c", b"charlie");
    let full = engine.create_backup("web", BackupType::Full)?.record;

    setup.write("b", b"bravo at i1");
    setup.remove("c");
    let i1 = engine.create_backup("web", BackupType::Incremental)?.record;
    assert_eq!(i1.parent_backup_id, Some(full.id));

    setup.write("d", b"delta after i1");
    let diff = engine.create_backup("web", BackupType::Differential)?.record;
    assert_eq!(diff.parent_backup_id, Some(full.id));
    assert_eq!(
        changes(&engine, &diff.id),
        vec![
            (PathBuf::from("b"), ChangeKind::Modified),
            (PathBuf::from("c"), ChangeKind::Deleted),
            (PathBuf::from("d"), ChangeKind::Added),
        ]
    );
    let reference = engine.create_backup("web", BackupType::Full)?.record;

    let via_diff = setup.dest("via-diff");
    let report = engine.restore_backup(&diff.id, &via_diff)?;
    assert_eq!(report.chain, vec![full.id, diff.id]);
    assert_eq!(report.tombstones_applied, 1);

    let via_full = setup.dest("via-full");
    engine.restore_backup(&reference.id, &via_full)?;
    assert_eq!(read_tree(&via_diff), read_tree(&via_full));
    assert!(!via_diff.join("c").exists());
    assert_eq!(fs::read(via_diff.join("b"))?, b"bravo at i1");
    Ok(())
}

#[test]
fn test_full_restore_matches_manifest() -> Result<()> {
    let setup = Setup::new();
    let engine = setup.engine();
    setup.write("index.html", b"<html></html>");
    setup.write("assets/app.js", b"console.log(1)");
    setup.write("assets/img/logo.svg", b"<svg/>");

    let full = engine.create_backup("web", BackupType::Full)?.record;
    let dest = setup.dest("restored");
    engine.restore_backup(&full.id, &dest)?;

    let expected: BTreeMap<PathBuf, chainvault::digest::ContentHash> = engine
        .backup_manifest(&full.id)?
        .into_iter()
        .map(|entry| (entry.path, entry.hash))
        .collect();
    let actual: BTreeMap<PathBuf, chainvault::digest::ContentHash> = read_tree(&dest)
        .into_iter()
        .map(|(path, bytes)| (path, chainvault::digest::ContentHash::from_bytes(&bytes)))
        .collect();
    assert_eq!(actual, expected);
    Ok(())
}

#[test]
fn test_chain_replay_matches_full_at_same_state() -> Result<()> {
    let setup = Setup::new();
    let engine = setup.engine();
    setup.write("keep.txt", b"unchanged");
    setup.write("edit.txt", b"v1");
    setup.write("gone.txt", b"short lived");

    engine.create_backup("web", BackupType::Full)?;

    setup.write("edit.txt", b"version two");
    setup.write("new/one.txt", b"one");
    engine.create_backup("web", BackupType::Incremental)?;

    setup.remove("gone.txt");
    setup.write("new/two.txt", b"two");
    let i2 = engine.create_backup("web", BackupType::Incremental)?.record;
    let reference = engine.create_backup("web", BackupType::Full)?.record;

    let via_chain = setup.dest("via-chain");
    let via_full = setup.dest("via-full");
    engine.restore_backup(&i2.id, &via_chain)?;
    engine.restore_backup(&reference.id, &via_full)?;

    assert_eq!(read_tree(&via_chain), read_tree(&via_full));
    assert!(!via_chain.join("gone.txt").exists());
    Ok(())
}

#[test]
fn test_tampered_incremental_fails_restore_and_leaves_destination_untouched() -> Result<()> {
    let setup = Setup::new();
    let engine = setup.engine();
    setup.write("a", b"alpha");
    setup.write("b", b"bravo");
    engine.create_backup("web", BackupType::Full)?;

    setup.write("b", b"bravo, modified");
    let inc = engine.create_backup("web", BackupType::Incremental)?.record;
    assert!(inc.encrypted);

    flip_byte(&setup.blob_path(&inc.archive), 20);

    let dest = setup.dest("restored");
    fs::create_dir_all(&dest)?;
    match engine.restore_backup(&inc.id, &dest) {
        Err(Error::IntegrityError { backup_id, .. }) => assert_eq!(backup_id, inc.id),
        other => panic!("expected IntegrityError, got {:?}", other.map(|r| r.backup_id)),
    }
    assert_eq!(fs::read_dir(&dest)?.count(), 0);
    Ok(())
}

#[test]
fn test_tampered_ancestor_reports_broken_link() -> Result<()> {
    let setup = Setup::new();
    let engine = setup.engine();
    setup.write("a", b"alpha");
    let full = engine.create_backup("web", BackupType::Full)?.record;
    setup.write("b", b"bravo");
    let inc = engine.create_backup("web", BackupType::Incremental)?.record;

    flip_byte(&setup.blob_path(&full.archive), 1);

    match engine.restore_backup(&inc.id, &setup.dest("restored")) {
        Err(Error::ChainBroken { link, .. }) => assert_eq!(link, full.id),
        other => panic!("expected ChainBroken, got {:?}", other.map(|r| r.backup_id)),
    }
    assert!(!setup.dest("restored").exists());
    Ok(())
}

#[test]
fn test_missing_archive_breaks_chain() -> Result<()> {
    let setup = Setup::new();
    let engine = setup.engine();
    setup.write("a", b"alpha");
    let full = engine.create_backup("web", BackupType::Full)?.record;
    setup.write("b", b"bravo");
    let inc = engine.create_backup("web", BackupType::Incremental)?.record;

    fs::remove_file(setup.blob_path(&full.archive))?;

    assert!(matches!(
        engine.restore_backup(&inc.id, &setup.dest("restored")),
        Err(Error::ChainBroken { link, .. }) if link == full.id
    ));
    Ok(())
}

#[test]
fn test_restore_refuses_non_empty_destination() -> Result<()> {
    let setup = Setup::new();
    let engine = setup.engine();
    setup.write("a", b"alpha");
    let full = engine.create_backup("web", BackupType::Full)?.record;

    let dest = setup.dest("occupied");
    fs::create_dir_all(&dest)?;
    fs::write(dest.join("existing"), b"keep me")?;

    assert!(matches!(
        engine.restore_backup(&full.id, &dest),
        Err(Error::DestinationNotEmpty { .. })
    ));
    assert_eq!(fs::read(dest.join("existing"))?, b"keep me");
    Ok(())
}

#[test]
fn test_verification_sets_flag_and_is_idempotent() -> Result<()> {
    let setup = Setup::new();
    let engine = setup.engine();
    setup.write("a", b"alpha");
    let full = engine.create_backup("web", BackupType::Full)?.record;
    assert!(!full.verified);

    assert!(engine.verify_backup(&full.id)?);
    assert!(engine.verify_backup(&full.id)?);
    assert!(engine.get_backup(&full.id)?.verified);
    Ok(())
}

#[test]
fn test_verification_never_passes_corrupted_archives() -> Result<()> {
    let setup = Setup::new();
    let engine = setup.engine();
    setup.write("a", b"alpha alpha alpha");
    setup.write("nested/b", b"bravo bravo bravo");
    let full = engine.create_backup("web", BackupType::Full)?.record;
    let blob = setup.blob_path(&full.archive);
    let pristine = fs::read(&blob)?;

    for offset_from_end in [1, 8, 17, pristine.len() / 2, pristine.len() - 1] {
        fs::write(&blob, &pristine)?;
        flip_byte(&blob, offset_from_end);

        let report = engine.verify_backup_report(&full.id)?;
        assert!(!report.verified, "corruption at -{} passed", offset_from_end);
        assert!(!report.errors.is_empty());
        assert!(!engine.get_backup(&full.id)?.verified);
    }

    fs::remove_file(&blob)?;
    assert!(!engine.verify_backup(&full.id)?);

    // No sandbox outlives its run.
    let scratch = engine.config().scratch_dir();
    assert_eq!(fs::read_dir(&scratch)?.count(), 0);
    Ok(())
}

#[test]
fn test_missing_key_file_fails_verification() -> Result<()> {
    let setup = Setup::new();
    let mut config = setup.config();
    config.verification.key_files = vec![PathBuf::from("config/app.toml")];
    let engine = Engine::open(config)?;
    engine.register_application("web", &setup.source, None)?;
    setup.write("index.html", b"<html></html>");

    let full = engine.create_backup("web", BackupType::Full)?.record;
    let report = engine.verify_backup_report(&full.id)?;
    assert!(!report.verified);
    assert_eq!(report.missing_key_files, vec![PathBuf::from("config/app.toml")]);

    setup.write("config/app.toml", b"port = 80");
    let inc = engine.create_backup("web", BackupType::Incremental)?.record;
    assert!(engine.verify_backup(&inc.id)?);
    Ok(())
}

#[test]
fn test_require_verified_chain() -> Result<()> {
    let setup = Setup::new();
    let mut config = setup.config();
    config.verification.require_verified_chain = true;
    let engine = Engine::open(config)?;
    engine.register_application("web", &setup.source, None)?;
    setup.write("a", b"alpha");

    let full = engine.create_backup("web", BackupType::Full)?.record;
    assert!(matches!(
        engine.restore_backup(&full.id, &setup.dest("first")),
        Err(Error::ChainBroken { link, .. }) if link == full.id
    ));

    assert!(engine.verify_backup(&full.id)?);
    engine.restore_backup(&full.id, &setup.dest("second"))?;
    assert_eq!(fs::read(setup.dest("second").join("a"))?, b"alpha");
    Ok(())
}

#[test]
fn test_retention_keeps_dependencies_and_purges_unreferenced_full() -> Result<()> {
    let setup = Setup::new();
    let engine = Engine::open(setup.config())?;
    engine.register_application("web", &setup.source, Some(RetentionPolicy::new(None, Some(1))))?;
    setup.write("a", b"alpha");

    let old_full = engine.create_backup("web", BackupType::Full)?.record;
    let full = engine.create_backup("web", BackupType::Full)?.record;
    setup.write("b", b"bravo");
    let inc = engine.create_backup("web", BackupType::Incremental)?.record;
    assert_eq!(inc.parent_backup_id, Some(full.id));

    let deleted = engine.apply_retention("web")?;
    assert_eq!(deleted, vec![old_full.id]);

    let remaining: Vec<BackupId> = engine.list_backups("web")?.iter().map(|r| r.id).collect();
    assert_eq!(remaining, vec![inc.id, full.id]);
    assert!(!setup.blob_path(&old_full.archive).exists());

    // The survivors still restore.
    engine.restore_backup(&inc.id, &setup.dest("restored"))?;

    // A second sweep has nothing left to delete.
    assert!(engine.apply_retention("web")?.is_empty());
    Ok(())
}

#[test]
fn test_recovery_uses_newest_verified_backup() -> Result<()> {
    let setup = Setup::new();
    let engine = setup.engine();
    setup.write("a", b"alpha");
    setup.write("docs/readme", b"read me");

    assert!(matches!(
        engine.recover_latest_verified("web", &setup.dest("too-early")),
        Err(Error::NoVerifiedBackup { app }) if app == "web"
    ));

    let old = engine.create_backup("web", BackupType::Full)?.record;
    assert!(engine.verify_backup(&old.id)?);
    setup.write("b", b"bravo");
    let verified = engine.create_backup("web", BackupType::Incremental)?.record;
    assert!(engine.verify_backup(&verified.id)?);

    // Newer, but never verified.
    setup.write("c", b"charlie");
    engine.create_backup("web", BackupType::Incremental)?;

    let dest = setup.dest("recovered");
    let report = engine.recover_latest_verified("web", &dest)?;
    assert!(report.succeeded());
    assert_eq!(report.backup.id, verified.id);
    assert_eq!(report.restore.chain, vec![old.id, verified.id]);
    assert_eq!(report.verification.files_checked, 3);
    assert_eq!(
        read_tree(&dest).into_keys().collect::<Vec<_>>(),
        vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("docs/readme")]
    );
    Ok(())
}

#[test]
fn test_reopened_engine_sees_committed_backups() -> Result<()> {
    let setup = Setup::new();
    setup.write("a", b"alpha");
    let full = {
        let engine = setup.engine();
        engine.create_backup("web", BackupType::Full)?.record
    };

    let engine = Engine::open(setup.config())?;
    assert_eq!(engine.list_backups("web")?, vec![full.clone()]);
    engine.restore_backup(&full.id, &setup.dest("restored"))?;
    Ok(())
}

/// Blob store that holds the first `persist` call, after the blob is
/// written, until released
struct GatedStore {
    inner: LocalFsStore,
    armed: AtomicBool,
    entered: Sender<()>,
    release: Mutex<Receiver<()>>,
}

impl BlobStore for GatedStore {
    fn persist(&self, id: &BackupId, bytes: &[u8]) -> Result<ArchiveLocation> {
        let location = self.inner.persist(id, bytes)?;
        if self.armed.swap(false, Ordering::SeqCst) {
            let _ = self.entered.send(());
            let _ = self.release.lock().unwrap().recv();
        }
        Ok(location)
    }

    fn fetch(&self, location: &ArchiveLocation) -> Result<Vec<u8>> {
        self.inner.fetch(location)
    }

    fn remove(&self, location: &ArchiveLocation) -> Result<()> {
        self.inner.remove(location)
    }

    fn locations(&self) -> Result<Vec<ArchiveLocation>> {
        self.inner.locations()
    }
}

#[test]
fn test_concurrent_backups_of_one_application() -> Result<()> {
    let setup = Setup::new();
    setup.write("a", b"alpha");

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let store = GatedStore {
        inner: LocalFsStore::new(&setup.store_root)?,
        armed: AtomicBool::new(true),
        entered: entered_tx,
        release: Mutex::new(release_rx),
    };
    let engine = Engine::with_store(setup.config(), Box::new(store))?;
    engine.register_application("web", &setup.source, None)?;
    engine.register_application("api", &setup.source, None)?;

    std::thread::scope(|scope| {
        let first = scope.spawn(|| engine.create_backup("web", BackupType::Full));
        entered_rx.recv().unwrap();

        assert!(matches!(
            engine.create_backup("web", BackupType::Full),
            Err(Error::BackupInProgress { app }) if app == "web"
        ));
        // Other applications are not blocked.
        engine.create_backup("api", BackupType::Full).unwrap();

        release_tx.send(()).unwrap();
        let record = first.join().unwrap().unwrap().record;
        assert_eq!(record.app_name, "web");
    });

    assert_eq!(engine.list_backups("web")?.len(), 1);
    engine.create_backup("web", BackupType::Incremental)?;
    Ok(())
}

#[cfg(unix)]
#[test]
fn test_second_engine_on_same_root_respects_in_flight_backup() -> Result<()> {
    let setup = Setup::new();
    setup.write("a", b"alpha");

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let store = GatedStore {
        inner: LocalFsStore::new(&setup.store_root)?,
        armed: AtomicBool::new(true),
        entered: entered_tx,
        release: Mutex::new(release_rx),
    };
    let first = Engine::with_store(setup.config(), Box::new(store))?;
    first.register_application("web", &setup.source, None)?;

    let record = std::thread::scope(|scope| {
        let job = scope.spawn(|| first.create_backup("web", BackupType::Full));
        entered_rx.recv().unwrap();

        // The first job's archive is on disk with no record yet.
        let second = Engine::open(setup.config()).unwrap();
        assert!(!second.sweep_orphans().unwrap());
        assert!(matches!(
            second.create_backup("web", BackupType::Full),
            Err(Error::BackupInProgress { app }) if app == "web"
        ));

        release_tx.send(()).unwrap();
        job.join().unwrap().unwrap().record
    });

    let second = Engine::open(setup.config())?;
    assert!(second.sweep_orphans()?);
    assert!(setup.blob_path(&record.archive).is_file());
    second.restore_backup(&record.id, &setup.dest("restored"))?;
    assert_eq!(fs::read(setup.dest("restored").join("a"))?, b"alpha");
    second.create_backup("web", BackupType::Incremental)?;
    Ok(())
}
