//! Archive blob storage behind a narrow capability interface

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::models::BackupId;
use crate::{Error, Result};

/// Opaque handle a store hands back for a persisted blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveLocation(pub String);

impl ArchiveLocation {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchiveLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where archive blobs live. One blob per backup, keyed by backup id.
pub trait BlobStore: Send + Sync {
    /// Store `bytes` for `id`, returning the location to fetch them from
    fn persist(&self, id: &BackupId, bytes: &[u8]) -> Result<ArchiveLocation>;

    /// Read back a blob; a missing blob is `io::ErrorKind::NotFound`
    fn fetch(&self, location: &ArchiveLocation) -> Result<Vec<u8>>;

    /// Delete a blob; deleting a missing blob is not an error
    fn remove(&self, location: &ArchiveLocation) -> Result<()>;

    /// Every blob currently held by the store
    fn locations(&self) -> Result<Vec<ArchiveLocation>>;
}

/// Blob store on the local filesystem
#[derive(Debug)]
pub struct LocalFsStore {
    archives_path: PathBuf,
    tmp_path: PathBuf,
}

impl LocalFsStore {
    pub fn new<P: AsRef<Path>>(root_path: P) -> Result<Self> {
        let root_path = root_path.as_ref();
        let archives_path = root_path.join("archives");
        let tmp_path = root_path.join("tmp");

        fs::create_dir_all(&archives_path)?;
        fs::create_dir_all(&tmp_path)?;

        Ok(Self {
            archives_path,
            tmp_path,
        })
    }

    /// Filesystem path behind a location
    pub fn blob_path(&self, location: &ArchiveLocation) -> Result<PathBuf> {
        let name = location.as_str();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if !valid || name.starts_with('.') {
            return Err(Error::UnsafeArchivePath {
                path: PathBuf::from(name),
            });
        }
        Ok(self.archives_path.join(name))
    }
}

impl BlobStore for LocalFsStore {
    fn persist(&self, id: &BackupId, bytes: &[u8]) -> Result<ArchiveLocation> {
        let location = ArchiveLocation(format!("{}.cva", id));
        let target = self.blob_path(&location)?;

        write_atomic(&self.tmp_path, &target, bytes).map_err(|e| Error::ArchiveWriteFailure {
            path: target.clone(),
            reason: e.to_string(),
        })?;

        debug!("Persisted archive {} ({} bytes)", target.display(), bytes.len());
        Ok(location)
    }

    fn fetch(&self, location: &ArchiveLocation) -> Result<Vec<u8>> {
        Ok(fs::read(self.blob_path(location)?)?)
    }

    fn remove(&self, location: &ArchiveLocation) -> Result<()> {
        match fs::remove_file(self.blob_path(location)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn locations(&self) -> Result<Vec<ArchiveLocation>> {
        let mut locations = Vec::new();
        for entry in fs::read_dir(&self.archives_path)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "cva") {
                if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
                    locations.push(ArchiveLocation(name.to_string()));
                }
            }
        }
        locations.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(locations)
    }
}

/// Write to a temporary file in `tmp_dir`, sync, then rename over `target`
pub(crate) fn write_atomic(tmp_dir: &Path, target: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::create_dir_all(tmp_dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(tmp_dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;

    if let Some(parent) = target.parent() {
        // Directory fsync is best effort; not every platform supports it.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
