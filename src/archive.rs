//! Deterministic tar.gz containers for backup payloads
//!
//! Files are appended in sorted path order with normalized headers, and the
//! gzip header carries no timestamp, so identical inputs produce identical
//! archive bytes.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info, span, warn, Level};

use crate::cancel::CancelToken;
use crate::digest::{ContentHash, HashingReader};
use crate::scanner::{ScanWarning, ScannedFile};
use crate::{Error, Result};

/// Plaintext archive produced by [`Archiver::pack`]
#[derive(Debug)]
pub struct PackedArchive {
    pub bytes: Vec<u8>,
    /// Hash of `bytes`
    pub content_hash: ContentHash,
    pub file_count: usize,
    /// Files left out because they changed or vanished after the scan
    pub skipped: Vec<ScanWarning>,
}

/// Builds compressed containers from scanned files
#[derive(Debug, Clone, Copy)]
pub struct Archiver {
    level: u32,
}

impl Archiver {
    pub fn new(compression_level: u32) -> Self {
        Self {
            level: compression_level.min(9),
        }
    }

    /// Pack `files` into one archive.
    ///
    /// Each file is copied to a spool while hashing, and its bytes must match
    /// the size and hash recorded by the scan before they are appended. A file
    /// that changed or vanished in between is left out and reported in
    /// [`PackedArchive::skipped`]; the caller must drop it from the manifest.
    pub fn pack(&self, files: &[&ScannedFile], cancel: &CancelToken) -> Result<PackedArchive> {
        let span = span!(Level::INFO, "pack", files = files.len());
        let _enter = span.enter();

        let mut sorted: Vec<&ScannedFile> = files.to_vec();
        sorted.sort_by(|a, b| a.stat.path.cmp(&b.stat.path));

        let encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        let mut builder = Builder::new(encoder);
        builder.mode(tar::HeaderMode::Deterministic);
        let mut spool = tempfile::tempfile().map_err(|e| Error::ArchiveWriteFailure {
            path: PathBuf::from("<spool>"),
            reason: e.to_string(),
        })?;

        let mut skipped = Vec::new();
        for file in &sorted {
            cancel.check()?;
            if let Some(warning) = append_file(&mut builder, &mut spool, file)? {
                warn!("Skipping {}", warning);
                skipped.push(warning);
            }
        }
        let file_count = sorted.len() - skipped.len();

        let bytes = builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .map_err(|e| Error::ArchiveWriteFailure {
                path: PathBuf::from("<archive>"),
                reason: e.to_string(),
            })?;

        let content_hash = ContentHash::from_bytes(&bytes);
        info!("Packed {} files into {} bytes", file_count, bytes.len());

        Ok(PackedArchive {
            bytes,
            content_hash,
            file_count,
            skipped,
        })
    }
}

/// Append one file, or return why it was left out
fn append_file(
    builder: &mut Builder<GzEncoder<Vec<u8>>>,
    spool: &mut File,
    file: &ScannedFile,
) -> Result<Option<ScanWarning>> {
    let stat = &file.stat;
    let write_failure = |e: io::Error| Error::ArchiveWriteFailure {
        path: stat.full_path.clone(),
        reason: e.to_string(),
    };
    let skip = |reason: String| -> Result<Option<ScanWarning>> {
        Ok(Some(ScanWarning::new(&stat.full_path, reason)))
    };

    let source = match File::open(&stat.full_path) {
        Ok(source) => source,
        Err(e) => return skip(format!("cannot open for archiving: {}", e)),
    };

    spool.set_len(0).map_err(write_failure)?;
    spool.seek(SeekFrom::Start(0)).map_err(write_failure)?;
    let mut reader = HashingReader::new(source.take(stat.size));
    io::copy(&mut reader, spool).map_err(write_failure)?;

    if reader.bytes_read() != stat.size {
        return skip(format!(
            "file shrank while archiving ({} of {} bytes)",
            reader.bytes_read(),
            stat.size
        ));
    }
    if reader.finalize() != file.hash {
        return skip("file changed while archiving".to_string());
    }
    spool.seek(SeekFrom::Start(0)).map_err(write_failure)?;

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(stat.size);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(stat.modified.timestamp().max(0) as u64);

    builder
        .append_data(&mut header, &stat.path, spool.by_ref().take(stat.size))
        .map_err(write_failure)?;

    debug!("Archived {} ({} bytes)", stat.path.display(), stat.size);
    Ok(None)
}

/// Unpack a plaintext archive under `dest`, returning the relative paths written.
///
/// Entries that are absolute or contain `..` are rejected before anything
/// is written for them.
pub fn unpack(bytes: &[u8], dest: &Path, cancel: &CancelToken) -> Result<Vec<PathBuf>> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    archive.set_preserve_permissions(false);
    archive.set_preserve_mtime(true);

    let mut written = Vec::new();
    for entry in archive.entries()? {
        cancel.check()?;
        let mut entry = entry?;
        let relative = entry.path()?.into_owned();

        if !is_safe_relative(&relative) {
            return Err(Error::UnsafeArchivePath { path: relative });
        }
        if entry.header().entry_type() != EntryType::Regular {
            debug!("Skipping non-file entry {}", relative.display());
            continue;
        }

        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
        written.push(relative);
    }

    Ok(written)
}

/// Relative paths made only of normal components stay inside their root
pub fn is_safe_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::scanner::Scanner;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn scan(root: &Path) -> Vec<ScannedFile> {
        Scanner::new(root, &ScanConfig::default())
            .unwrap()
            .scan_parallel(&CancelToken::new())
            .unwrap()
            .files
    }

    fn source() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("sub")).unwrap();
        fs::write(temp_dir.path().join("b.txt"), b"bravo").unwrap();
        fs::write(temp_dir.path().join("a.txt"), b"alpha").unwrap();
        fs::write(temp_dir.path().join("sub/c.txt"), b"charlie").unwrap();
        temp_dir
    }

    #[test]
    fn test_pack_then_unpack_reproduces_files() -> Result<()> {
        let src = source();
        let files = scan(src.path());
        let refs: Vec<&ScannedFile> = files.iter().collect();

        let packed = Archiver::new(6).pack(&refs, &CancelToken::new())?;
        assert_eq!(packed.file_count, 3);
        assert!(packed.skipped.is_empty());
        assert_eq!(packed.content_hash, ContentHash::from_bytes(&packed.bytes));

        let dest = TempDir::new()?;
        let written = unpack(&packed.bytes, dest.path(), &CancelToken::new())?;
        assert_eq!(
            written,
            vec![
                PathBuf::from("a.txt"),
                PathBuf::from("b.txt"),
                PathBuf::from("sub/c.txt"),
            ]
        );
        assert_eq!(fs::read(dest.path().join("sub/c.txt"))?, b"charlie");
        Ok(())
    }

    #[test]
    fn test_pack_is_deterministic() -> Result<()> {
        let src = source();
        let files = scan(src.path());
        let forward: Vec<&ScannedFile> = files.iter().collect();
        let reversed: Vec<&ScannedFile> = files.iter().rev().collect();

        let archiver = Archiver::new(9);
        let first = archiver.pack(&forward, &CancelToken::new())?;
        let second = archiver.pack(&reversed, &CancelToken::new())?;
        assert_eq!(first.bytes, second.bytes);
        Ok(())
    }

    #[test]
    fn test_file_changed_after_scan_is_skipped() -> Result<()> {
        let src = source();
        let files = scan(src.path());
        fs::write(src.path().join("a.txt"), b"ALPHA")?;
        fs::remove_file(src.path().join("sub/c.txt"))?;

        let refs: Vec<&ScannedFile> = files.iter().collect();
        let packed = Archiver::new(6).pack(&refs, &CancelToken::new())?;

        assert_eq!(packed.file_count, 1);
        let skipped: Vec<PathBuf> = packed.skipped.iter().map(|w| w.path.clone()).collect();
        assert_eq!(
            skipped,
            vec![src.path().join("a.txt"), src.path().join("sub/c.txt")]
        );
        assert!(packed.skipped[0].reason.contains("changed"));

        let dest = TempDir::new()?;
        let written = unpack(&packed.bytes, dest.path(), &CancelToken::new())?;
        assert_eq!(written, vec![PathBuf::from("b.txt")]);
        assert_eq!(fs::read(dest.path().join("b.txt"))?, b"bravo");
        Ok(())
    }

    #[test]
    fn test_appended_bytes_after_scan_are_ignored() -> Result<()> {
        let src = source();
        let files = scan(src.path());
        let mut log = fs::OpenOptions::new()
            .append(true)
            .open(src.path().join("b.txt"))?;
        std::io::Write::write_all(&mut log, b" and more")?;

        let refs: Vec<&ScannedFile> = files.iter().collect();
        let packed = Archiver::new(6).pack(&refs, &CancelToken::new())?;
        assert!(packed.skipped.is_empty());

        let dest = TempDir::new()?;
        unpack(&packed.bytes, dest.path(), &CancelToken::new())?;
        assert_eq!(fs::read(dest.path().join("b.txt"))?, b"bravo");
        Ok(())
    }

    #[test]
    fn test_unpack_rejects_parent_components() -> Result<()> {
        let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = Header::new_gnu();
        header.set_size(4);
        header.set_entry_type(EntryType::Regular);
        // set_path refuses `..`, so write the raw name bytes.
        let name = b"../escape.txt";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, &b"evil"[..])?;
        let bytes = builder.into_inner()?.finish()?;

        let dest = TempDir::new()?;
        let result = unpack(&bytes, &dest.path().join("inner"), &CancelToken::new());
        assert!(matches!(result, Err(Error::UnsafeArchivePath { .. })));
        assert!(!dest.path().join("escape.txt").exists());
        Ok(())
    }

    #[test]
    fn test_is_safe_relative() {
        assert!(is_safe_relative(Path::new("a/b/c.txt")));
        assert!(!is_safe_relative(Path::new("/etc/passwd")));
        assert!(!is_safe_relative(Path::new("a/../../b")));
        assert!(!is_safe_relative(Path::new("")));
    }
}
