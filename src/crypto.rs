//! Authenticated encryption of archives with the installation master key
//!
//! Sealed blobs are laid out as `magic | version | nonce | ciphertext+tag`.
//! The header is bound to the ciphertext as associated data, so any change
//! to any byte fails authentication.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::models::BackupId;
use crate::{Error, Result};

const MAGIC: &[u8; 4] = b"CVLT";
const FORMAT_VERSION: u8 = 1;
const NONCE_SIZE: usize = 12;
const HEADER_SIZE: usize = MAGIC.len() + 1 + NONCE_SIZE;
const KEY_SIZE: usize = 32;

/// 256-bit master key, zeroed on drop
pub struct MasterKey {
    bytes: Zeroizing<[u8; KEY_SIZE]>,
}

impl MasterKey {
    pub fn generate() -> Self {
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        bytes.copy_from_slice(key.as_slice());
        Self { bytes }
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() != KEY_SIZE {
            return None;
        }
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        bytes.copy_from_slice(raw);
        Some(Self { bytes })
    }

    /// Load the key artifact at `path`, creating it on first use.
    ///
    /// A new key is written to a 0600 temporary file and linked into place
    /// without replacing an existing file. When another process wins the race,
    /// its key is loaded instead.
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let key = Self::load(path)?;
            info!("Master key loaded from {}", path.display());
            return Ok(key);
        }

        let key = Self::generate();
        if key.save_new(path)? {
            info!("New master key generated at {}", path.display());
            Ok(key)
        } else {
            debug!("Master key at {} was created concurrently, loading it", path.display());
            Self::load(path)
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = Zeroizing::new(fs::read_to_string(path).map_err(|e| key_error(path, e))?);
        let raw = Zeroizing::new(hex::decode(content.trim()).map_err(|e| key_error(path, e))?);
        Self::from_bytes(&raw).ok_or_else(|| {
            key_error(path, format!("expected {} key bytes, found {}", KEY_SIZE, raw.len()))
        })
    }

    /// Write the key to `path` unless a file is already there; false if one was
    fn save_new(&self, path: &Path) -> Result<bool> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| key_error(path, e))?;

        // Temporary files are created with mode 0600 on Unix.
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| key_error(path, e))?;
        let encoded = Zeroizing::new(hex::encode(self.bytes.as_slice()));
        tmp.write_all(encoded.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| key_error(path, e))?;

        match tmp.persist_noclobber(path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(key_error(path, e.error)),
        }
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

fn key_error(path: &Path, reason: impl ToString) -> Error {
    Error::KeyFile {
        path: PathBuf::from(path),
        reason: reason.to_string(),
    }
}

/// Seals and opens archive blobs
pub struct CryptoSealer {
    cipher: ChaCha20Poly1305,
}

impl CryptoSealer {
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key.bytes.as_slice())),
        }
    }

    /// Encrypt `plaintext` under a fresh random nonce
    pub fn seal(&self, backup_id: &BackupId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

        let mut sealed = Vec::with_capacity(HEADER_SIZE + plaintext.len() + 16);
        sealed.extend_from_slice(MAGIC);
        sealed.push(FORMAT_VERSION);
        sealed.extend_from_slice(nonce.as_slice());

        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &sealed[..HEADER_SIZE],
                },
            )
            .map_err(|_| Error::IntegrityError {
                backup_id: *backup_id,
                reason: "encryption failed".to_string(),
            })?;

        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a sealed blob. Fails closed: no plaintext on any mismatch.
    pub fn open(&self, backup_id: &BackupId, sealed: &[u8]) -> Result<Vec<u8>> {
        let integrity = |reason: &str| Error::IntegrityError {
            backup_id: *backup_id,
            reason: reason.to_string(),
        };

        if sealed.len() < HEADER_SIZE {
            return Err(integrity("sealed archive is truncated"));
        }
        if &sealed[..MAGIC.len()] != MAGIC {
            return Err(integrity("not a sealed archive"));
        }
        if sealed[MAGIC.len()] != FORMAT_VERSION {
            return Err(integrity("unsupported sealed archive version"));
        }

        let header = &sealed[..HEADER_SIZE];
        let nonce = Nonce::from_slice(&header[MAGIC.len() + 1..]);

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed[HEADER_SIZE..],
                    aad: header,
                },
            )
            .map_err(|_| integrity("authentication tag mismatch"))
    }
}
