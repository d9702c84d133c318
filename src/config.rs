//! Engine configuration loaded from TOML and validated at load time

use crate::models::{Application, BackupType, RetentionPolicy};
use crate::{Error, Result};
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Holds the catalog, archives and scratch space
    pub root: PathBuf,
    /// Where restore staging and verification sandboxes are created
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// Master key artifact; relative paths resolve against the storage root
    pub key_file: PathBuf,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_file: PathBuf::from("master.key"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Glob patterns matched against paths relative to the source root
    pub exclude: Vec<String>,
    pub follow_symlinks: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude: vec![
                "**/*.tmp".to_string(),
                "**/.git/**".to_string(),
                "**/.DS_Store".to_string(),
                "**/Thumbs.db".to_string(),
            ],
            follow_symlinks: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Gzip level, 0..=9
    pub compression_level: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: 6,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Paths (relative to the source root) that a verified backup must contain
    pub key_files: Vec<PathBuf>,
    /// Refuse to restore through links that were never verified
    pub require_verified_chain: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    pub source: PathBuf,
    #[serde(default = "default_true")]
    pub active: bool,
    pub retention: Option<RetentionPolicy>,
}

impl ApplicationConfig {
    /// Application record for this entry, falling back to the global policy
    pub fn to_application(&self, default_retention: RetentionPolicy) -> Application {
        let mut app = Application::new(&self.name, &self.source)
            .with_retention(self.retention.unwrap_or(default_retention));
        app.active = self.active;
        app
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub app: String,
    pub backup_type: BackupType,
    pub interval_minutes: u64,
    #[serde(default)]
    pub apply_retention: bool,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Configuration rooted at `root` with defaults everywhere else
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            storage: StorageConfig {
                root: root.as_ref().to_path_buf(),
                scratch_dir: None,
            },
            encryption: EncryptionConfig::default(),
            scan: ScanConfig::default(),
            archive: ArchiveConfig::default(),
            verification: VerificationConfig::default(),
            retention: RetentionPolicy::default(),
            applications: Vec::new(),
            schedules: Vec::new(),
        }
    }

    /// Load and validate a config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| Error::Configuration {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config from the default location, writing defaults if missing
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            return Self::load(&path);
        }

        debug!("Config file not found, creating default at {}", path.display());
        let data_dir = dirs::data_dir().ok_or_else(|| Error::Configuration {
            reason: "could not determine data directory".to_string(),
        })?;
        let config = Self::with_root(data_dir.join("chainvault"));
        config.save(&path)?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| Error::Configuration {
            reason: "could not determine config directory".to_string(),
        })?;
        Ok(config_dir.join("chainvault").join("config.toml"))
    }

    /// Check field ranges and cross-references
    pub fn validate(&self) -> Result<()> {
        if self.storage.root.as_os_str().is_empty() {
            return Err(config_error("storage.root must not be empty"));
        }

        if self.archive.compression_level > 9 {
            return Err(config_error(format!(
                "archive.compression_level must be 0..=9, got {}",
                self.archive.compression_level
            )));
        }

        for pattern in &self.scan.exclude {
            Glob::new(pattern).map_err(|e| {
                config_error(format!("invalid exclude pattern '{}': {}", pattern, e))
            })?;
        }

        validate_policy("retention", &self.retention)?;

        let mut names = HashSet::new();
        for app in &self.applications {
            if app.name.trim().is_empty() {
                return Err(config_error("application name must not be empty"));
            }
            if !names.insert(app.name.as_str()) {
                return Err(config_error(format!("duplicate application '{}'", app.name)));
            }
            if let Some(policy) = &app.retention {
                validate_policy(&format!("applications.{}.retention", app.name), policy)?;
            }
            if !app.source.is_absolute() {
                warn!("Application '{}' source is not absolute: {}", app.name, app.source.display());
            }
        }

        for schedule in &self.schedules {
            if !names.contains(schedule.app.as_str()) {
                return Err(config_error(format!(
                    "schedule references unknown application '{}'",
                    schedule.app
                )));
            }
            if schedule.interval_minutes == 0 {
                return Err(config_error(format!(
                    "schedule for '{}' must have interval_minutes > 0",
                    schedule.app
                )));
            }
        }

        Ok(())
    }

    pub fn key_file_path(&self) -> PathBuf {
        if self.encryption.key_file.is_absolute() {
            self.encryption.key_file.clone()
        } else {
            self.storage.root.join(&self.encryption.key_file)
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.storage
            .scratch_dir
            .clone()
            .unwrap_or_else(|| self.storage.root.join("scratch"))
    }
}

fn validate_policy(field: &str, policy: &RetentionPolicy) -> Result<()> {
    if policy.max_count == Some(0) {
        return Err(config_error(format!("{}.max_count must be at least 1", field)));
    }
    Ok(())
}

fn config_error(reason: impl Into<String>) -> Error {
    Error::Configuration {
        reason: reason.into(),
    }
}
