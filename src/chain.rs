//! Backup chain resolution
//!
//! A chain is the ascending sequence of backups needed to rebuild the state
//! captured by its last member: a full backup alone, a full followed by every
//! incremental up to the target, or a full and one differential.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::debug;

use crate::catalog::Catalog;
use crate::change::{Baseline, BaselineEntry};
use crate::models::{BackupId, BackupRecord, BackupType, ChangeKind, FileManifestEntry};
use crate::{Error, Result};

/// Path-to-entry view of a tree after replaying a chain
pub type FileView = BTreeMap<PathBuf, FileManifestEntry>;

/// Walk parent links from `target` back to a full backup.
///
/// `lookup` returns `Ok(None)` for a record that does not exist. The result
/// is in ascending creation order and ends with `target`.
pub fn walk_chain<F>(target: &BackupRecord, mut lookup: F) -> Result<Vec<BackupRecord>>
where
    F: FnMut(&BackupId) -> Result<Option<BackupRecord>>,
{
    let mut chain = vec![target.clone()];
    let mut visited = HashSet::from([target.id]);
    let mut current = target.clone();

    while !current.is_full() {
        let parent_id = current.parent_backup_id.ok_or_else(|| Error::ChainBroken {
            link: current.id,
            reason: format!("{} backup has no parent", current.backup_type),
        })?;

        if !visited.insert(parent_id) {
            return Err(Error::ChainBroken {
                link: parent_id,
                reason: "parent links form a cycle".to_string(),
            });
        }

        let parent = lookup(&parent_id)?.ok_or_else(|| Error::ChainBroken {
            link: parent_id,
            reason: format!("record missing (parent of {})", current.id),
        })?;

        if current.backup_type == BackupType::Differential && !parent.is_full() {
            return Err(Error::ChainBroken {
                link: parent.id,
                reason: format!("parent of differential {} is not a full backup", current.id),
            });
        }
        if parent.app_name != target.app_name {
            return Err(Error::ChainBroken {
                link: parent.id,
                reason: format!("parent belongs to application '{}'", parent.app_name),
            });
        }

        chain.push(parent.clone());
        current = parent;
    }

    chain.reverse();
    Ok(chain)
}

/// Replay manifests in chain order into the resulting file view
pub fn replay_manifests<'a, I>(manifests: I) -> FileView
where
    I: IntoIterator<Item = &'a [FileManifestEntry]>,
{
    let mut view = FileView::new();
    for entries in manifests {
        for entry in entries {
            match entry.change {
                ChangeKind::Added | ChangeKind::Modified => {
                    view.insert(entry.path.clone(), entry.clone());
                }
                ChangeKind::Deleted => {
                    view.remove(&entry.path);
                }
            }
        }
    }
    view
}

/// Resolves chains against the catalog
pub struct ChainResolver<'a> {
    catalog: &'a Catalog,
}

impl<'a> ChainResolver<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Ordered chain ending at `target`
    pub fn resolve(&self, target: &BackupRecord) -> Result<Vec<BackupRecord>> {
        let chain = walk_chain(target, |id| match self.catalog.backup(id) {
            Ok(record) => Ok(Some(record)),
            Err(Error::BackupNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        })?;
        debug!(
            "Resolved chain for {}: {}",
            target.id,
            chain
                .iter()
                .map(|r| r.id.to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Ok(chain)
    }

    /// Manifests of every chain member, in chain order
    pub fn manifests(&self, chain: &[BackupRecord]) -> Result<Vec<Vec<FileManifestEntry>>> {
        chain
            .iter()
            .map(|record| {
                self.catalog.manifest(&record.id).map_err(|e| match e {
                    Error::BackupNotFound { id } => Error::ChainBroken {
                        link: id,
                        reason: "manifest missing".to_string(),
                    },
                    other => other,
                })
            })
            .collect()
    }

    /// Files present after replaying the chain ending at `target`
    pub fn file_view(&self, target: &BackupRecord) -> Result<FileView> {
        let chain = self.resolve(target)?;
        let manifests = self.manifests(&chain)?;
        Ok(replay_manifests(manifests.iter().map(Vec::as_slice)))
    }

    /// Baseline for change detection as of `target`
    pub fn baseline(&self, target: &BackupRecord) -> Result<Baseline> {
        Ok(self
            .file_view(target)?
            .into_iter()
            .map(|(path, entry)| {
                let known = BaselineEntry::from(&entry);
                (path, known)
            })
            .collect())
    }

    /// Parent a new backup of `backup_type` should link to, if any.
    ///
    /// Incrementals follow the most recent backup of any type; differentials
    /// follow the most recent full backup. Full backups have no parent.
    pub fn select_parent(
        &self,
        app_name: &str,
        backup_type: BackupType,
    ) -> Result<Option<BackupRecord>> {
        let mut backups = self.catalog.backups_for(app_name)?.into_iter();
        Ok(match backup_type {
            BackupType::Full => None,
            BackupType::Incremental => backups.next(),
            BackupType::Differential => backups.find(BackupRecord::is_full),
        })
    }
}
