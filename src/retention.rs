//! Dependency-aware retention planning
//!
//! Candidates are the union of backups past the age limit and backups ranked
//! beyond the count limit. A candidate that some retained backup still needs
//! to restore is deferred, and the rest are evicted newest first so that every
//! dependent goes before the backup it builds on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::info;

use crate::models::{BackupId, BackupRecord, RetentionPolicy};

/// Why a backup became a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionReason {
    Age,
    Count,
    Both,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionReason::Age => write!(f, "older than max age"),
            EvictionReason::Count => write!(f, "exceeds max count"),
            EvictionReason::Both => write!(f, "older than max age and exceeds max count"),
        }
    }
}

/// A backup selected for deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eviction {
    pub id: BackupId,
    pub reason: EvictionReason,
}

/// A candidate kept because a retained backup's chain runs through it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deferral {
    pub id: BackupId,
    pub reason: EvictionReason,
    /// A retained backup that depends on `id`
    pub needed_by: BackupId,
}

/// Result of planning one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPlan {
    /// Deletion order: dependents before their ancestors
    pub evict: Vec<Eviction>,
    pub deferred: Vec<Deferral>,
}

impl RetentionPlan {
    pub fn evicted_ids(&self) -> Vec<BackupId> {
        self.evict.iter().map(|e| e.id).collect()
    }
}

/// Summary of where an application stands against its policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionStatus {
    pub app_name: String,
    pub policy: RetentionPolicy,
    pub total_backups: usize,
    pub exceeding_age: usize,
    pub exceeding_count: usize,
    /// Candidates held back by dependents
    pub protected: Vec<BackupId>,
    /// Candidates that the next sweep would delete
    pub evictable: Vec<BackupId>,
    pub total_size: u64,
}

/// Plan a sweep over one application's backups.
///
/// `backups` may be in any order. Parent links that point outside the slice
/// are ignored.
pub fn plan(backups: &[BackupRecord], policy: &RetentionPolicy, now: DateTime<Utc>) -> RetentionPlan {
    let mut ordered: Vec<&BackupRecord> = backups.iter().collect();
    ordered.sort_by(|a, b| b.order_key().cmp(&a.order_key()));

    let cutoff = policy.max_age().map(|age| now - age);
    let mut reasons: HashMap<BackupId, EvictionReason> = HashMap::new();
    for (rank, record) in ordered.iter().enumerate() {
        let too_old = cutoff.map_or(false, |cutoff| record.created_at < cutoff);
        let too_many = policy.max_count.map_or(false, |max| rank >= max);
        let reason = match (too_old, too_many) {
            (true, true) => EvictionReason::Both,
            (true, false) => EvictionReason::Age,
            (false, true) => EvictionReason::Count,
            (false, false) => continue,
        };
        reasons.insert(record.id, reason);
    }

    let by_id: HashMap<BackupId, &BackupRecord> = ordered.iter().map(|r| (r.id, *r)).collect();

    // Each ancestor of a retained backup, mapped to one retained dependent.
    let mut needed_by: HashMap<BackupId, BackupId> = HashMap::new();
    for record in ordered.iter().filter(|r| !reasons.contains_key(&r.id)) {
        let mut visited = HashSet::new();
        let mut parent = record.parent_backup_id;
        while let Some(parent_id) = parent {
            if !visited.insert(parent_id) {
                break;
            }
            needed_by.entry(parent_id).or_insert(record.id);
            parent = by_id.get(&parent_id).and_then(|p| p.parent_backup_id);
        }
    }

    let mut result = RetentionPlan::default();
    for record in &ordered {
        let Some(&reason) = reasons.get(&record.id) else {
            continue;
        };
        match needed_by.get(&record.id) {
            Some(&dependent) => {
                info!(
                    "Deferring deletion of {} ({}): still needed by {}",
                    record.id, reason, dependent
                );
                result.deferred.push(Deferral {
                    id: record.id,
                    reason,
                    needed_by: dependent,
                });
            }
            None => result.evict.push(Eviction {
                id: record.id,
                reason,
            }),
        }
    }
    result
}

/// Report how `backups` stand against `policy` without changing anything
pub fn status(
    app_name: &str,
    backups: &[BackupRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> RetentionStatus {
    let cutoff = policy.max_age().map(|age| now - age);
    let plan = plan(backups, policy, now);

    RetentionStatus {
        app_name: app_name.to_string(),
        policy: *policy,
        total_backups: backups.len(),
        exceeding_age: backups
            .iter()
            .filter(|r| cutoff.map_or(false, |cutoff| r.created_at < cutoff))
            .count(),
        exceeding_count: policy
            .max_count
            .map_or(0, |max| backups.len().saturating_sub(max)),
        protected: plan.deferred.iter().map(|d| d.id).collect(),
        evictable: plan.evicted_ids(),
        total_size: backups.iter().map(|r| r.size).sum(),
    }
}
