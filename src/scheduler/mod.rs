//! Timer-driven backup scheduling.
//!
//! Each configured schedule gets its own tokio task that ticks on a fixed
//! interval and calls the engine through the same API interactive callers
//! use, on the blocking pool. A tick that finds its application busy is
//! skipped, never queued.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::ScheduleConfig;
use crate::engine::Engine;
use crate::models::BackupId;
use crate::Error;

/// What one scheduled tick did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum TickOutcome {
    Completed {
        backup_id: BackupId,
        warnings: usize,
        deleted: Vec<BackupId>,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error: String,
    },
}

/// Runs configured schedules against a shared engine
pub struct BackupScheduler {
    engine: Arc<Engine>,
    schedules: Vec<ScheduleConfig>,
}

impl BackupScheduler {
    pub fn new(engine: Arc<Engine>, schedules: Vec<ScheduleConfig>) -> Self {
        Self { engine, schedules }
    }

    /// Scheduler for the schedules declared in the engine's configuration
    pub fn from_config(engine: Arc<Engine>) -> Self {
        let schedules = engine.config().schedules.clone();
        Self::new(engine, schedules)
    }

    pub fn schedules(&self) -> &[ScheduleConfig] {
        &self.schedules
    }

    /// Spawn one task per schedule; the first tick fires one interval from now
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.schedules.len());

        for schedule in self.schedules {
            let period = Duration::from_secs(schedule.interval_minutes.max(1) * 60);
            let engine = Arc::clone(&self.engine);
            let mut shutdown = shutdown_rx.clone();

            info!(
                "Scheduling {} backups of '{}' every {} minutes",
                schedule.backup_type, schedule.app, schedule.interval_minutes
            );

            tasks.push(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            run_once(Arc::clone(&engine), schedule.clone()).await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        SchedulerHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Running scheduler tasks
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop ticking and wait for in-flight ticks to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Scheduler task ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

/// Run a schedule's work once: a backup, then retention when configured
pub async fn run_once(engine: Arc<Engine>, schedule: ScheduleConfig) -> TickOutcome {
    let app = schedule.app.clone();
    let backup_type = schedule.backup_type;

    let job_engine = Arc::clone(&engine);
    let job_app = app.clone();
    let backup = tokio::task::spawn_blocking(move || job_engine.create_backup(&job_app, backup_type)).await;

    let outcome = match backup {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(Error::BackupInProgress { .. })) => {
            warn!("Skipping scheduled backup of '{}': a job is already running", app);
            return TickOutcome::Skipped {
                reason: format!("backup already in progress for '{}'", app),
            };
        }
        Ok(Err(e)) => {
            error!("Scheduled backup of '{}' failed: {}", app, e);
            return TickOutcome::Failed {
                error: e.to_string(),
            };
        }
        Err(e) => {
            error!("Scheduled backup task for '{}' panicked: {}", app, e);
            return TickOutcome::Failed {
                error: e.to_string(),
            };
        }
    };

    let mut deleted = Vec::new();
    if schedule.apply_retention {
        let sweep_app = app.clone();
        match tokio::task::spawn_blocking(move || engine.apply_retention(&sweep_app)).await {
            Ok(Ok(ids)) => deleted = ids,
            Ok(Err(e)) => warn!("Scheduled retention for '{}' failed: {}", app, e),
            Err(e) => error!("Scheduled retention task for '{}' panicked: {}", app, e),
        }
    }

    info!(
        "Scheduled backup of '{}' completed: {} ({} retention deletions)",
        app,
        outcome.record.id,
        deleted.len()
    );
    TickOutcome::Completed {
        backup_id: outcome.record.id,
        warnings: outcome.warnings.len(),
        deleted,
    }
}
