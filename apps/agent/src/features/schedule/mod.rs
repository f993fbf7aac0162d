use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule as CronSchedule;
use keldris_types::{BackupOptions, Checkpoint, Schedule};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::error::{CoreError, Result};
use crate::core::store::Store;
use crate::features::backup::WorkloadBackup;
use crate::features::shutdown::{AdmissionGate, BackupResumer};

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Fire-and-forget handoff from a schedule row to a backup run.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn launch(&self, schedule: &Schedule) -> Result<()>;
}

/// The production launcher: translates the schedule row into backup options
/// and runs the workload pipeline.
pub struct BackupLauncher {
    backup: Arc<WorkloadBackup>,
}

impl BackupLauncher {
    pub fn new(backup: Arc<WorkloadBackup>) -> Self {
        Self { backup }
    }
}

#[async_trait]
impl JobLauncher for BackupLauncher {
    async fn launch(&self, schedule: &Schedule) -> Result<()> {
        let opts = BackupOptions {
            composition_path: schedule.composition_path.clone(),
            backup_root_dir: schedule.backup_root_dir.clone(),
            stack_name: schedule.stack_name.clone(),
            export_images: schedule.export_images,
            include_env_files: schedule.include_env_files,
            stop_containers: schedule.stop_containers,
            exclude_paths: schedule.exclude_paths.clone(),
        };
        // Each fire gets its own background context.
        let cancel = CancellationToken::new();
        self.backup
            .run(&opts, &[], Some(schedule.id), &cancel)
            .await
            .map(|_| ())
    }
}

struct EntryHandle {
    cron_expression: String,
    task: tokio::task::JoinHandle<()>,
}

/// Cron-with-seconds trigger holding one timer task per enabled schedule.
/// `reload` reconciles the entry map against the store; a background loop
/// refreshes it periodically.
pub struct ScheduleTrigger {
    store: Arc<dyn Store>,
    gate: AdmissionGate,
    launcher: Arc<dyn JobLauncher>,
    entries: tokio::sync::Mutex<HashMap<Uuid, EntryHandle>>,
    refresh_interval: Duration,
}

impl ScheduleTrigger {
    pub fn new(
        store: Arc<dyn Store>,
        gate: AdmissionGate,
        launcher: Arc<dyn JobLauncher>,
    ) -> Self {
        Self {
            store,
            gate,
            launcher,
            entries: tokio::sync::Mutex::new(HashMap::new()),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Reconcile timers against the enabled schedule rows: add missing,
    /// drop orphaned, restart changed, leave the rest alone.
    pub async fn reload(&self) -> Result<()> {
        let schedules = self.store.get_enabled_schedules().await?;
        let mut entries = self.entries.lock().await;

        let wanted: HashMap<Uuid, &Schedule> =
            schedules.iter().map(|s| (s.id, s)).collect();
        entries.retain(|id, entry| {
            let keep = wanted
                .get(id)
                .is_some_and(|s| s.cron_expression == entry.cron_expression);
            if !keep {
                debug!(schedule_id = %id, "removing schedule timer");
                entry.task.abort();
            }
            keep
        });

        for schedule in &schedules {
            if entries.contains_key(&schedule.id) {
                continue;
            }
            let cron = match CronSchedule::from_str(&schedule.cron_expression) {
                Ok(cron) => cron,
                Err(err) => {
                    warn!(
                        schedule_id = %schedule.id,
                        expression = %schedule.cron_expression,
                        error = %err,
                        "invalid cron expression, skipping schedule"
                    );
                    continue;
                }
            };
            info!(
                schedule_id = %schedule.id,
                name = %schedule.name,
                expression = %schedule.cron_expression,
                "schedule timer added"
            );
            let task = tokio::spawn(Self::run_entry(
                cron,
                schedule.clone(),
                self.gate.clone(),
                self.launcher.clone(),
            ));
            entries.insert(
                schedule.id,
                EntryHandle {
                    cron_expression: schedule.cron_expression.clone(),
                    task,
                },
            );
        }
        Ok(())
    }

    async fn run_entry(
        cron: CronSchedule,
        schedule: Schedule,
        gate: AdmissionGate,
        launcher: Arc<dyn JobLauncher>,
    ) {
        loop {
            let Some(next) = cron.upcoming(Utc).next() else {
                warn!(schedule_id = %schedule.id, "cron expression yields no future fire times");
                return;
            };
            let wait = (next - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_millis(10));
            tokio::time::sleep(wait).await;

            if !gate.is_accepting() {
                warn!(schedule_id = %schedule.id, "shutdown in progress, skipping fire");
                metrics::counter!("agent_schedule_skipped", 1);
                continue;
            }
            metrics::counter!("agent_schedule_fired", 1);
            info!(schedule_id = %schedule.id, name = %schedule.name, "schedule fired");
            let launcher = launcher.clone();
            let schedule = schedule.clone();
            tokio::spawn(async move {
                if let Err(err) = launcher.launch(&schedule).await {
                    error!(schedule_id = %schedule.id, error = %err, "scheduled backup failed");
                }
            });
        }
    }

    /// Background reconcile loop; reload failures are logged and retried on
    /// the next tick.
    pub fn spawn_refresh(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.reload().await {
                    error!(error = ?err, "schedule reload failed");
                }
            }
        })
    }

    pub async fn stop(&self) {
        let mut entries = self.entries.lock().await;
        for (_, entry) in entries.drain() {
            entry.task.abort();
        }
    }
}

/// Resumes a checkpointed backup by re-firing its schedule.
pub struct ScheduleBackupResumer {
    store: Arc<dyn Store>,
    launcher: Arc<dyn JobLauncher>,
}

impl ScheduleBackupResumer {
    pub fn new(store: Arc<dyn Store>, launcher: Arc<dyn JobLauncher>) -> Self {
        Self { store, launcher }
    }
}

#[async_trait]
impl BackupResumer for ScheduleBackupResumer {
    async fn resume(&self, checkpoint: &Checkpoint, _cancel: &CancellationToken) -> Result<()> {
        let Some(schedule_id) = checkpoint.schedule_id else {
            return Err(CoreError::NotFound {
                entity: "schedule",
                name: format!("for checkpoint {}", checkpoint.id),
            });
        };
        let schedule = self
            .store
            .get_schedule(schedule_id)
            .await?
            .ok_or(CoreError::NotFound {
                entity: "schedule",
                name: schedule_id.to_string(),
            })?;
        info!(
            checkpoint_id = %checkpoint.id,
            schedule_id = %schedule_id,
            resume_count = checkpoint.resume_count,
            "resuming checkpointed backup"
        );
        self.launcher.launch(&schedule).await
    }
}
