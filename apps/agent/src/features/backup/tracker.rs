use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keldris_types::{BackupJob, Checkpoint, JobState, JobStats};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::error::{CoreError, Result};
use crate::core::store::Store;

/// Shared progress counters a running pipeline bumps as it goes; checkpoints
/// snapshot them.
#[derive(Clone, Default)]
pub struct ProgressCounters {
    files: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
}

impl ProgressCounters {
    pub fn record(&self, files: u64, bytes: u64) {
        self.files.fetch_add(files, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.files.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}

struct RunningBackup {
    job: BackupJob,
    cancel: CancellationToken,
    progress: ProgressCounters,
}

/// In-memory registry of running backups, with store write-through on every
/// job state transition. Lives only as long as the process.
pub struct BackupTracker {
    store: Arc<dyn Store>,
    agent_id: Uuid,
    running: RwLock<HashMap<Uuid, RunningBackup>>,
}

impl BackupTracker {
    pub fn new(store: Arc<dyn Store>, agent_id: Uuid) -> Self {
        Self {
            store,
            agent_id,
            running: RwLock::new(HashMap::new()),
        }
    }

    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    /// Create the job row and register the run. The returned token is a child
    /// of `parent`, so both external cancellation and a forced checkpoint
    /// reach the pipeline.
    pub async fn register(
        &self,
        schedule_id: Option<Uuid>,
        parent: &CancellationToken,
    ) -> Result<(BackupJob, CancellationToken, ProgressCounters)> {
        let mut job = BackupJob::new(schedule_id);
        job.state = JobState::Running;
        job.started_at = Some(chrono::Utc::now());
        self.store.create_backup_job(&job).await?;

        let cancel = parent.child_token();
        let progress = ProgressCounters::default();
        self.running.write().await.insert(
            job.id,
            RunningBackup {
                job: job.clone(),
                cancel: cancel.clone(),
                progress: progress.clone(),
            },
        );
        Ok((job, cancel, progress))
    }

    pub async fn running_ids(&self) -> Vec<Uuid> {
        self.running.read().await.keys().copied().collect()
    }

    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    pub async fn complete(&self, job_id: Uuid, stats: JobStats) -> Result<BackupJob> {
        self.finish(job_id, JobState::Completed, None, Some(stats))
            .await
    }

    pub async fn fail(&self, job_id: Uuid, error: &CoreError) -> Result<BackupJob> {
        self.finish(job_id, JobState::Failed, Some(error.to_string()), None)
            .await
    }

    async fn finish(
        &self,
        job_id: Uuid,
        state: JobState,
        error: Option<String>,
        stats: Option<JobStats>,
    ) -> Result<BackupJob> {
        let mut running = self.running.write().await;
        let Some(entry) = running.remove(&job_id) else {
            return Err(CoreError::store(format!("job {job_id} is not running")));
        };
        let mut job = entry.job;
        job.state = state;
        job.completed_at = Some(chrono::Utc::now());
        job.error = error;
        if let Some(stats) = stats {
            job.stats = stats;
        }
        drop(running);
        self.store.update_backup_job(&job).await?;
        Ok(job)
    }

    /// Force a still-running job to checkpoint: persist a marker with the
    /// current progress, flip the job row, and cancel the run.
    pub async fn checkpoint_backup(&self, job_id: Uuid) -> Result<Checkpoint> {
        let mut running = self.running.write().await;
        let Some(entry) = running.remove(&job_id) else {
            return Err(CoreError::store(format!("job {job_id} is not running")));
        };
        let (files_processed, bytes_processed) = entry.progress.snapshot();
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            backup_id: job_id,
            schedule_id: entry.job.schedule_id,
            agent_id: self.agent_id,
            files_processed,
            bytes_processed,
            last_updated_at: chrono::Utc::now(),
            error_message: None,
            resume_count: 0,
        };
        let mut job = entry.job.clone();
        drop(running);

        self.store.create_checkpoint(&checkpoint).await?;
        job.state = JobState::Checkpointed;
        job.completed_at = Some(chrono::Utc::now());
        if let Err(err) = self.store.update_backup_job(&job).await {
            warn!(job_id = %job_id, error = %err, "failed to persist checkpointed job state");
        }
        entry.cancel.cancel();
        info!(job_id = %job_id, checkpoint_id = %checkpoint.id, "backup checkpointed");
        Ok(checkpoint)
    }
}
