use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keldris_types::{Checkpoint, ShutdownOptions, StartupOptions};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::error::{CoreError, Result};
use crate::core::store::Store;
use crate::features::backup::tracker::BackupTracker;

/// The accepting-jobs flag. Schedulers and the backup runner consult it
/// before starting work; the coordinator flips it the moment draining
/// begins.
#[derive(Clone)]
pub struct AdmissionGate {
    accepting: Arc<AtomicBool>,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self {
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Checkpointing,
    Complete,
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub timeout: Duration,
    pub drain_timeout: Duration,
    pub checkpoint_running_backups: bool,
}

impl From<&ShutdownOptions> for ShutdownConfig {
    fn from(opts: &ShutdownOptions) -> Self {
        Self {
            timeout: Duration::from_secs(opts.timeout_secs),
            drain_timeout: Duration::from_secs(opts.drain_timeout_secs),
            checkpoint_running_backups: opts.checkpoint_running_backups,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownStatus {
    pub state: ShutdownState,
    pub accepting_jobs: bool,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub time_remaining: Option<Duration>,
    pub checkpoints_taken: usize,
}

/// One-shot state machine `Running → Draining → Checkpointing → Complete`.
/// Drain waits for in-flight jobs; stragglers past the wait budget are
/// force-checkpointed, one task per backup.
pub struct ShutdownCoordinator {
    gate: AdmissionGate,
    tracker: Arc<BackupTracker>,
    config: ShutdownConfig,
    state: std::sync::Mutex<ShutdownState>,
    started: AtomicBool,
    started_at: std::sync::Mutex<Option<(chrono::DateTime<chrono::Utc>, tokio::time::Instant)>>,
    checkpoints_taken: AtomicUsize,
    done_tx: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new(tracker: Arc<BackupTracker>, config: ShutdownConfig) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            gate: AdmissionGate::new(),
            tracker,
            config,
            state: std::sync::Mutex::new(ShutdownState::Running),
            started: AtomicBool::new(false),
            started_at: std::sync::Mutex::new(None),
            checkpoints_taken: AtomicUsize::new(0),
            done_tx,
        }
    }

    pub fn gate(&self) -> AdmissionGate {
        self.gate.clone()
    }

    pub fn is_accepting_jobs(&self) -> bool {
        self.gate.is_accepting()
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.lock().unwrap()
    }

    /// Receiver that flips to `true` when the machine reaches Complete.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    pub async fn wait_done(&self) {
        let mut rx = self.done();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn status(&self) -> ShutdownStatus {
        let started = *self.started_at.lock().unwrap();
        let time_remaining = started.map(|(_, instant)| {
            self.config
                .timeout
                .saturating_sub(instant.elapsed())
        });
        ShutdownStatus {
            state: self.state(),
            accepting_jobs: self.gate.is_accepting(),
            started_at: started.map(|(at, _)| at),
            time_remaining,
            checkpoints_taken: self.checkpoints_taken.load(Ordering::SeqCst),
        }
    }

    fn set_state(&self, state: ShutdownState) {
        *self.state.lock().unwrap() = state;
    }

    fn complete(&self) {
        self.set_state(ShutdownState::Complete);
        let _ = self.done_tx.send(true);
        metrics::counter!("agent_shutdown_complete", 1);
        info!(
            checkpoints = self.checkpoints_taken.load(Ordering::SeqCst),
            "shutdown complete"
        );
    }

    /// Runs the drain/checkpoint sequence at most once; concurrent callers
    /// wait for the first run to finish.
    pub async fn shutdown(&self, parent: &CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            self.wait_done().await;
            return;
        }
        let start = tokio::time::Instant::now();
        *self.started_at.lock().unwrap() = Some((chrono::Utc::now(), start));
        self.set_state(ShutdownState::Draining);
        self.gate.close();
        metrics::counter!("agent_shutdown_started", 1);
        info!(
            timeout_secs = self.config.timeout.as_secs(),
            drain_secs = self.config.drain_timeout.as_secs(),
            "shutdown draining"
        );

        let drain = self.config.drain_timeout.min(self.config.timeout);
        tokio::select! {
            _ = tokio::time::sleep(drain) => {}
            _ = parent.cancelled() => {
                warn!("shutdown context cancelled during drain, forcing completion");
                self.complete();
                return;
            }
        }

        let remaining = self.config.timeout.saturating_sub(start.elapsed());
        let checkpoint_budget = checkpoint_budget(remaining);
        let wait_budget = remaining.saturating_sub(checkpoint_budget);
        let wait_deadline = tokio::time::Instant::now() + wait_budget;

        loop {
            if self.tracker.running_count().await == 0 {
                break;
            }
            if tokio::time::Instant::now() >= wait_deadline {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = parent.cancelled() => {
                    warn!("shutdown context cancelled while waiting, forcing completion");
                    self.complete();
                    return;
                }
            }
        }

        self.set_state(ShutdownState::Checkpointing);
        let stragglers = self.tracker.running_ids().await;
        if self.config.checkpoint_running_backups && !stragglers.is_empty() {
            info!(count = stragglers.len(), "checkpointing running backups");
            // In-flight checkpoints race only their own deadline; a parent
            // cancel does not interrupt them.
            let tasks: Vec<_> = stragglers
                .into_iter()
                .map(|id| {
                    let tracker = self.tracker.clone();
                    tokio::spawn(async move {
                        tokio::time::timeout(checkpoint_budget, tracker.checkpoint_backup(id)).await
                    })
                })
                .collect();
            for task in tasks {
                match task.await {
                    Ok(Ok(Ok(checkpoint))) => {
                        self.checkpoints_taken.fetch_add(1, Ordering::SeqCst);
                        metrics::counter!("agent_backup_checkpointed", 1);
                        info!(checkpoint_id = %checkpoint.id, "backup checkpointed during shutdown");
                    }
                    Ok(Ok(Err(err))) => warn!(error = %err, "checkpoint failed"),
                    Ok(Err(_elapsed)) => warn!("checkpoint timed out"),
                    Err(err) => warn!(error = %err, "checkpoint task panicked"),
                }
            }
        }

        self.complete();
    }
}

/// Reserve `clamp(20% of remaining, 1s, 30s)`, but never more than half the
/// remaining window, for the checkpoint phase.
fn checkpoint_budget(remaining: Duration) -> Duration {
    let fifth = remaining.mul_f64(0.2);
    let clamped = fifth.clamp(Duration::from_secs(1), Duration::from_secs(30));
    clamped.min(remaining / 2)
}

// ---------------------------------------------------------------------------
// Startup-time checkpoint resume
// ---------------------------------------------------------------------------

/// Re-runs the backup a checkpoint belongs to.
#[async_trait]
pub trait BackupResumer: Send + Sync {
    async fn resume(&self, checkpoint: &Checkpoint, cancel: &CancellationToken) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct StartupConfig {
    pub resume_checkpoints: bool,
    pub max_resumes_per_startup: usize,
    pub resume_delay: Duration,
}

impl From<&StartupOptions> for StartupConfig {
    fn from(opts: &StartupOptions) -> Self {
        Self {
            resume_checkpoints: opts.resume_checkpoints,
            max_resumes_per_startup: opts.max_resumes_per_startup,
            resume_delay: Duration::from_secs(opts.resume_delay_secs),
        }
    }
}

pub struct StartupService {
    store: Arc<dyn Store>,
    resumer: Arc<dyn BackupResumer>,
    agent_id: Uuid,
    config: StartupConfig,
}

impl StartupService {
    pub fn new(
        store: Arc<dyn Store>,
        resumer: Arc<dyn BackupResumer>,
        agent_id: Uuid,
        config: StartupConfig,
    ) -> Self {
        Self {
            store,
            resumer,
            agent_id,
            config,
        }
    }

    /// Resume the oldest active checkpoints, bounded per startup so the
    /// skipped remainder is stable across restarts. A resumed checkpoint is
    /// consumed; a failed resume stays for the next startup.
    pub async fn resume_checkpoints(&self, cancel: &CancellationToken) -> Result<usize> {
        if !self.config.resume_checkpoints {
            return Ok(0);
        }
        let mut checkpoints = self.store.get_active_checkpoints(self.agent_id).await?;
        checkpoints.sort_by_key(|c| c.last_updated_at);
        let total = checkpoints.len();
        let batch: Vec<Checkpoint> = checkpoints
            .into_iter()
            .take(self.config.max_resumes_per_startup)
            .collect();
        if total > batch.len() {
            info!(
                resuming = batch.len(),
                deferred = total - batch.len(),
                "more checkpoints than the per-startup cap, deferring the rest"
            );
        }

        let mut resumed = 0usize;
        let last_index = batch.len().saturating_sub(1);
        for (index, checkpoint) in batch.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            self.store
                .update_checkpoint_resume_count(checkpoint.id, checkpoint.resume_count + 1)
                .await?;
            match self.resumer.resume(&checkpoint, cancel).await {
                Ok(()) => {
                    self.store.delete_checkpoint(checkpoint.id).await?;
                    resumed += 1;
                    info!(checkpoint_id = %checkpoint.id, "checkpoint resumed");
                }
                Err(err) => {
                    warn!(checkpoint_id = %checkpoint.id, error = %err, "checkpoint resume failed, keeping it");
                }
            }
            if index < last_index {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.resume_delay) => {}
                    _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                }
            }
        }
        Ok(resumed)
    }

    /// Manual cancellation consumes the checkpoint without resuming it.
    pub async fn cancel_checkpoint(&self, checkpoint_id: Uuid) -> Result<()> {
        self.store.delete_checkpoint(checkpoint_id).await?;
        info!(checkpoint_id = %checkpoint_id, "checkpoint cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;

    fn config(timeout_secs: u64, drain_secs: u64) -> ShutdownConfig {
        ShutdownConfig {
            timeout: Duration::from_secs(timeout_secs),
            drain_timeout: Duration::from_secs(drain_secs),
            checkpoint_running_backups: true,
        }
    }

    fn coordinator(
        timeout_secs: u64,
        drain_secs: u64,
    ) -> (Arc<ShutdownCoordinator>, Arc<BackupTracker>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(BackupTracker::new(store.clone(), Uuid::new_v4()));
        let coordinator = Arc::new(ShutdownCoordinator::new(
            tracker.clone(),
            config(timeout_secs, drain_secs),
        ));
        (coordinator, tracker, store)
    }

    #[tokio::test(start_paused = true)]
    async fn idle_shutdown_completes_after_drain_not_timeout() {
        let (coordinator, _, _) = coordinator(60, 1);
        let start = tokio::time::Instant::now();
        coordinator.shutdown(&CancellationToken::new()).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(3));
        assert_eq!(coordinator.state(), ShutdownState::Complete);
        assert!(!coordinator.is_accepting_jobs());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_job_is_checkpointed_within_the_timeout() {
        let (coordinator, tracker, store) = coordinator(5, 1);
        let parent = CancellationToken::new();
        let (job, job_cancel, _) = tracker.register(None, &parent).await.unwrap();

        let start = tokio::time::Instant::now();
        coordinator.shutdown(&CancellationToken::new()).await;
        let elapsed = start.elapsed();

        assert!(elapsed < Duration::from_secs(6));
        assert_eq!(coordinator.state(), ShutdownState::Complete);
        assert_eq!(coordinator.status().checkpoints_taken, 1);
        assert!(job_cancel.is_cancelled());
        let checkpoints = store.checkpoints().await;
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].backup_id, job.id);
        assert!(*coordinator.done().borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_jobs_that_finish_in_time() {
        let (coordinator, tracker, store) = coordinator(30, 1);
        let parent = CancellationToken::new();
        let (job, _, _) = tracker.register(None, &parent).await.unwrap();

        let tracker_clone = tracker.clone();
        let finisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            tracker_clone
                .complete(job.id, Default::default())
                .await
                .unwrap();
        });

        coordinator.shutdown(&CancellationToken::new()).await;
        finisher.await.unwrap();

        // The job drained normally; no checkpoint was forced.
        assert_eq!(coordinator.status().checkpoints_taken, 0);
        assert!(store.checkpoints().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_body_runs_at_most_once() {
        let (coordinator, _, _) = coordinator(10, 1);
        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.shutdown(&CancellationToken::new()).await })
        };
        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.shutdown(&CancellationToken::new()).await })
        };
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(coordinator.state(), ShutdownState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_parent_forces_completion() {
        let (coordinator, tracker, _) = coordinator(600, 30);
        let parent = CancellationToken::new();
        let job_parent = CancellationToken::new();
        tracker.register(None, &job_parent).await.unwrap();

        let handle = {
            let coordinator = coordinator.clone();
            let parent = parent.clone();
            tokio::spawn(async move { coordinator.shutdown(&parent).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        parent.cancel();
        handle.await.unwrap();
        assert_eq!(coordinator.state(), ShutdownState::Complete);
    }

    #[test]
    fn checkpoint_budget_clamps() {
        assert_eq!(checkpoint_budget(Duration::from_secs(100)), Duration::from_secs(20));
        assert_eq!(checkpoint_budget(Duration::from_secs(1000)), Duration::from_secs(30));
        // Tiny windows still reserve something, capped at half the window.
        assert_eq!(checkpoint_budget(Duration::from_secs(4)), Duration::from_secs(1));
        assert_eq!(
            checkpoint_budget(Duration::from_secs(1)),
            Duration::from_millis(500)
        );
    }

    // -- startup resume -----------------------------------------------------

    struct RecordingResumer {
        resumed: std::sync::Mutex<Vec<Uuid>>,
        fail_ids: Vec<Uuid>,
    }

    #[async_trait]
    impl BackupResumer for RecordingResumer {
        async fn resume(&self, checkpoint: &Checkpoint, _cancel: &CancellationToken) -> Result<()> {
            self.resumed.lock().unwrap().push(checkpoint.id);
            if self.fail_ids.contains(&checkpoint.id) {
                return Err(CoreError::EngineUnavailable("down".into()));
            }
            Ok(())
        }
    }

    fn checkpoint_at(agent_id: Uuid, minutes_ago: i64) -> Checkpoint {
        Checkpoint {
            id: Uuid::new_v4(),
            backup_id: Uuid::new_v4(),
            schedule_id: None,
            agent_id,
            files_processed: 0,
            bytes_processed: 0,
            last_updated_at: chrono::Utc::now() - chrono::Duration::minutes(minutes_ago),
            error_message: None,
            resume_count: 0,
        }
    }

    fn startup_config(max: usize) -> StartupConfig {
        StartupConfig {
            resume_checkpoints: true,
            max_resumes_per_startup: max,
            resume_delay: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_oldest_first_up_to_the_cap() {
        let store = Arc::new(MemoryStore::new());
        let agent_id = Uuid::new_v4();
        let old = checkpoint_at(agent_id, 60);
        let older = checkpoint_at(agent_id, 120);
        let newest = checkpoint_at(agent_id, 1);
        for cp in [&old, &older, &newest] {
            store.create_checkpoint(cp).await.unwrap();
        }

        let resumer = Arc::new(RecordingResumer {
            resumed: Default::default(),
            fail_ids: vec![],
        });
        let service = StartupService::new(store.clone(), resumer.clone(), agent_id, startup_config(2));
        let resumed = service
            .resume_checkpoints(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resumed, 2);
        assert_eq!(*resumer.resumed.lock().unwrap(), vec![older.id, old.id]);

        // Consumed on success; the newest one is deferred and kept.
        let left = store.checkpoints().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, newest.id);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resume_keeps_the_checkpoint_and_counts_the_attempt() {
        let store = Arc::new(MemoryStore::new());
        let agent_id = Uuid::new_v4();
        let checkpoint = checkpoint_at(agent_id, 10);
        store.create_checkpoint(&checkpoint).await.unwrap();

        let resumer = Arc::new(RecordingResumer {
            resumed: Default::default(),
            fail_ids: vec![checkpoint.id],
        });
        let service = StartupService::new(store.clone(), resumer, agent_id, startup_config(5));
        let resumed = service
            .resume_checkpoints(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resumed, 0);
        let left = store.checkpoints().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].resume_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_between_resumes_propagates() {
        let store = Arc::new(MemoryStore::new());
        let agent_id = Uuid::new_v4();
        store
            .create_checkpoint(&checkpoint_at(agent_id, 10))
            .await
            .unwrap();
        store
            .create_checkpoint(&checkpoint_at(agent_id, 20))
            .await
            .unwrap();

        let resumer = Arc::new(RecordingResumer {
            resumed: Default::default(),
            fail_ids: vec![],
        });
        let service = Arc::new(StartupService::new(
            store,
            resumer,
            agent_id,
            startup_config(5),
        ));
        let cancel = CancellationToken::new();
        let handle = {
            let service = service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { service.resume_checkpoints(&cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result.unwrap_err(), CoreError::Cancelled));
    }

    #[tokio::test]
    async fn disabled_resume_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let agent_id = Uuid::new_v4();
        store
            .create_checkpoint(&checkpoint_at(agent_id, 10))
            .await
            .unwrap();
        let resumer = Arc::new(RecordingResumer {
            resumed: Default::default(),
            fail_ids: vec![],
        });
        let mut config = startup_config(5);
        config.resume_checkpoints = false;
        let service = StartupService::new(store, resumer.clone(), agent_id, config);
        assert_eq!(
            service
                .resume_checkpoints(&CancellationToken::new())
                .await
                .unwrap(),
            0
        );
        assert!(resumer.resumed.lock().unwrap().is_empty());
    }
}
