use std::collections::HashMap;

use async_trait::async_trait;
use keldris_types::{
    AgentIdentity, BackupJob, Checkpoint, DedupEntry, ImageVersion, Schedule,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::error::{CoreError, Result};

/// Persistent-metadata contract. The real backing store lives outside this
/// process; the core consumes only this operation set and treats every call
/// as one transaction.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_enabled_schedules(&self) -> Result<Vec<Schedule>>;
    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>>;

    async fn create_backup_job(&self, job: &BackupJob) -> Result<()>;
    async fn update_backup_job(&self, job: &BackupJob) -> Result<()>;

    async fn create_image_version(&self, version: &ImageVersion) -> Result<()>;

    async fn list_dedup_entries(&self, org_id: Uuid) -> Result<Vec<DedupEntry>>;
    async fn get_dedup_entry_by_checksum(
        &self,
        org_id: Uuid,
        checksum: &str,
    ) -> Result<Option<DedupEntry>>;
    async fn create_dedup_entry(&self, entry: &DedupEntry) -> Result<()>;
    async fn update_dedup_entry(&self, entry: &DedupEntry) -> Result<()>;
    async fn delete_dedup_entry(&self, id: Uuid) -> Result<()>;

    async fn get_active_checkpoints(&self, agent_id: Uuid) -> Result<Vec<Checkpoint>>;
    async fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn delete_checkpoint(&self, id: Uuid) -> Result<()>;
    async fn update_checkpoint_resume_count(&self, id: Uuid, resume_count: u32) -> Result<()>;

    async fn get_agent(&self, id: Uuid) -> Result<Option<AgentIdentity>>;
}

#[derive(Default)]
struct MemoryState {
    schedules: Vec<Schedule>,
    jobs: HashMap<Uuid, BackupJob>,
    image_versions: Vec<ImageVersion>,
    dedup_entries: HashMap<Uuid, DedupEntry>,
    checkpoints: HashMap<Uuid, Checkpoint>,
    agents: HashMap<Uuid, AgentIdentity>,
}

/// In-memory store used by tests and by a standalone agent run without a
/// control plane attached.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_schedule(&self, schedule: Schedule) {
        self.state.lock().await.schedules.push(schedule);
    }

    pub async fn clear_schedules(&self) {
        self.state.lock().await.schedules.clear();
    }

    pub async fn put_agent(&self, agent: AgentIdentity) {
        self.state.lock().await.agents.insert(agent.id, agent);
    }

    pub async fn job(&self, id: Uuid) -> Option<BackupJob> {
        self.state.lock().await.jobs.get(&id).cloned()
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn checkpoints(&self) -> Vec<Checkpoint> {
        self.state.lock().await.checkpoints.values().cloned().collect()
    }

    pub async fn image_versions(&self) -> Vec<ImageVersion> {
        self.state.lock().await.image_versions.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_enabled_schedules(&self) -> Result<Vec<Schedule>> {
        let state = self.state.lock().await;
        Ok(state
            .schedules
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        let state = self.state.lock().await;
        Ok(state.schedules.iter().find(|s| s.id == id).cloned())
    }

    async fn create_backup_job(&self, job: &BackupJob) -> Result<()> {
        self.state.lock().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_backup_job(&self, job: &BackupJob) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.jobs.contains_key(&job.id) {
            return Err(CoreError::store(format!("unknown backup job {}", job.id)));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn create_image_version(&self, version: &ImageVersion) -> Result<()> {
        self.state.lock().await.image_versions.push(version.clone());
        Ok(())
    }

    async fn list_dedup_entries(&self, org_id: Uuid) -> Result<Vec<DedupEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .dedup_entries
            .values()
            .filter(|e| e.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn get_dedup_entry_by_checksum(
        &self,
        org_id: Uuid,
        checksum: &str,
    ) -> Result<Option<DedupEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .dedup_entries
            .values()
            .find(|e| e.org_id == org_id && e.checksum == checksum)
            .cloned())
    }

    async fn create_dedup_entry(&self, entry: &DedupEntry) -> Result<()> {
        self.state
            .lock()
            .await
            .dedup_entries
            .insert(entry.id, entry.clone());
        Ok(())
    }

    async fn update_dedup_entry(&self, entry: &DedupEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.dedup_entries.contains_key(&entry.id) {
            return Err(CoreError::store(format!("unknown dedup entry {}", entry.id)));
        }
        state.dedup_entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn delete_dedup_entry(&self, id: Uuid) -> Result<()> {
        self.state.lock().await.dedup_entries.remove(&id);
        Ok(())
    }

    async fn get_active_checkpoints(&self, agent_id: Uuid) -> Result<Vec<Checkpoint>> {
        let state = self.state.lock().await;
        Ok(state
            .checkpoints
            .values()
            .filter(|c| c.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.state
            .lock()
            .await
            .checkpoints
            .insert(checkpoint.id, checkpoint.clone());
        Ok(())
    }

    async fn delete_checkpoint(&self, id: Uuid) -> Result<()> {
        self.state.lock().await.checkpoints.remove(&id);
        Ok(())
    }

    async fn update_checkpoint_resume_count(&self, id: Uuid, resume_count: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.checkpoints.get_mut(&id) {
            Some(checkpoint) => {
                checkpoint.resume_count = resume_count;
                Ok(())
            }
            None => Err(CoreError::store(format!("unknown checkpoint {id}"))),
        }
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<AgentIdentity>> {
        Ok(self.state.lock().await.agents.get(&id).cloned())
    }
}
