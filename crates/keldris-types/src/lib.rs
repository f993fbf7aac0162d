use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Manifest format version written by this agent. Readers reject a different
/// major version.
pub const MANIFEST_VERSION: &str = "1.0";

/// State of one service container captured at backup time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    pub service_name: String,
    pub container_id: String,
    pub status: String,
    #[serde(default)]
    pub health: String,
    pub image: String,
    pub image_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<chrono::DateTime<chrono::Utc>>,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// A named volume captured into the backup directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeArtifact {
    pub logical_name: String,
    pub resolved_engine_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub mount_path: String,
    pub backup_path: String,
    pub size_bytes: u64,
    pub file_count: u64,
    pub backed_up_at: chrono::DateTime<chrono::Utc>,
}

/// A host directory captured into the backup directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindMountArtifact {
    pub host_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub mount_path: String,
    pub backup_path: String,
    pub size_bytes: u64,
    pub file_count: u64,
    pub backed_up_at: chrono::DateTime<chrono::Utc>,
}

/// An exported container image. `backup_path` may point into an earlier
/// backup's directory when the image was deduplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageArtifact {
    pub reference: String,
    pub image_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub size_bytes: u64,
    pub backup_path: String,
    pub backed_up_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub deduplicated: bool,
}

/// The full record of one stack backup. Immutable once written; a new backup
/// gets a new timestamped directory and a new manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub stack_name: String,
    pub composition_path: String,
    pub composition_hash: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub container_states: Vec<ContainerState>,
    pub volumes: Vec<VolumeArtifact>,
    pub bind_mounts: Vec<BindMountArtifact>,
    pub images: Vec<ImageArtifact>,
    #[serde(default)]
    pub env_files: Vec<String>,
    pub dependency_order: Vec<String>,
    pub total_size_bytes: u64,
    pub includes_images: bool,
}

impl Manifest {
    /// Major-version gate: "1.x" readers accept any "1.*" manifest.
    pub fn version_compatible(version: &str) -> bool {
        version.split('.').next() == MANIFEST_VERSION.split('.').next()
    }
}

/// Reference-counted record of a previously exported image artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupEntry {
    pub id: uuid::Uuid,
    pub org_id: uuid::Uuid,
    pub image_id: String,
    pub checksum: String,
    pub origin_backup_id: uuid::Uuid,
    pub artifact_path: String,
    pub size_bytes: u64,
    pub reference_count: i64,
}

/// Audit row written for every image export or dedup hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageVersion {
    pub id: uuid::Uuid,
    pub org_id: uuid::Uuid,
    pub backup_id: uuid::Uuid,
    pub reference: String,
    pub image_id: String,
    pub checksum: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Checkpointed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub volume_count: u64,
    pub bind_mount_count: u64,
    pub image_count: u64,
    pub deduplicated_image_count: u64,
    pub total_size_bytes: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Async tracking row for a backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: uuid::Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<uuid::Uuid>,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub stats: JobStats,
}

impl BackupJob {
    pub fn new(schedule_id: Option<uuid::Uuid>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            schedule_id,
            state: JobState::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            stats: JobStats::default(),
        }
    }
}

/// Persisted marker that a running backup was interrupted and can be resumed
/// on the next startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: uuid::Uuid,
    pub backup_id: uuid::Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<uuid::Uuid>,
    pub agent_id: uuid::Uuid,
    pub files_processed: u64,
    pub bytes_processed: u64,
    pub last_updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub resume_count: u32,
}

/// One enabled backup schedule row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: uuid::Uuid,
    pub name: String,
    pub cron_expression: String,
    pub composition_path: String,
    pub backup_root_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub export_images: bool,
    #[serde(default)]
    pub include_env_files: bool,
    #[serde(default)]
    pub stop_containers: bool,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

/// Agent identity row consumed from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: uuid::Uuid,
    pub org_id: uuid::Uuid,
    pub hostname: String,
}

// ---------------------------------------------------------------------------
// Cluster backup envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterBackupMeta {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub hostname: String,
    pub service_count: u64,
    pub stack_count: u64,
    pub node_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub hostname: String,
    pub role: String,
    pub availability: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u64>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Derived from the `com.docker.compose.depends_on` label when present.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Raw engine-side spec, kept verbatim for recreation.
    pub raw_spec: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackRecord {
    pub name: String,
    pub services: Vec<String>,
}

/// Metadata-only secret backup. The engine never releases the value; restore
/// requires the caller to re-supply the plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretEnvelope {
    pub docker_encrypted_ref: String,
    pub keldris_encrypted: String,
    pub checksum: String,
    pub encrypted_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    pub envelope: SecretEnvelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub id: String,
    pub name: String,
    /// Config payload, base64-encoded as the engine reports it.
    pub data_base64: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub scope: String,
    #[serde(default)]
    pub attachable: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub subnets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterVolumeRecord {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
}

/// Everything captured from a clustered engine in one backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterManifest {
    pub metadata: ClusterBackupMeta,
    pub cluster_state: ClusterState,
    pub nodes: Vec<NodeRecord>,
    pub services: Vec<ServiceRecord>,
    pub stacks: Vec<StackRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Vec<SecretRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configs: Option<Vec<ConfigRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<Vec<NetworkRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<ClusterVolumeRecord>>,
}

// ---------------------------------------------------------------------------
// Saved per-entity restore configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedMount {
    pub kind: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedPort {
    pub container_port: u16,
    pub host_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Container configuration saved at backup time, sufficient to rebuild the
/// engine-side create invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedContainerConfig {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<SavedMount>,
    #[serde(default)]
    pub ports: Vec<SavedPort>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedVolumeConfig {
    pub name: String,
    #[serde(default = "default_volume_driver")]
    pub driver: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub size_bytes: u64,
}

fn default_volume_driver() -> String {
    "local".to_string()
}

// ---------------------------------------------------------------------------
// Configuration option structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupOptions {
    pub composition_path: String,
    pub backup_root_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
    #[serde(default)]
    pub export_images: bool,
    #[serde(default)]
    pub include_env_files: bool,
    #[serde(default)]
    pub stop_containers: bool,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Backup directory holding either a manifest or the per-entity
    /// `docker/containers/<name>/config.json` layout.
    pub source_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default)]
    pub volume_names: Vec<String>,
    #[serde(default)]
    pub restore_volumes: bool,
    #[serde(default)]
    pub restore_images: bool,
    #[serde(default)]
    pub path_mappings: HashMap<String, String>,
    #[serde(default)]
    pub start_containers: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_volume_name: Option<String>,
    #[serde(default)]
    pub overwrite_existing: bool,
    #[serde(default)]
    pub verify_start: bool,
    #[serde(default = "default_verify_timeout_secs")]
    pub verify_timeout_secs: u64,
}

fn default_verify_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupOptions {
    pub backup_dir: String,
    #[serde(default)]
    pub exclude_public_images: bool,
    #[serde(default)]
    pub public_registries: Vec<String>,
    #[serde(default = "default_compression_level")]
    pub compression_level: u8,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_compression_level() -> u8 {
    6
}

fn default_max_concurrent() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownOptions {
    pub timeout_secs: u64,
    pub drain_timeout_secs: u64,
    #[serde(default)]
    pub checkpoint_running_backups: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupOptions {
    #[serde(default)]
    pub resume_checkpoints: bool,
    #[serde(default = "default_max_resumes")]
    pub max_resumes_per_startup: usize,
    #[serde(default = "default_resume_delay_secs")]
    pub resume_delay_secs: u64,
}

fn default_max_resumes() -> usize {
    5
}

fn default_resume_delay_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterBackupOptions {
    pub output_dir: String,
    #[serde(default)]
    pub include_secrets: bool,
    #[serde(default)]
    pub include_configs: bool,
    #[serde(default)]
    pub include_networks: bool,
    #[serde(default)]
    pub include_volumes: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterRestoreOptions {
    #[serde(default)]
    pub force: bool,
    /// secret id -> plaintext, re-supplied by the caller. Secrets with no
    /// entry are skipped with a warning.
    #[serde(default)]
    pub secret_plaintexts: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_version_gate_accepts_same_major() {
        assert!(Manifest::version_compatible("1.0"));
        assert!(Manifest::version_compatible("1.7"));
        assert!(!Manifest::version_compatible("2.0"));
        assert!(!Manifest::version_compatible("0.9"));
    }

    #[test]
    fn job_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobState::Checkpointed).unwrap(),
            "\"checkpointed\""
        );
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            stack_name: "web".into(),
            composition_path: "/srv/web/docker-compose.yml".into(),
            composition_hash: "deadbeef".into(),
            timestamp: chrono::Utc::now(),
            container_states: vec![],
            volumes: vec![],
            bind_mounts: vec![],
            images: vec![],
            env_files: vec![],
            dependency_order: vec!["web".into()],
            total_size_bytes: 0,
            includes_images: false,
        };
        let json = serde_json::to_string_pretty(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stack_name, "web");
        assert_eq!(back.dependency_order, vec!["web".to_string()]);
    }
}
