pub mod tracker;

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use keldris_types::{
    BackupJob, BackupOptions, BindMountArtifact, ContainerState, ImageArtifact, ImageVersion,
    JobStats, Manifest, VolumeArtifact, MANIFEST_VERSION,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::engine::{ContainerSummary, Engine, MountSpec};
use crate::core::error::{CoreError, Result};
use crate::core::snapshotter::{RepoConfig, SnapshotReport, Snapshotter};
use crate::core::store::Store;
use crate::features::dedup::{sha256_file, DedupIndex};
use crate::features::hooks::{Hook, HookExecution, HookExecutor, HookType};
use crate::features::shutdown::AdmissionGate;
use crate::features::stack::{self, MountPoint, MountSource, StackPlan};

use self::tracker::{BackupTracker, ProgressCounters};

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

#[derive(Debug, Clone)]
pub struct BackupRunnerConfig {
    /// Image used for throwaway tar containers.
    pub helper_image: String,
    pub max_concurrent_exports: usize,
    pub exclude_public_images: bool,
    pub public_registries: Vec<String>,
    pub stop_timeout_secs: u64,
}

impl Default for BackupRunnerConfig {
    fn default() -> Self {
        Self {
            helper_image: "alpine:3.20".into(),
            max_concurrent_exports: 2,
            exclude_public_images: false,
            public_registries: vec!["docker.io".into(), "registry-1.docker.io".into()],
            stop_timeout_secs: 30,
        }
    }
}

/// Optional handoff of the finished backup directory to the
/// content-addressed snapshot backend.
pub struct SnapshotTarget {
    pub snapshotter: Arc<dyn Snapshotter>,
    pub repo: RepoConfig,
}

#[derive(Debug)]
pub struct BackupRunResult {
    pub job: BackupJob,
    pub backup_dir: PathBuf,
    pub manifest: Manifest,
    pub warnings: Vec<String>,
    pub hook_executions: Vec<HookExecution>,
    pub snapshot: Option<SnapshotReport>,
}

#[derive(Default)]
struct Artifacts {
    volumes: Vec<VolumeArtifact>,
    bind_mounts: Vec<BindMountArtifact>,
    images: Vec<ImageArtifact>,
}

enum FreezeMode {
    Paused,
    Stopped,
}

struct Frozen {
    mode: FreezeMode,
    container_ids: Vec<String>,
}

/// Per-stack backup pipeline: freeze, capture volumes, bind mounts and
/// images, write the manifest, thaw. Individual artifacts are best-effort;
/// the surrounding steps are fatal.
pub struct WorkloadBackup {
    engine: Arc<dyn Engine>,
    store: Arc<dyn Store>,
    dedup: Arc<DedupIndex>,
    tracker: Arc<BackupTracker>,
    hooks: HookExecutor,
    gate: AdmissionGate,
    org_id: Uuid,
    config: BackupRunnerConfig,
    snapshot_target: Option<SnapshotTarget>,
}

impl WorkloadBackup {
    pub fn new(
        engine: Arc<dyn Engine>,
        store: Arc<dyn Store>,
        dedup: Arc<DedupIndex>,
        tracker: Arc<BackupTracker>,
        gate: AdmissionGate,
        org_id: Uuid,
        config: BackupRunnerConfig,
    ) -> Self {
        Self {
            hooks: HookExecutor::new(engine.clone()),
            engine,
            store,
            dedup,
            tracker,
            gate,
            org_id,
            config,
            snapshot_target: None,
        }
    }

    pub fn with_snapshot_target(mut self, target: SnapshotTarget) -> Self {
        self.snapshot_target = Some(target);
        self
    }

    pub async fn run(
        &self,
        opts: &BackupOptions,
        hooks: &[Hook],
        schedule_id: Option<Uuid>,
        parent: &CancellationToken,
    ) -> Result<BackupRunResult> {
        if !self.gate.is_accepting() {
            return Err(CoreError::ShutdownInProgress);
        }
        metrics::counter!("agent_backup_started", 1);
        let (job, cancel, progress) = self.tracker.register(schedule_id, parent).await?;
        let job_id = job.id;

        match self.execute(opts, hooks, job_id, &cancel, &progress).await {
            Ok(mut result) => {
                let stats = JobStats {
                    volume_count: result.manifest.volumes.len() as u64,
                    bind_mount_count: result.manifest.bind_mounts.len() as u64,
                    image_count: result.manifest.images.len() as u64,
                    deduplicated_image_count: result
                        .manifest
                        .images
                        .iter()
                        .filter(|i| i.deduplicated)
                        .count() as u64,
                    total_size_bytes: result.manifest.total_size_bytes,
                    warnings: result.warnings.clone(),
                };
                result.job = self.tracker.complete(job_id, stats).await?;
                metrics::counter!("agent_backup_completed", 1);
                Ok(result)
            }
            Err(err) => {
                metrics::counter!("agent_backup_failed", 1);
                // A checkpointed job was already settled by the tracker.
                if let Err(finish_err) = self.tracker.fail(job_id, &err).await {
                    tracing::debug!(job_id = %job_id, error = %finish_err, "job not failed in tracker");
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        opts: &BackupOptions,
        hooks: &[Hook],
        backup_id: Uuid,
        cancel: &CancellationToken,
        progress: &ProgressCounters,
    ) -> Result<BackupRunResult> {
        self.engine.ping(cancel).await?;

        let composition_path = Path::new(&opts.composition_path);
        let plan = stack::plan(composition_path, opts.stack_name.as_deref())?;
        let backup_dir = create_backup_dirs(
            Path::new(&opts.backup_root_dir),
            &plan.stack_name,
            opts.export_images,
        )?;
        info!(stack = %plan.stack_name, dir = %backup_dir.display(), "backup started");

        let mut warnings = Vec::new();
        let mut hook_executions = Vec::new();
        let states = self.capture_states(&plan, cancel, &mut warnings).await;

        let (pre_executions, pre_result) = self.hooks.run_all(hooks, HookType::Pre, backup_id).await;
        hook_executions.extend(pre_executions);
        pre_result?;

        let frozen = self
            .freeze(&states, opts.stop_containers, cancel, &mut warnings)
            .await;
        let artifact_run = AssertUnwindSafe(self.capture_artifacts(
            opts,
            &plan,
            &states,
            &backup_dir,
            backup_id,
            cancel,
            progress,
            &mut warnings,
        ))
        .catch_unwind()
        .await;
        // The thaw runs on every exit path, panic included.
        self.thaw(&frozen).await;
        let artifacts = match artifact_run {
            Ok(result) => result?,
            Err(panic) => std::panic::resume_unwind(panic),
        };

        let (post_executions, post_result) =
            self.hooks.run_all(hooks, HookType::Post, backup_id).await;
        hook_executions.extend(post_executions);
        post_result?;

        let env_files = stage_composition_files(
            composition_path,
            &backup_dir,
            opts.include_env_files,
            &mut warnings,
        )?;

        let total_size_bytes = {
            let dir = backup_dir.clone();
            let token = cancel.clone();
            tokio::task::spawn_blocking(move || stack::walk_stats(&dir, &token).0)
                .await
                .map_err(|err| {
                    CoreError::io(&backup_dir, std::io::Error::other(err.to_string()))
                })?
        };
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            stack_name: plan.stack_name.clone(),
            composition_path: opts.composition_path.clone(),
            composition_hash: sha256_file(composition_path)?,
            timestamp: chrono::Utc::now(),
            container_states: states,
            volumes: artifacts.volumes,
            bind_mounts: artifacts.bind_mounts,
            images: artifacts.images,
            env_files,
            dependency_order: plan.dependency_order.clone(),
            total_size_bytes,
            includes_images: opts.export_images,
        };
        write_manifest_atomic(&backup_dir, &manifest)?;

        let snapshot = self.hand_off_snapshot(&backup_dir, &plan, cancel, &mut warnings).await;

        info!(
            stack = %plan.stack_name,
            volumes = manifest.volumes.len(),
            bind_mounts = manifest.bind_mounts.len(),
            images = manifest.images.len(),
            total_size_bytes,
            "backup finished"
        );

        Ok(BackupRunResult {
            job: BackupJob::new(None),
            backup_dir,
            manifest,
            warnings,
            hook_executions,
            snapshot,
        })
    }

    /// `ps` against the stack; a missing engine listing degrades to an empty
    /// state list with a warning.
    async fn capture_states(
        &self,
        plan: &StackPlan,
        cancel: &CancellationToken,
        warnings: &mut Vec<String>,
    ) -> Vec<ContainerState> {
        let summaries = match self.engine.list_containers(cancel).await {
            Ok(summaries) => summaries,
            Err(err) => {
                warn!(error = %err, "could not list containers, continuing without states");
                warnings.push(format!("container states unavailable: {err}"));
                return Vec::new();
            }
        };

        let service_names: Vec<&str> = plan.compose.services.keys().map(String::as_str).collect();
        let mut states = Vec::new();
        for summary in summaries {
            let Some(service) = service_for_container(&summary, &plan.stack_name, &service_names)
            else {
                continue;
            };
            match self.engine.inspect_container(&summary.id, cancel).await {
                Ok(details) => states.push(ContainerState {
                    service_name: service,
                    container_id: details.id.clone(),
                    status: details.state.status.clone(),
                    health: details.health_status(),
                    image: details.config.image.clone(),
                    image_id: details.image_id.clone(),
                    created: details.created,
                    started: details.state.started_at,
                }),
                Err(err) => {
                    warn!(container = %summary.id, error = %err, "could not inspect container");
                    warnings.push(format!("inspect {} failed: {err}", summary.first_name()));
                }
            }
        }
        states.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        states
    }

    async fn freeze(
        &self,
        states: &[ContainerState],
        stop: bool,
        cancel: &CancellationToken,
        warnings: &mut Vec<String>,
    ) -> Frozen {
        let mut frozen = Frozen {
            mode: if stop {
                FreezeMode::Stopped
            } else {
                FreezeMode::Paused
            },
            container_ids: Vec::new(),
        };
        for state in states.iter().filter(|s| s.is_running()) {
            let result = if stop {
                self.engine
                    .stop_container(&state.container_id, self.config.stop_timeout_secs, cancel)
                    .await
            } else {
                self.engine.pause(&state.container_id, cancel).await
            };
            match result {
                Ok(()) => frozen.container_ids.push(state.container_id.clone()),
                Err(err) => {
                    warn!(container = %state.container_id, error = %err, "freeze failed");
                    warnings.push(format!("freeze {} failed: {err}", state.service_name));
                }
            }
        }
        frozen
    }

    /// Deferred thaw: fresh short-deadline context, logs but never fails.
    async fn thaw(&self, frozen: &Frozen) {
        let token = CancellationToken::new();
        for id in &frozen.container_ids {
            let result = tokio::time::timeout(Duration::from_secs(30), async {
                match frozen.mode {
                    FreezeMode::Paused => self.engine.unpause(id, &token).await,
                    FreezeMode::Stopped => self.engine.start_container(id, &token).await,
                }
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(container = %id, error = %err, "thaw failed"),
                Err(_) => warn!(container = %id, "thaw timed out"),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn capture_artifacts(
        &self,
        opts: &BackupOptions,
        plan: &StackPlan,
        states: &[ContainerState],
        backup_dir: &Path,
        backup_id: Uuid,
        cancel: &CancellationToken,
        progress: &ProgressCounters,
        warnings: &mut Vec<String>,
    ) -> Result<Artifacts> {
        let mut artifacts = Artifacts::default();

        let mut seen_volumes = BTreeSet::new();
        for mount in &plan.mounts {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            match &mount.source {
                MountSource::Named {
                    logical_name,
                    engine_name,
                } => {
                    if !seen_volumes.insert(engine_name.clone()) {
                        continue;
                    }
                    match self
                        .backup_volume(logical_name, engine_name, mount, backup_dir, cancel)
                        .await
                    {
                        Ok(artifact) => {
                            progress.record(artifact.file_count.max(1), artifact.size_bytes);
                            artifacts.volumes.push(artifact);
                        }
                        Err(err) => {
                            warn!(volume = %engine_name, error = %err, "volume backup failed, skipping");
                            warnings.push(format!("volume {engine_name}: {err}"));
                        }
                    }
                }
                MountSource::Bind { host_path } => {
                    if let Some(prefix) = excluded_by(host_path, &opts.exclude_paths) {
                        warn!(path = %host_path.display(), prefix = %prefix, "bind mount excluded");
                        warnings.push(format!(
                            "bind mount {} excluded by {prefix}",
                            host_path.display()
                        ));
                        continue;
                    }
                    match self
                        .backup_bind_mount(host_path, mount, backup_dir, cancel)
                        .await
                    {
                        Ok(artifact) => {
                            progress.record(artifact.file_count.max(1), artifact.size_bytes);
                            artifacts.bind_mounts.push(artifact);
                        }
                        Err(err) => {
                            warn!(path = %host_path.display(), error = %err, "bind mount backup failed, skipping");
                            warnings.push(format!("bind mount {}: {err}", host_path.display()));
                        }
                    }
                }
            }
        }

        if opts.export_images {
            let (images, image_warnings) = self
                .export_images(plan, states, backup_dir, backup_id, cancel, progress)
                .await?;
            artifacts.images = images;
            warnings.extend(image_warnings);
        }

        Ok(artifacts)
    }

    /// Tar a named volume through a throwaway container mounting it
    /// read-only at /source and the backup directory at /backup.
    async fn backup_volume(
        &self,
        logical_name: &str,
        engine_name: &str,
        mount: &MountPoint,
        backup_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<VolumeArtifact> {
        let volumes_dir = backup_dir.join("volumes");
        let tar_name = format!("{engine_name}.tar.gz");
        let mounts = [
            MountSpec {
                source: engine_name.to_string(),
                target: "/source".into(),
                read_only: true,
            },
            MountSpec {
                source: volumes_dir.to_string_lossy().into_owned(),
                target: "/backup".into(),
                read_only: false,
            },
        ];
        let argv = vec![
            "tar".to_string(),
            "czf".to_string(),
            format!("/backup/{tar_name}"),
            "-C".to_string(),
            "/source".to_string(),
            ".".to_string(),
        ];
        let out = self
            .engine
            .run_throwaway(&self.config.helper_image, &mounts, &argv, cancel)
            .await?;
        if !out.success() {
            return Err(CoreError::EngineError {
                op: "volume tar".into(),
                stderr_tail: out.stderr.trim().to_string(),
            });
        }

        let tar_path = volumes_dir.join(&tar_name);
        let tar_len = std::fs::metadata(&tar_path)
            .map_err(|err| CoreError::io(&tar_path, err))?
            .len();

        // Source-side stats come from the engine's mountpoint when readable.
        let (size_bytes, file_count) = match self.engine.inspect_volume(engine_name, cancel).await {
            Ok(details) => {
                let stats = stack::walk_stats(Path::new(&details.mountpoint), cancel);
                if stats.1 == 0 {
                    (tar_len, 0)
                } else {
                    stats
                }
            }
            Err(_) => (tar_len, 0),
        };

        Ok(VolumeArtifact {
            logical_name: logical_name.to_string(),
            resolved_engine_name: engine_name.to_string(),
            service_name: Some(mount.service.clone()),
            mount_path: mount.container_path.clone(),
            backup_path: tar_path.to_string_lossy().into_owned(),
            size_bytes,
            file_count,
            backed_up_at: chrono::Utc::now(),
        })
    }

    async fn backup_bind_mount(
        &self,
        host_path: &Path,
        mount: &MountPoint,
        backup_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<BindMountArtifact> {
        let parent = host_path
            .parent()
            .ok_or_else(|| CoreError::io(host_path, std::io::Error::other("no parent directory")))?;
        let base = host_path
            .file_name()
            .ok_or_else(|| CoreError::io(host_path, std::io::Error::other("no basename")))?;

        let (size_bytes, file_count) = stack::walk_stats(host_path, cancel);
        let tar_path = backup_dir
            .join("bind_mounts")
            .join(format!("{}.tar.gz", safe_bind_name(host_path)));
        run_host_tar(
            &[
                "czf".to_string(),
                tar_path.to_string_lossy().into_owned(),
                "-C".to_string(),
                parent.to_string_lossy().into_owned(),
                base.to_string_lossy().into_owned(),
            ],
            cancel,
        )
        .await?;

        Ok(BindMountArtifact {
            host_path: host_path.to_string_lossy().into_owned(),
            service_name: Some(mount.service.clone()),
            mount_path: mount.container_path.clone(),
            backup_path: tar_path.to_string_lossy().into_owned(),
            size_bytes,
            file_count,
            backed_up_at: chrono::Utc::now(),
        })
    }

    /// Export the union of compose-declared and running images, bounded by a
    /// semaphore, consulting the dedup index before touching the disk twice.
    async fn export_images(
        &self,
        plan: &StackPlan,
        states: &[ContainerState],
        backup_dir: &Path,
        backup_id: Uuid,
        cancel: &CancellationToken,
        progress: &ProgressCounters,
    ) -> Result<(Vec<ImageArtifact>, Vec<String>)> {
        let mut references: BTreeSet<String> = plan
            .compose
            .services
            .values()
            .filter_map(|spec| spec.image.clone())
            .collect();
        references.extend(states.iter().map(|s| s.image.clone()));

        let mut warnings = Vec::new();
        let mut artifacts = Vec::new();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_exports.max(1)));
        let images_dir = backup_dir.join("images");

        let exports = references.iter().map(|reference| {
            let semaphore = semaphore.clone();
            let images_dir = images_dir.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore open");
                if cancel.is_cancelled() {
                    return (reference.clone(), Err(CoreError::Cancelled));
                }
                if self.config.exclude_public_images
                    && is_public_image(reference, &self.config.public_registries)
                {
                    return (reference.clone(), Ok(None));
                }
                let result = self
                    .export_one_image(reference, &images_dir, backup_id, cancel)
                    .await;
                (reference.clone(), result.map(Some))
            }
        });

        for (reference, result) in futures::future::join_all(exports).await {
            match result {
                Ok(Some(artifact)) => {
                    progress.record(1, artifact.size_bytes);
                    artifacts.push(artifact);
                }
                Ok(None) => {
                    info!(image = %reference, "public image excluded from export");
                }
                Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                Err(err) => {
                    warn!(image = %reference, error = %err, "image export failed, skipping");
                    warnings.push(format!("image {reference}: {err}"));
                }
            }
        }
        Ok((artifacts, warnings))
    }

    async fn export_one_image(
        &self,
        reference: &str,
        images_dir: &Path,
        backup_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ImageArtifact> {
        let details = self.engine.inspect_image(reference, cancel).await?;

        // An image already stored on this host never hits the disk again.
        if let Some(entry) = self.dedup.find_by_image_id(&details.id).await {
            let entry = self.dedup.increment(&entry).await?;
            self.record_image_version(reference, &entry.image_id, &entry.checksum, backup_id)
                .await;
            return Ok(ImageArtifact {
                reference: reference.to_string(),
                image_id: entry.image_id.clone(),
                tags: details.repo_tags.clone(),
                size_bytes: entry.size_bytes,
                backup_path: entry.artifact_path.clone(),
                backed_up_at: chrono::Utc::now(),
                deduplicated: true,
            });
        }

        let tar_path = images_dir.join(format!("{}.tar", sanitize_image_name(reference)));
        self.engine.export_image(reference, &tar_path, cancel).await?;
        let tar_len = std::fs::metadata(&tar_path)
            .map_err(|err| CoreError::io(&tar_path, err))?
            .len();
        let checksum = {
            let path = tar_path.clone();
            tokio::task::spawn_blocking(move || sha256_file(&path))
                .await
                .map_err(|err| CoreError::io(&tar_path, std::io::Error::other(err.to_string())))??
        };

        let (entry, deduplicated) = match self
            .dedup
            .check_duplicate(self.org_id, &details.id, &checksum)
            .await?
        {
            Some(existing) => {
                // Same bytes already stored under another backup; drop ours.
                if let Err(err) = std::fs::remove_file(&tar_path) {
                    warn!(path = %tar_path.display(), error = %err, "could not remove duplicate export");
                }
                (self.dedup.increment(&existing).await?, true)
            }
            None => (
                self.dedup
                    .register(
                        self.org_id,
                        &details.id,
                        &checksum,
                        backup_id,
                        &tar_path,
                        tar_len,
                    )
                    .await?,
                false,
            ),
        };
        self.record_image_version(reference, &details.id, &checksum, backup_id)
            .await;

        Ok(ImageArtifact {
            reference: reference.to_string(),
            image_id: details.id,
            tags: details.repo_tags,
            size_bytes: entry.size_bytes,
            backup_path: entry.artifact_path.clone(),
            backed_up_at: chrono::Utc::now(),
            deduplicated,
        })
    }

    async fn record_image_version(
        &self,
        reference: &str,
        image_id: &str,
        checksum: &str,
        backup_id: Uuid,
    ) {
        let version = ImageVersion {
            id: Uuid::new_v4(),
            org_id: self.org_id,
            backup_id,
            reference: reference.to_string(),
            image_id: image_id.to_string(),
            checksum: checksum.to_string(),
            created_at: chrono::Utc::now(),
        };
        if let Err(err) = self.store.create_image_version(&version).await {
            warn!(image = %reference, error = %err, "could not record image version");
        }
    }

    async fn hand_off_snapshot(
        &self,
        backup_dir: &Path,
        plan: &StackPlan,
        cancel: &CancellationToken,
        warnings: &mut Vec<String>,
    ) -> Option<SnapshotReport> {
        let target = self.snapshot_target.as_ref()?;
        let tags = vec![format!("stack:{}", plan.stack_name)];
        match target
            .snapshotter
            .backup(&target.repo, &[backup_dir.to_path_buf()], &[], &tags, cancel)
            .await
        {
            Ok(report) => {
                info!(snapshot_id = %report.snapshot_id, "backup handed to snapshot backend");
                Some(report)
            }
            Err(err) => {
                warn!(error = %err, "snapshot backend handoff failed");
                warnings.push(format!("snapshot handoff: {err}"));
                None
            }
        }
    }
}

/// `<root>/<stack>_<YYYYMMDD_HHMMSS>/` with the artifact subdirectories.
fn create_backup_dirs(root: &Path, stack_name: &str, with_images: bool) -> Result<PathBuf> {
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let mut backup_dir = root.join(format!("{stack_name}_{stamp}"));
    // Same-second collisions get a numeric suffix instead of sharing a
    // directory.
    let mut attempt = 1;
    while backup_dir.exists() {
        attempt += 1;
        backup_dir = root.join(format!("{stack_name}_{stamp}_{attempt}"));
    }
    for sub in ["volumes", "bind_mounts"] {
        let dir = backup_dir.join(sub);
        std::fs::create_dir_all(&dir).map_err(|err| CoreError::io(&dir, err))?;
    }
    if with_images {
        let dir = backup_dir.join("images");
        std::fs::create_dir_all(&dir).map_err(|err| CoreError::io(&dir, err))?;
    }
    Ok(backup_dir)
}

/// Copy the composition file (and env files when requested) into the backup
/// directory; returns the relative env file paths recorded in the manifest.
fn stage_composition_files(
    composition_path: &Path,
    backup_dir: &Path,
    include_env_files: bool,
    warnings: &mut Vec<String>,
) -> Result<Vec<String>> {
    let file_name = composition_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "docker-compose.yml".into());
    std::fs::copy(composition_path, backup_dir.join(&file_name))
        .map_err(|err| CoreError::io(composition_path, err))?;

    if !include_env_files {
        return Ok(Vec::new());
    }
    let env_dir = backup_dir.join("env");
    std::fs::create_dir_all(&env_dir).map_err(|err| CoreError::io(&env_dir, err))?;
    let mut copied = Vec::new();
    let composition_dir = composition_path.parent().unwrap_or(Path::new("."));
    let entries = match std::fs::read_dir(composition_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warnings.push(format!("env file scan failed: {err}"));
            return Ok(copied);
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_env_file(&name) || !entry.path().is_file() {
            continue;
        }
        match std::fs::copy(entry.path(), env_dir.join(&name)) {
            Ok(_) => copied.push(format!("env/{name}")),
            Err(err) => warnings.push(format!("env file {name}: {err}")),
        }
    }
    copied.sort();
    Ok(copied)
}

pub fn is_env_file(name: &str) -> bool {
    name == ".env" || name == ".env.local" || name.ends_with(".env")
}

/// Image reference turned into a filesystem-safe file stem.
pub fn sanitize_image_name(reference: &str) -> String {
    reference
        .chars()
        .map(|c| match c {
            '/' | ':' | '@' => '_',
            other => other,
        })
        .collect()
}

/// Host path turned into a flat archive name: leading `/` stripped,
/// separators replaced.
pub fn safe_bind_name(host_path: &Path) -> String {
    host_path
        .to_string_lossy()
        .trim_start_matches('/')
        .replace('/', "_")
}

fn excluded_by(host_path: &Path, exclude_paths: &[String]) -> Option<String> {
    exclude_paths
        .iter()
        .find(|prefix| host_path.starts_with(prefix.as_str()))
        .cloned()
}

fn is_public_image(reference: &str, registries: &[String]) -> bool {
    match reference.split_once('/') {
        // `nginx:1.25` style references implicitly live on the default
        // public registry, as do `library/nginx` namespaced ones.
        None => true,
        Some((first, _)) if !first.contains('.') && !first.contains(':') => true,
        Some((first, _)) => registries.iter().any(|r| r == first),
    }
}

/// Identify which stack service a container belongs to, by compose labels
/// first and the conventional `<stack>-<service>-<n>` names second.
fn service_for_container(
    summary: &ContainerSummary,
    stack_name: &str,
    services: &[&str],
) -> Option<String> {
    let labels = summary.label_map();
    if let (Some(project), Some(service)) = (
        labels.get(COMPOSE_PROJECT_LABEL),
        labels.get(COMPOSE_SERVICE_LABEL),
    ) {
        if project == stack_name {
            return Some(service.clone());
        }
        return None;
    }
    let name = summary.first_name();
    for service in services {
        let dashed = format!("{stack_name}-{service}-");
        let underscored = format!("{stack_name}_{service}_");
        if name.starts_with(&dashed) || name.starts_with(&underscored) {
            return Some(service.to_string());
        }
    }
    None
}

async fn run_host_tar(args: &[String], cancel: &CancellationToken) -> Result<()> {
    let mut cmd = tokio::process::Command::new("tar");
    cmd.args(args).kill_on_drop(true);
    let child = cmd
        .output();
    let output = tokio::select! {
        out = child => out.map_err(|err| CoreError::io("tar", err))?,
        _ = cancel.cancelled() => return Err(CoreError::Cancelled),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CoreError::io(
            "tar",
            std::io::Error::other(stderr.trim().to_string()),
        ));
    }
    Ok(())
}

fn write_manifest_atomic(backup_dir: &Path, manifest: &Manifest) -> Result<()> {
    let json = serde_json::to_vec_pretty(manifest)
        .map_err(|err| CoreError::InvalidBackupData(err.to_string()))?;
    let tmp = backup_dir.join("manifest.json.tmp");
    let path = backup_dir.join("manifest.json");
    std::fs::write(&tmp, json).map_err(|err| CoreError::io(&tmp, err))?;
    std::fs::rename(&tmp, &path).map_err(|err| CoreError::io(&path, err))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;
    use crate::core::testing::FakeEngine;
    use keldris_types::JobState;

    struct Fixture {
        engine: Arc<FakeEngine>,
        store: Arc<MemoryStore>,
        tracker: Arc<BackupTracker>,
        gate: AdmissionGate,
        org_id: Uuid,
        _work: tempfile::TempDir,
        compose_path: PathBuf,
        backup_root: PathBuf,
    }

    fn fixture(compose_yaml: &str, engine: FakeEngine) -> Fixture {
        let work = tempfile::tempdir().unwrap();
        let stack_dir = work.path().join("mystack");
        std::fs::create_dir_all(&stack_dir).unwrap();
        let compose_path = stack_dir.join("docker-compose.yml");
        std::fs::write(&compose_path, compose_yaml).unwrap();
        let backup_root = work.path().join("backups");
        std::fs::create_dir_all(&backup_root).unwrap();

        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(BackupTracker::new(store.clone(), Uuid::new_v4()));
        Fixture {
            engine: Arc::new(engine),
            store,
            tracker,
            gate: AdmissionGate::new(),
            org_id: Uuid::new_v4(),
            _work: work,
            compose_path,
            backup_root,
        }
    }

    fn runner(fixture: &Fixture) -> WorkloadBackup {
        let dedup = Arc::new(DedupIndex::new(fixture.store.clone()));
        WorkloadBackup::new(
            fixture.engine.clone(),
            fixture.store.clone(),
            dedup,
            fixture.tracker.clone(),
            fixture.gate.clone(),
            fixture.org_id,
            BackupRunnerConfig::default(),
        )
    }

    fn options(fixture: &Fixture) -> BackupOptions {
        BackupOptions {
            composition_path: fixture.compose_path.to_string_lossy().into_owned(),
            backup_root_dir: fixture.backup_root.to_string_lossy().into_owned(),
            stack_name: None,
            export_images: false,
            include_env_files: false,
            stop_containers: false,
            exclude_paths: vec![],
        }
    }

    const SINGLE_VOLUME_COMPOSE: &str = r#"
services:
  web:
    image: nginx:1.25
    volumes:
      - data:/var/www
volumes:
  data:
"#;

    #[tokio::test]
    async fn single_named_volume_backup_writes_manifest() {
        let fixture = fixture(
            SINGLE_VOLUME_COMPOSE,
            FakeEngine::with_state(|state| {
                state.volumes.push(FakeEngine::volume("mystack_data"));
            }),
        );
        let runner = runner(&fixture);
        let cancel = CancellationToken::new();

        let result = runner
            .run(&options(&fixture), &[], None, &cancel)
            .await
            .unwrap();

        let manifest = &result.manifest;
        assert_eq!(manifest.stack_name, "mystack");
        assert_eq!(manifest.dependency_order, vec!["web"]);
        assert_eq!(manifest.volumes.len(), 1);
        assert!(manifest.bind_mounts.is_empty());
        assert!(manifest.images.is_empty());
        assert!(!manifest.includes_images);

        let volume = &manifest.volumes[0];
        assert_eq!(volume.logical_name, "data");
        assert_eq!(volume.resolved_engine_name, "mystack_data");
        assert!(volume.backup_path.ends_with("volumes/mystack_data.tar.gz"));
        assert!(Path::new(&volume.backup_path).exists());

        // Total accounts for the tarball plus the copied compose file.
        let tar_len = std::fs::metadata(&volume.backup_path).unwrap().len();
        let compose_len = std::fs::metadata(&fixture.compose_path).unwrap().len();
        assert_eq!(manifest.total_size_bytes, tar_len + compose_len);

        assert!(result.backup_dir.join("manifest.json").exists());
        assert!(result.backup_dir.join("docker-compose.yml").exists());
        assert_eq!(result.job.state, JobState::Completed);
        assert_eq!(
            fixture.store.job(result.job.id).await.unwrap().state,
            JobState::Completed
        );
    }

    #[tokio::test]
    async fn manifest_hash_is_a_real_digest() {
        let fixture = fixture(
            SINGLE_VOLUME_COMPOSE,
            FakeEngine::with_state(|state| {
                state.volumes.push(FakeEngine::volume("mystack_data"));
            }),
        );
        let runner = runner(&fixture);
        let result = runner
            .run(&options(&fixture), &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            result.manifest.composition_hash,
            sha256_file(&fixture.compose_path).unwrap()
        );
        assert_eq!(result.manifest.composition_hash.len(), 64);
    }

    #[tokio::test]
    async fn excluded_bind_mount_is_skipped_with_warning() {
        let compose = r#"
services:
  app:
    image: app:1
    volumes:
      - ./data:/data
"#;
        let fixture = fixture(compose, FakeEngine::new());
        std::fs::create_dir_all(fixture.compose_path.parent().unwrap().join("data")).unwrap();
        std::fs::write(
            fixture
                .compose_path
                .parent()
                .unwrap()
                .join("data/hello.txt"),
            b"hi",
        )
        .unwrap();
        let runner = runner(&fixture);

        // First run captures the bind mount.
        let result = runner
            .run(&options(&fixture), &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.manifest.bind_mounts.len(), 1);
        assert!(Path::new(&result.manifest.bind_mounts[0].backup_path).exists());
        assert_eq!(result.manifest.bind_mounts[0].file_count, 1);

        // With the stack directory excluded it is skipped with a warning.
        let mut opts = options(&fixture);
        opts.exclude_paths = vec![fixture
            .compose_path
            .parent()
            .unwrap()
            .to_string_lossy()
            .into_owned()];
        let result = runner.run(&opts, &[], None, &CancellationToken::new()).await.unwrap();
        assert!(result.manifest.bind_mounts.is_empty());
        assert!(result.warnings.iter().any(|w| w.contains("excluded")));
    }

    #[tokio::test]
    async fn stop_containers_restarts_on_the_way_out() {
        let fixture = fixture(
            SINGLE_VOLUME_COMPOSE,
            FakeEngine::with_state(|state| {
                let mut web = FakeEngine::container("mystack-web-1", "nginx:1.25", "running");
                web.state.started_at = Some(chrono::Utc::now());
                state.containers.push(web);
                state.volumes.push(FakeEngine::volume("mystack_data"));
            }),
        );
        let runner = runner(&fixture);
        let mut opts = options(&fixture);
        opts.stop_containers = true;

        let result = runner
            .run(&opts, &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.manifest.container_states.len(), 1);
        assert_eq!(result.manifest.container_states[0].service_name, "web");

        let calls = fixture.engine.calls();
        assert!(calls.iter().any(|c| c.starts_with("stop id-mystack-web-1")));
        assert!(calls.iter().any(|c| c.starts_with("start id-mystack-web-1")));
        // Back to running after the deferred restart.
        let state = fixture.engine.state.lock().unwrap();
        assert_eq!(state.containers[0].state.status, "running");
    }

    #[tokio::test]
    async fn pause_mode_freezes_and_thaws() {
        let fixture = fixture(
            SINGLE_VOLUME_COMPOSE,
            FakeEngine::with_state(|state| {
                state
                    .containers
                    .push(FakeEngine::container("mystack-web-1", "nginx:1.25", "running"));
                state.volumes.push(FakeEngine::volume("mystack_data"));
            }),
        );
        let runner = runner(&fixture);
        runner
            .run(&options(&fixture), &[], None, &CancellationToken::new())
            .await
            .unwrap();

        let calls = fixture.engine.calls();
        let pause_idx = calls.iter().position(|c| c.starts_with("pause")).unwrap();
        let tar_idx = calls.iter().position(|c| c.starts_with("run ")).unwrap();
        let unpause_idx = calls.iter().position(|c| c.starts_with("unpause")).unwrap();
        assert!(pause_idx < tar_idx && tar_idx < unpause_idx);
    }

    #[tokio::test]
    async fn volume_failure_degrades_but_completes() {
        let fixture = fixture(
            SINGLE_VOLUME_COMPOSE,
            FakeEngine::with_state(|state| {
                state.fail.insert("run".into());
            }),
        );
        let runner = runner(&fixture);
        let result = runner
            .run(&options(&fixture), &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.manifest.volumes.is_empty());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("mystack_data")));
        assert_eq!(result.job.state, JobState::Completed);
        assert!(result.backup_dir.join("manifest.json").exists());
    }

    #[tokio::test]
    async fn image_export_dedups_across_backups() {
        let fixture = fixture(
            SINGLE_VOLUME_COMPOSE,
            FakeEngine::with_state(|state| {
                state.volumes.push(FakeEngine::volume("mystack_data"));
                state
                    .images
                    .insert("nginx:1.25".into(), FakeEngine::image("nginx:1.25", "sha256:abc", 1000));
                state
                    .image_payloads
                    .insert("nginx:1.25".into(), b"nginx-image-bytes".to_vec());
            }),
        );
        let runner = runner(&fixture);
        let mut opts = options(&fixture);
        opts.export_images = true;

        let first = runner
            .run(&opts, &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.manifest.images.len(), 1);
        assert!(!first.manifest.images[0].deduplicated);
        assert!(Path::new(&first.manifest.images[0].backup_path).exists());

        let second = runner
            .run(&opts, &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.manifest.images.len(), 1);
        assert!(second.manifest.images[0].deduplicated);
        // The artifact still points at the first backup's file; nothing new
        // landed in the second images directory.
        assert_eq!(
            second.manifest.images[0].backup_path,
            first.manifest.images[0].backup_path
        );
        let second_images: Vec<_> = std::fs::read_dir(second.backup_dir.join("images"))
            .unwrap()
            .collect();
        assert!(second_images.is_empty());

        // Only one physical export happened across both runs.
        let saves = fixture
            .engine
            .calls()
            .iter()
            .filter(|c| c.starts_with("save"))
            .count();
        assert_eq!(saves, 1);
        assert_eq!(fixture.store.image_versions().await.len(), 2);
    }

    #[tokio::test]
    async fn env_files_are_collected_when_requested() {
        let fixture = fixture(SINGLE_VOLUME_COMPOSE, FakeEngine::new());
        let stack_dir = fixture.compose_path.parent().unwrap().to_path_buf();
        std::fs::write(stack_dir.join(".env"), b"A=1").unwrap();
        std::fs::write(stack_dir.join("prod.env"), b"B=2").unwrap();
        std::fs::write(stack_dir.join("notes.txt"), b"not env").unwrap();

        let runner = runner(&fixture);
        let mut opts = options(&fixture);
        opts.include_env_files = true;
        let result = runner
            .run(&opts, &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            result.manifest.env_files,
            vec!["env/.env".to_string(), "env/prod.env".to_string()]
        );
        assert!(result.backup_dir.join("env/.env").exists());
        assert!(!result.backup_dir.join("env/notes.txt").exists());
    }

    #[tokio::test]
    async fn engine_down_fails_the_job() {
        let fixture = fixture(
            SINGLE_VOLUME_COMPOSE,
            FakeEngine::with_state(|state| {
                state.available = false;
            }),
        );
        let runner = runner(&fixture);
        let err = runner
            .run(&options(&fixture), &[], None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::EngineUnavailable(_)));
        assert_eq!(fixture.store.job_count().await, 1);
    }

    #[tokio::test]
    async fn closed_gate_rejects_new_jobs() {
        let fixture = fixture(SINGLE_VOLUME_COMPOSE, FakeEngine::new());
        fixture.gate.close();
        let runner = runner(&fixture);
        let err = runner
            .run(&options(&fixture), &[], None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ShutdownInProgress));
        // Nothing was admitted: no job row was created.
        assert_eq!(fixture.store.job_count().await, 0);
    }

    #[tokio::test]
    async fn failing_pre_hook_aborts_before_freeze() {
        let fixture = fixture(
            SINGLE_VOLUME_COMPOSE,
            FakeEngine::with_state(|state| {
                state
                    .containers
                    .push(FakeEngine::container("mystack-web-1", "nginx:1.25", "running"));
                state.exec_results.push_back(crate::core::engine::ExecOutput {
                    stdout: String::new(),
                    stderr: "dump failed".into(),
                    exit_code: 2,
                });
            }),
        );
        let runner = runner(&fixture);
        let hook = Hook {
            hook_type: HookType::Pre,
            container_name: "mystack-web-1".into(),
            template: None,
            custom_command: Some("pg_dump".into()),
            template_vars: Default::default(),
            timeout_seconds: 5,
            working_dir: None,
            user: None,
            fail_on_error: true,
            enabled: true,
        };
        let err = runner
            .run(&options(&fixture), &[hook], None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::HookFailed { exit_code: 2 }));
        // The workload was never frozen.
        assert!(!fixture.engine.calls().iter().any(|c| c.starts_with("pause")));
    }

    #[test]
    fn helpers_shape_names() {
        assert_eq!(sanitize_image_name("ghcr.io/acme/app:1.2"), "ghcr.io_acme_app_1.2");
        assert_eq!(safe_bind_name(Path::new("/srv/app/data")), "srv_app_data");
        assert!(is_env_file(".env"));
        assert!(is_env_file(".env.local"));
        assert!(is_env_file("prod.env"));
        assert!(!is_env_file("env.txt"));
        assert!(is_public_image("nginx:1.25", &[]));
        assert!(is_public_image("docker.io/library/nginx", &["docker.io".into()]));
        assert!(!is_public_image("registry.corp.internal/app:1", &["docker.io".into()]));
    }
}
