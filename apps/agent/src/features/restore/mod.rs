use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keldris_types::{
    Manifest, RestoreOptions, SavedContainerConfig, SavedVolumeConfig,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::engine::{
    ContainerCreateSpec, Engine, MountSpec, PortSpec, VolumeCreateSpec,
};
use crate::core::error::{Conflict, CoreError, Result};

const PROGRESS_CHANNEL_CAPACITY: usize = 16;
const VERIFY_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Preparing,
    RestoringVolumes,
    CreatingContainer,
    Starting,
    Verifying,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub phase: RestorePhase,
    pub current_step: String,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub total_bytes: u64,
    pub restored_bytes: u64,
    pub current_volume: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub error_message: Option<String>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            phase: RestorePhase::Preparing,
            current_step: String::new(),
            total_steps: 0,
            completed_steps: 0,
            total_bytes: 0,
            restored_bytes: 0,
            current_volume: None,
            started_at: chrono::Utc::now(),
            error_message: None,
        }
    }
}

/// One progress object per restore, short critical sections only. Updates go
/// out over a bounded channel with a non-blocking send; slow observers lose
/// updates rather than stalling the restore.
pub struct ProgressTracker {
    inner: std::sync::Mutex<Progress>,
    sender: std::sync::Mutex<Option<mpsc::Sender<Progress>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(Progress::default()),
            sender: std::sync::Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<Progress> {
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        *self.sender.lock().unwrap() = Some(tx);
        rx
    }

    pub fn snapshot(&self) -> Progress {
        self.inner.lock().unwrap().clone()
    }

    fn update(&self, apply: impl FnOnce(&mut Progress)) {
        let copy = {
            let mut progress = self.inner.lock().unwrap();
            apply(&mut progress);
            progress.clone()
        };
        let sender = self.sender.lock().unwrap();
        if let Some(tx) = sender.as_ref() {
            if tx.try_send(copy).is_err() {
                debug!("restore progress update dropped");
            }
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct PlannedVolume {
    pub config: SavedVolumeConfig,
    /// Name the volume will get on the target engine (remap applied).
    pub target_name: String,
    pub archive: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RestorePlan {
    pub container: Option<SavedContainerConfig>,
    pub target_container_name: Option<String>,
    pub volumes: Vec<PlannedVolume>,
    pub conflicts: Vec<Conflict>,
    pub total_size_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOutcome {
    pub container_id: Option<String>,
    pub volumes_restored: Vec<String>,
    pub warnings: Vec<String>,
}

/// Reverse pipeline: plan with conflict detection, then recreate volumes,
/// reload data, recreate the container and optionally start and verify it.
pub struct WorkloadRestore {
    engine: Arc<dyn Engine>,
    helper_image: String,
    progress: ProgressTracker,
}

impl WorkloadRestore {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            helper_image: "alpine:3.20".into(),
            progress: ProgressTracker::new(),
        }
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Preview: load saved configs from the backup layout and probe the
    /// target engine for name conflicts. Conflicts are reported, never
    /// fatal here.
    pub async fn plan(
        &self,
        opts: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestorePlan> {
        let source = Path::new(&opts.source_dir);
        let mut plan = RestorePlan::default();

        if let Some(container_name) = &opts.container_name {
            let config_path = source
                .join("docker/containers")
                .join(container_name)
                .join("config.json");
            let config: SavedContainerConfig = read_json(&config_path)?;
            let target_name = opts
                .new_container_name
                .clone()
                .unwrap_or_else(|| config.name.clone());
            match self.engine.inspect_container(&target_name, cancel).await {
                Ok(existing) => plan.conflicts.push(Conflict {
                    entity: "container",
                    name: target_name.clone(),
                    existing_id: Some(existing.id),
                    description: format!("container {target_name} already exists"),
                }),
                Err(CoreError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
            plan.target_container_name = Some(target_name);
            plan.container = Some(config);
        }

        let volume_names = if opts.volume_names.is_empty() {
            discover_volume_names(source)
        } else {
            opts.volume_names.clone()
        };
        // The rename only applies when the plan holds exactly one volume;
        // anything else would be ambiguous.
        let remap = (volume_names.len() == 1)
            .then(|| opts.new_volume_name.clone())
            .flatten();
        for name in volume_names {
            let volume_dir = source.join("docker/volumes").join(&name);
            let config: SavedVolumeConfig = read_json(&volume_dir.join("config.json"))?;
            let archive = volume_dir.join(format!("{name}.tar.gz"));
            let target_name = remap.clone().unwrap_or_else(|| config.name.clone());
            match self.engine.inspect_volume(&target_name, cancel).await {
                Ok(_) => plan.conflicts.push(Conflict {
                    entity: "volume",
                    name: target_name.clone(),
                    existing_id: None,
                    description: format!("volume {target_name} already exists"),
                }),
                Err(CoreError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
            plan.total_size_bytes += config.size_bytes;
            plan.volumes.push(PlannedVolume {
                config,
                target_name,
                archive: archive.exists().then_some(archive),
            });
        }
        Ok(plan)
    }

    pub async fn restore(
        &self,
        opts: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome> {
        self.engine.ping(cancel).await?;
        self.progress.update(|p| {
            p.phase = RestorePhase::Preparing;
            p.current_step = "planning".into();
        });

        let plan = self.plan(opts, cancel).await?;
        if !plan.conflicts.is_empty() && !opts.overwrite_existing {
            self.progress.update(|p| {
                p.phase = RestorePhase::Failed;
                p.error_message = Some("conflicts detected".into());
            });
            return Err(CoreError::Conflicts(plan.conflicts));
        }
        if opts.overwrite_existing {
            self.remove_conflicting(&plan.conflicts, cancel).await?;
        }

        let total_steps =
            plan.volumes.len() as u32 + u32::from(plan.container.is_some());
        self.progress.update(|p| {
            p.total_steps = total_steps;
            p.total_bytes = plan.total_size_bytes;
        });

        let mut outcome = RestoreOutcome::default();
        if opts.restore_volumes {
            self.restore_volumes(&plan, &mut outcome, cancel).await?;
        }

        if let Some(config) = &plan.container {
            let target_name = plan
                .target_container_name
                .clone()
                .unwrap_or_else(|| config.name.clone());
            let container_id = self
                .recreate_container(config, &target_name, &plan, &mut outcome, cancel)
                .await?;

            if opts.start_containers {
                self.progress.update(|p| {
                    p.phase = RestorePhase::Starting;
                    p.current_step = format!("starting {target_name}");
                });
                self.engine.start_container(&container_id, cancel).await?;
                if opts.verify_start {
                    self.progress.update(|p| p.phase = RestorePhase::Verifying);
                    self.verify_running(
                        &container_id,
                        Duration::from_secs(opts.verify_timeout_secs.max(1)),
                        cancel,
                    )
                    .await?;
                }
            }
            outcome.container_id = Some(container_id);
        }

        self.progress.update(|p| {
            p.phase = RestorePhase::Completed;
            p.current_step = "done".into();
        });
        info!(
            volumes = outcome.volumes_restored.len(),
            container = outcome.container_id.as_deref().unwrap_or(""),
            "restore finished"
        );
        Ok(outcome)
    }

    async fn remove_conflicting(
        &self,
        conflicts: &[Conflict],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for conflict in conflicts {
            match conflict.entity {
                "container" => {
                    // Stop is best-effort; the forced remove is what counts.
                    if let Err(err) = self.engine.stop_container(&conflict.name, 10, cancel).await {
                        debug!(container = %conflict.name, error = %err, "pre-remove stop failed");
                    }
                    self.engine.remove_container(&conflict.name, true, cancel).await?;
                }
                "volume" => {
                    self.engine.remove_volume(&conflict.name, cancel).await?;
                }
                other => warn!(entity = other, "unknown conflict entity"),
            }
        }
        Ok(())
    }

    /// Recreate each planned volume and unpack its archive through a
    /// throwaway container. Per-volume failures degrade to warnings.
    async fn restore_volumes(
        &self,
        plan: &RestorePlan,
        outcome: &mut RestoreOutcome,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.progress.update(|p| p.phase = RestorePhase::RestoringVolumes);
        for planned in &plan.volumes {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            self.progress.update(|p| {
                p.current_volume = Some(planned.target_name.clone());
                p.current_step = format!("restoring volume {}", planned.target_name);
            });
            match self.restore_one_volume(planned, cancel).await {
                Ok(()) => {
                    outcome.volumes_restored.push(planned.target_name.clone());
                    self.progress.update(|p| {
                        p.completed_steps += 1;
                        p.restored_bytes += planned.config.size_bytes;
                    });
                }
                Err(err) => {
                    warn!(volume = %planned.target_name, error = %err, "volume restore failed");
                    outcome
                        .warnings
                        .push(format!("volume {}: {err}", planned.target_name));
                }
            }
        }
        self.progress.update(|p| p.current_volume = None);
        Ok(())
    }

    async fn restore_one_volume(
        &self,
        planned: &PlannedVolume,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = VolumeCreateSpec {
            name: planned.target_name.clone(),
            driver: Some(planned.config.driver.clone()),
            labels: planned.config.labels.clone(),
        };
        self.engine.create_volume(&spec, cancel).await?;

        let Some(archive) = &planned.archive else {
            debug!(volume = %planned.target_name, "no archive, created empty volume");
            return Ok(());
        };
        let archive_dir = archive
            .parent()
            .ok_or_else(|| CoreError::InvalidBackupData("archive has no directory".into()))?;
        let archive_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CoreError::InvalidBackupData("archive has no file name".into()))?;
        let mounts = [
            MountSpec {
                source: archive_dir.to_string_lossy().into_owned(),
                target: "/backup".into(),
                read_only: true,
            },
            MountSpec {
                source: planned.target_name.clone(),
                target: "/target".into(),
                read_only: false,
            },
        ];
        let argv = vec![
            "tar".to_string(),
            "xzf".to_string(),
            format!("/backup/{archive_name}"),
            "-C".to_string(),
            "/target".to_string(),
        ];
        let out = self
            .engine
            .run_throwaway(&self.helper_image, &mounts, &argv, cancel)
            .await?;
        if !out.success() {
            return Err(CoreError::EngineError {
                op: "volume untar".into(),
                stderr_tail: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn recreate_container(
        &self,
        config: &SavedContainerConfig,
        target_name: &str,
        plan: &RestorePlan,
        outcome: &mut RestoreOutcome,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.progress.update(|p| {
            p.phase = RestorePhase::CreatingContainer;
            p.current_step = format!("creating {target_name}");
        });

        // Volume mounts follow the remap chosen at plan time.
        let renames: HashMap<&str, &str> = plan
            .volumes
            .iter()
            .map(|v| (v.config.name.as_str(), v.target_name.as_str()))
            .collect();
        let spec = build_create_spec(config, target_name, &renames);
        let container_id = self.engine.create_container(&spec, cancel).await?;

        for network in spec.networks.iter().skip(1) {
            if let Err(err) = self.engine.connect_network(network, &container_id, cancel).await {
                warn!(network = %network, error = %err, "network attach failed");
                outcome.warnings.push(format!("network {network}: {err}"));
            }
        }
        self.progress.update(|p| p.completed_steps += 1);
        Ok(container_id)
    }

    /// Poll container state once per second until it reports running, dies,
    /// or the verification window closes.
    async fn verify_running(
        &self,
        container_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_status = String::new();
        let mut last_exit = 0i64;
        loop {
            let details = self.engine.inspect_container(container_id, cancel).await?;
            last_status = details.state.status.clone();
            last_exit = details.state.exit_code;
            match last_status.as_str() {
                "running" => return Ok(()),
                "exited" | "dead" => {
                    return Err(CoreError::ContainerStartFailed {
                        status: last_status,
                        exit_code: last_exit,
                    })
                }
                _ => {}
            }
            if tokio::time::Instant::now() + VERIFY_POLL_INTERVAL > deadline {
                break;
            }
            tokio::time::sleep(VERIFY_POLL_INTERVAL).await;
        }
        Err(CoreError::ContainerStartFailed {
            status: last_status,
            exit_code: last_exit,
        })
    }

    // -----------------------------------------------------------------
    // Manifest-driven stack restore
    // -----------------------------------------------------------------

    /// Restore the volumes, bind mounts and images recorded in a stack
    /// manifest directory. Containers are brought back by re-running the
    /// composition, which is outside this pipeline.
    pub async fn restore_stack(
        &self,
        manifest_dir: &Path,
        opts: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome> {
        self.engine.ping(cancel).await?;
        let manifest = load_manifest(manifest_dir)?;
        let mut outcome = RestoreOutcome::default();

        let mut conflicts = Vec::new();
        for volume in &manifest.volumes {
            match self
                .engine
                .inspect_volume(&volume.resolved_engine_name, cancel)
                .await
            {
                Ok(_) => conflicts.push(Conflict {
                    entity: "volume",
                    name: volume.resolved_engine_name.clone(),
                    existing_id: None,
                    description: format!("volume {} already exists", volume.resolved_engine_name),
                }),
                Err(CoreError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        if !conflicts.is_empty() && !opts.overwrite_existing {
            return Err(CoreError::Conflicts(conflicts));
        }
        if opts.overwrite_existing {
            self.remove_conflicting(&conflicts, cancel).await?;
        }

        if opts.restore_volumes {
            for volume in &manifest.volumes {
                if cancel.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                let archive = PathBuf::from(&volume.backup_path);
                let planned = PlannedVolume {
                    config: SavedVolumeConfig {
                        name: volume.resolved_engine_name.clone(),
                        driver: "local".into(),
                        labels: HashMap::new(),
                        size_bytes: volume.size_bytes,
                    },
                    target_name: volume.resolved_engine_name.clone(),
                    archive: archive.exists().then_some(archive),
                };
                if let Err(err) = self.restore_one_volume(&planned, cancel).await {
                    warn!(volume = %planned.target_name, error = %err, "volume restore failed");
                    outcome
                        .warnings
                        .push(format!("volume {}: {err}", planned.target_name));
                } else {
                    outcome.volumes_restored.push(planned.target_name);
                }
            }

            for bind in &manifest.bind_mounts {
                if cancel.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                let target = map_host_path(&bind.host_path, &opts.path_mappings);
                if let Err(err) = restore_bind_mount(&bind.backup_path, &target, cancel).await {
                    warn!(path = %target.display(), error = %err, "bind mount restore failed");
                    outcome
                        .warnings
                        .push(format!("bind mount {}: {err}", bind.host_path));
                }
            }
        }

        if opts.restore_images {
            for image in &manifest.images {
                if cancel.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                let tar = Path::new(&image.backup_path);
                if !tar.exists() {
                    outcome
                        .warnings
                        .push(format!("image {} archive missing", image.reference));
                    continue;
                }
                if let Err(err) = self.engine.load_image(tar, cancel).await {
                    warn!(image = %image.reference, error = %err, "image load failed");
                    outcome
                        .warnings
                        .push(format!("image {}: {err}", image.reference));
                }
            }
        }

        Ok(outcome)
    }
}

/// Read and version-gate a manifest from its backup directory.
pub fn load_manifest(manifest_dir: &Path) -> Result<Manifest> {
    let path = manifest_dir.join("manifest.json");
    let manifest: Manifest = read_json(&path)?;
    if !Manifest::version_compatible(&manifest.version) {
        return Err(CoreError::InvalidBackupData(format!(
            "unsupported manifest version {}",
            manifest.version
        )));
    }
    Ok(manifest)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            CoreError::InvalidBackupData(format!("missing {}", path.display()))
        } else {
            CoreError::io(path, err)
        }
    })?;
    serde_json::from_slice(&raw).map_err(|err| {
        CoreError::InvalidBackupData(format!("{}: {err}", path.display()))
    })
}

fn discover_volume_names(source: &Path) -> Vec<String> {
    let volumes_dir = source.join("docker/volumes");
    let mut names = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&volumes_dir) {
        for entry in entries.flatten() {
            if entry.path().join("config.json").exists() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    names.sort();
    names
}

fn map_host_path(original: &str, mappings: &HashMap<String, String>) -> PathBuf {
    for (from, to) in mappings {
        if let Some(rest) = original.strip_prefix(from.as_str()) {
            return PathBuf::from(format!("{to}{rest}"));
        }
    }
    PathBuf::from(original)
}

async fn restore_bind_mount(
    archive: &str,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| CoreError::io(target, std::io::Error::other("no parent directory")))?;
    std::fs::create_dir_all(parent).map_err(|err| CoreError::io(parent, err))?;

    let mut cmd = tokio::process::Command::new("tar");
    cmd.args(["xzf", archive, "-C"])
        .arg(parent)
        .kill_on_drop(true);
    let output = tokio::select! {
        out = cmd.output() => out.map_err(|err| CoreError::io("tar", err))?,
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

/// Translate a saved container config into the engine create invocation,
/// applying the container rename and any volume renames.
fn build_create_spec(
    config: &SavedContainerConfig,
    target_name: &str,
    volume_renames: &HashMap<&str, &str>,
) -> ContainerCreateSpec {
    ContainerCreateSpec {
        name: target_name.to_string(),
        image: config.image.clone(),
        env: config.env.clone(),
        labels: config.labels.clone(),
        mounts: config
            .mounts
            .iter()
            .map(|m| {
                let source = if m.kind == "volume" {
                    volume_renames
                        .get(m.source.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| m.source.clone())
                } else {
                    m.source.clone()
                };
                MountSpec {
                    source,
                    target: m.target.clone(),
                    read_only: m.read_only,
                }
            })
            .collect(),
        ports: config
            .ports
            .iter()
            .map(|p| PortSpec {
                host_ip: p.host_ip.clone(),
                host_port: p.host_port,
                container_port: p.container_port,
                protocol: p.protocol.clone(),
            })
            .collect(),
        networks: config.networks.clone(),
        restart_policy: config.restart_policy.clone(),
        working_dir: config.working_dir.clone(),
        user: config.user.clone(),
        hostname: config.hostname.clone(),
        command: config.command.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::FakeEngine;
    use keldris_types::{SavedMount, SavedPort};

    fn saved_container(name: &str) -> SavedContainerConfig {
        SavedContainerConfig {
            name: name.to_string(),
            image: "nginx:1.25".into(),
            env: vec!["A=1".into()],
            labels: HashMap::new(),
            mounts: vec![SavedMount {
                kind: "volume".into(),
                source: "web_data".into(),
                target: "/var/www".into(),
                read_only: false,
            }],
            ports: vec![SavedPort {
                container_port: 80,
                host_port: 8080,
                protocol: "tcp".into(),
                host_ip: None,
            }],
            networks: vec!["frontend".into()],
            restart_policy: Some("always".into()),
            command: vec![],
            working_dir: None,
            user: None,
            hostname: None,
        }
    }

    fn write_layout(dir: &Path, container: Option<&SavedContainerConfig>, volumes: &[&str]) {
        if let Some(config) = container {
            let cdir = dir.join("docker/containers").join(&config.name);
            std::fs::create_dir_all(&cdir).unwrap();
            std::fs::write(
                cdir.join("config.json"),
                serde_json::to_vec_pretty(config).unwrap(),
            )
            .unwrap();
        }
        for name in volumes {
            let vdir = dir.join("docker/volumes").join(name);
            std::fs::create_dir_all(&vdir).unwrap();
            let config = SavedVolumeConfig {
                name: name.to_string(),
                driver: "local".into(),
                labels: HashMap::new(),
                size_bytes: 100,
            };
            std::fs::write(
                vdir.join("config.json"),
                serde_json::to_vec_pretty(&config).unwrap(),
            )
            .unwrap();
            std::fs::write(vdir.join(format!("{name}.tar.gz")), b"tarball").unwrap();
        }
    }

    fn restore_opts(source: &Path) -> RestoreOptions {
        RestoreOptions {
            source_dir: source.to_string_lossy().into_owned(),
            container_name: None,
            volume_names: vec![],
            restore_volumes: true,
            restore_images: false,
            path_mappings: HashMap::new(),
            start_containers: false,
            new_container_name: None,
            new_volume_name: None,
            overwrite_existing: false,
            verify_start: false,
            verify_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn plan_reports_conflicts_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let config = saved_container("web");
        write_layout(dir.path(), Some(&config), &["web_data"]);

        let engine = Arc::new(FakeEngine::with_state(|state| {
            state
                .containers
                .push(FakeEngine::container("web", "nginx:1.24", "running"));
            state.volumes.push(FakeEngine::volume("web_data"));
        }));
        let restore = WorkloadRestore::new(engine);
        let mut opts = restore_opts(dir.path());
        opts.container_name = Some("web".into());

        let plan = restore.plan(&opts, &CancellationToken::new()).await.unwrap();
        assert_eq!(plan.conflicts.len(), 2);
        assert!(plan.conflicts.iter().any(|c| c.entity == "container"));
        assert!(plan.conflicts.iter().any(|c| c.entity == "volume"));
        assert_eq!(plan.total_size_bytes, 100);
    }

    #[tokio::test]
    async fn conflicts_fail_fast_and_leave_engine_untouched() {
        let dir = tempfile::tempdir().unwrap();
        write_layout(dir.path(), Some(&saved_container("web")), &[]);

        let engine = Arc::new(FakeEngine::with_state(|state| {
            state
                .containers
                .push(FakeEngine::container("web", "nginx:1.24", "running"));
        }));
        let restore = WorkloadRestore::new(engine.clone());
        let mut opts = restore_opts(dir.path());
        opts.container_name = Some("web".into());

        let err = restore
            .restore(&opts, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            CoreError::Conflicts(conflicts) => assert_eq!(conflicts.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
        let calls = engine.calls();
        assert!(!calls.iter().any(|c| c.starts_with("rm ")));
        assert!(!calls.iter().any(|c| c.starts_with("create ")));
    }

    #[tokio::test]
    async fn overwrite_replaces_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        write_layout(dir.path(), Some(&saved_container("web")), &["web_data"]);

        let engine = Arc::new(FakeEngine::with_state(|state| {
            state
                .containers
                .push(FakeEngine::container("web", "nginx:1.24", "running"));
        }));
        let restore = WorkloadRestore::new(engine.clone());
        let mut opts = restore_opts(dir.path());
        opts.container_name = Some("web".into());
        opts.overwrite_existing = true;
        opts.start_containers = true;
        opts.verify_start = true;

        let outcome = restore
            .restore(&opts, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.volumes_restored, vec!["web_data"]);
        let container_id = outcome.container_id.unwrap();

        let calls = engine.calls();
        assert!(calls.iter().any(|c| c.starts_with("rm web force=true")));
        assert!(calls.iter().any(|c| c.starts_with("create web")));
        assert!(calls.iter().any(|c| c == &format!("start {container_id}")));
        assert_eq!(
            restore.progress().snapshot().phase,
            RestorePhase::Completed
        );
    }

    #[tokio::test]
    async fn verify_rejects_exited_container() {
        let dir = tempfile::tempdir().unwrap();
        write_layout(dir.path(), Some(&saved_container("web")), &[]);

        let engine = Arc::new(FakeEngine::with_state(|state| {
            state.start_status = "exited".into();
        }));
        let restore = WorkloadRestore::new(engine);
        let mut opts = restore_opts(dir.path());
        opts.container_name = Some("web".into());
        opts.start_containers = true;
        opts.verify_start = true;

        let err = restore
            .restore(&opts, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::ContainerStartFailed { ref status, .. } if status == "exited"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn verify_times_out_on_stuck_container() {
        let dir = tempfile::tempdir().unwrap();
        write_layout(dir.path(), Some(&saved_container("web")), &[]);

        let engine = Arc::new(FakeEngine::with_state(|state| {
            state.start_status = "created".into();
        }));
        let restore = WorkloadRestore::new(engine);
        let mut opts = restore_opts(dir.path());
        opts.container_name = Some("web".into());
        opts.start_containers = true;
        opts.verify_start = true;
        opts.verify_timeout_secs = 3;

        let err = restore
            .restore(&opts, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ContainerStartFailed { .. }));
    }

    #[tokio::test]
    async fn single_volume_remap_applies() {
        let dir = tempfile::tempdir().unwrap();
        write_layout(dir.path(), None, &["web_data"]);

        let engine = Arc::new(FakeEngine::new());
        let restore = WorkloadRestore::new(engine.clone());
        let mut opts = restore_opts(dir.path());
        opts.new_volume_name = Some("web_data_copy".into());

        let outcome = restore
            .restore(&opts, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.volumes_restored, vec!["web_data_copy"]);
        assert!(engine
            .calls()
            .iter()
            .any(|c| c == "volume-create web_data_copy"));
    }

    #[tokio::test]
    async fn remap_is_ignored_for_multiple_volumes() {
        let dir = tempfile::tempdir().unwrap();
        write_layout(dir.path(), None, &["a_data", "b_data"]);

        let engine = Arc::new(FakeEngine::new());
        let restore = WorkloadRestore::new(engine);
        let mut opts = restore_opts(dir.path());
        opts.new_volume_name = Some("renamed".into());

        let plan = restore.plan(&opts, &CancellationToken::new()).await.unwrap();
        let names: Vec<_> = plan.volumes.iter().map(|v| v.target_name.as_str()).collect();
        assert_eq!(names, vec!["a_data", "b_data"]);
    }

    #[tokio::test]
    async fn failed_volume_degrades_to_warning() {
        let dir = tempfile::tempdir().unwrap();
        write_layout(dir.path(), None, &["web_data"]);

        let engine = Arc::new(FakeEngine::with_state(|state| {
            state.fail.insert("run".into());
        }));
        let restore = WorkloadRestore::new(engine);
        let opts = restore_opts(dir.path());

        let outcome = restore
            .restore(&opts, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.volumes_restored.is_empty());
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test]
    async fn manifest_version_gate_rejects_major_bump() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = serde_json::json!({
            "version": "2.0",
            "stack_name": "s",
            "composition_path": "/x",
            "composition_hash": "h",
            "timestamp": chrono::Utc::now(),
            "container_states": [],
            "volumes": [],
            "bind_mounts": [],
            "images": [],
            "dependency_order": [],
            "total_size_bytes": 0,
            "includes_images": false
        });
        std::fs::write(
            dir.path().join("manifest.json"),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            load_manifest(dir.path()).unwrap_err(),
            CoreError::InvalidBackupData(_)
        ));
    }

    #[tokio::test]
    async fn progress_channel_drops_when_full() {
        let tracker = ProgressTracker::new();
        let mut rx = tracker.subscribe();
        for i in 0..40 {
            tracker.update(|p| p.completed_steps = i);
        }
        // The producer never blocked; at most the channel capacity arrived.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= 16);
        assert!(received > 0);
        assert_eq!(tracker.snapshot().completed_steps, 39);
    }

    #[tokio::test]
    async fn stack_restore_recreates_volumes_and_loads_images() {
        let dir = tempfile::tempdir().unwrap();
        let tar = dir.path().join("web_data.tar.gz");
        std::fs::write(&tar, b"tarball").unwrap();
        let image_tar = dir.path().join("nginx_1.25.tar");
        std::fs::write(&image_tar, b"image").unwrap();

        let manifest = serde_json::json!({
            "version": "1.0",
            "stack_name": "web",
            "composition_path": "/srv/web/docker-compose.yml",
            "composition_hash": "h",
            "timestamp": chrono::Utc::now(),
            "container_states": [],
            "volumes": [{
                "logical_name": "data",
                "resolved_engine_name": "web_data",
                "mount_path": "/var/www",
                "backup_path": tar.to_string_lossy(),
                "size_bytes": 7,
                "file_count": 1,
                "backed_up_at": chrono::Utc::now()
            }],
            "bind_mounts": [],
            "images": [{
                "reference": "nginx:1.25",
                "image_id": "sha256:abc",
                "tags": ["nginx:1.25"],
                "size_bytes": 5,
                "backup_path": image_tar.to_string_lossy(),
                "backed_up_at": chrono::Utc::now()
            }],
            "dependency_order": ["web"],
            "total_size_bytes": 12,
            "includes_images": true
        });
        std::fs::write(
            dir.path().join("manifest.json"),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();

        let engine = Arc::new(FakeEngine::new());
        let restore = WorkloadRestore::new(engine.clone());
        let mut opts = restore_opts(dir.path());
        opts.restore_images = true;

        let outcome = restore
            .restore_stack(dir.path(), &opts, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.volumes_restored, vec!["web_data"]);
        assert!(outcome.warnings.is_empty());

        let calls = engine.calls();
        assert!(calls.iter().any(|c| c == "volume-create web_data"));
        assert!(calls.iter().any(|c| c.contains("xzf")));
        assert!(calls
            .iter()
            .any(|c| c.starts_with("load") && c.contains("nginx_1.25.tar")));
    }

    #[test]
    fn host_path_mapping_rewrites_prefixes() {
        let mappings = HashMap::from([("/srv/app".to_string(), "/data/app".to_string())]);
        assert_eq!(
            map_host_path("/srv/app/files", &mappings),
            PathBuf::from("/data/app/files")
        );
        assert_eq!(
            map_host_path("/other/files", &mappings),
            PathBuf::from("/other/files")
        );
    }
}
