//! Scriptable in-memory engine used by feature tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::engine::{
    ConfigDetails, ConfigSummary, ContainerCreateSpec, ContainerDetails, ContainerSummary,
    Engine, EngineInfo, ExecOutput, ImageDetails, MountSpec, NetworkCreateSpec, NetworkDetails,
    NetworkSummary, NodeSummary, SecretDetails, SecretSummary, ServiceCreateSpec, ServiceDetails,
    ServiceSummary, VolumeCreateSpec, VolumeDetails, VolumeSummary,
};
use crate::core::error::{CoreError, Result};

#[derive(Default)]
pub struct FakeState {
    pub available: bool,
    pub version: String,
    pub info: EngineInfo,
    pub containers: Vec<ContainerDetails>,
    pub volumes: Vec<VolumeDetails>,
    pub images: HashMap<String, ImageDetails>,
    /// Bytes written to disk when an image is exported.
    pub image_payloads: HashMap<String, Vec<u8>>,
    /// Bytes written into the `/backup` mount when a throwaway tar runs.
    pub archive_payload: Vec<u8>,
    pub exec_results: VecDeque<ExecOutput>,
    pub services: Vec<ServiceDetails>,
    pub nodes: Vec<NodeSummary>,
    pub secrets: Vec<SecretDetails>,
    pub configs: Vec<ConfigDetails>,
    pub networks: Vec<NetworkDetails>,
    /// Status a container reports after `start`.
    pub start_status: String,
    /// Artificial latency for `exec`, for timeout tests.
    pub exec_delay_ms: u64,
    /// Operations forced to fail, by op label.
    pub fail: HashSet<String>,
    pub calls: Vec<String>,
}

pub struct FakeEngine {
    pub state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                available: true,
                version: "26.0.0".into(),
                archive_payload: b"fake-archive".to_vec(),
                start_status: "running".into(),
                ..FakeState::default()
            }),
        }
    }

    pub fn with_state(mutate: impl FnOnce(&mut FakeState)) -> Self {
        let engine = Self::new();
        mutate(&mut engine.state.lock().unwrap());
        engine
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn container(name: &str, image: &str, status: &str) -> ContainerDetails {
        let mut details = ContainerDetails::default();
        details.id = format!("id-{name}");
        details.name = format!("/{name}");
        details.image_id = format!("sha256:{name}-image");
        details.state.status = status.to_string();
        details.config.image = image.to_string();
        details
    }

    pub fn volume(name: &str) -> VolumeDetails {
        VolumeDetails {
            name: name.to_string(),
            driver: "local".into(),
            mountpoint: format!("/var/lib/engine/volumes/{name}/_data"),
            labels: None,
            scope: "local".into(),
        }
    }

    pub fn image(reference: &str, id: &str, size: u64) -> ImageDetails {
        ImageDetails {
            id: id.to_string(),
            repo_tags: vec![reference.to_string()],
            size,
        }
    }

    fn guard(&self, op: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(op.to_string());
        if !state.available {
            return Err(CoreError::EngineUnavailable(
                "Cannot connect to the Docker daemon".into(),
            ));
        }
        if state.fail.contains(op.split(' ').next().unwrap_or(op)) {
            return Err(CoreError::EngineError {
                op: op.to_string(),
                stderr_tail: "forced failure".into(),
            });
        }
        Ok(())
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn version(&self, _cancel: &CancellationToken) -> Result<String> {
        self.guard("version")?;
        Ok(self.state.lock().unwrap().version.clone())
    }

    async fn info(&self, _cancel: &CancellationToken) -> Result<EngineInfo> {
        self.guard("info")?;
        Ok(self.state.lock().unwrap().info.clone())
    }

    async fn list_containers(&self, _cancel: &CancellationToken) -> Result<Vec<ContainerSummary>> {
        self.guard("ps")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: c.short_name().to_string(),
                image: c.config.image.clone(),
                state: c.state.status.clone(),
                status: c.state.status.clone(),
                labels: String::new(),
            })
            .collect())
    }

    async fn inspect_container(
        &self,
        id: &str,
        _cancel: &CancellationToken,
    ) -> Result<ContainerDetails> {
        self.guard(&format!("inspect {id}"))?;
        let state = self.state.lock().unwrap();
        state
            .containers
            .iter()
            .find(|c| c.id == id || c.short_name() == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "container",
                name: id.to_string(),
            })
    }

    async fn pause(&self, id: &str, _cancel: &CancellationToken) -> Result<()> {
        self.guard(&format!("pause {id}"))?;
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state
            .containers
            .iter_mut()
            .find(|c| c.id == id || c.short_name() == id)
        {
            c.state.status = "paused".into();
        }
        Ok(())
    }

    async fn unpause(&self, id: &str, _cancel: &CancellationToken) -> Result<()> {
        self.guard(&format!("unpause {id}"))?;
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state
            .containers
            .iter_mut()
            .find(|c| c.id == id || c.short_name() == id)
        {
            c.state.status = "running".into();
        }
        Ok(())
    }

    async fn stop_container(
        &self,
        id: &str,
        _timeout_secs: u64,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard(&format!("stop {id}"))?;
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state
            .containers
            .iter_mut()
            .find(|c| c.id == id || c.short_name() == id)
        {
            c.state.status = "exited".into();
        }
        Ok(())
    }

    async fn start_container(&self, id: &str, _cancel: &CancellationToken) -> Result<()> {
        self.guard(&format!("start {id}"))?;
        let mut state = self.state.lock().unwrap();
        let status = state.start_status.clone();
        if let Some(c) = state
            .containers
            .iter_mut()
            .find(|c| c.id == id || c.short_name() == id)
        {
            c.state.status = status;
        }
        Ok(())
    }

    async fn remove_container(
        &self,
        name: &str,
        force: bool,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard(&format!("rm {name} force={force}"))?;
        let mut state = self.state.lock().unwrap();
        state
            .containers
            .retain(|c| c.id != name && c.short_name() != name);
        Ok(())
    }

    async fn create_container(
        &self,
        spec: &ContainerCreateSpec,
        _cancel: &CancellationToken,
    ) -> Result<String> {
        self.guard(&format!("create {}", spec.name))?;
        let mut details = Self::container(&spec.name, &spec.image, "created");
        details.config.env = spec.env.clone();
        self.state.lock().unwrap().containers.push(details.clone());
        Ok(details.id)
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard(&format!("network-connect {network} {container}"))
    }

    async fn list_volumes(&self, _cancel: &CancellationToken) -> Result<Vec<VolumeSummary>> {
        self.guard("volume-ls")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .volumes
            .iter()
            .map(|v| VolumeSummary {
                name: v.name.clone(),
                driver: v.driver.clone(),
                labels: String::new(),
                mountpoint: v.mountpoint.clone(),
            })
            .collect())
    }

    async fn inspect_volume(
        &self,
        name: &str,
        _cancel: &CancellationToken,
    ) -> Result<VolumeDetails> {
        self.guard(&format!("volume-inspect {name}"))?;
        let state = self.state.lock().unwrap();
        state
            .volumes
            .iter()
            .find(|v| v.name == name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "volume",
                name: name.to_string(),
            })
    }

    async fn create_volume(
        &self,
        spec: &VolumeCreateSpec,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard(&format!("volume-create {}", spec.name))?;
        let volume = Self::volume(&spec.name);
        self.state.lock().unwrap().volumes.push(volume);
        Ok(())
    }

    async fn remove_volume(&self, name: &str, _cancel: &CancellationToken) -> Result<()> {
        self.guard(&format!("volume-rm {name}"))?;
        self.state
            .lock()
            .unwrap()
            .volumes
            .retain(|v| v.name != name);
        Ok(())
    }

    async fn export_image(
        &self,
        reference: &str,
        path: &Path,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard(&format!("save {reference}"))?;
        let payload = {
            let state = self.state.lock().unwrap();
            state
                .image_payloads
                .get(reference)
                .cloned()
                .unwrap_or_else(|| format!("image-tar:{reference}").into_bytes())
        };
        std::fs::write(path, payload).map_err(|err| CoreError::io(path, err))?;
        Ok(())
    }

    async fn load_image(&self, path: &Path, _cancel: &CancellationToken) -> Result<()> {
        self.guard(&format!("load {}", path.display()))
    }

    async fn pull_image(&self, reference: &str, _cancel: &CancellationToken) -> Result<()> {
        self.guard(&format!("pull {reference}"))
    }

    async fn inspect_image(
        &self,
        reference: &str,
        _cancel: &CancellationToken,
    ) -> Result<ImageDetails> {
        self.guard(&format!("image-inspect {reference}"))?;
        let state = self.state.lock().unwrap();
        state
            .images
            .get(reference)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "image",
                name: reference.to_string(),
            })
    }

    async fn exec(
        &self,
        container: &str,
        argv: &[String],
        _workdir: Option<&str>,
        _user: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        self.guard(&format!("exec {container} {}", argv.join(" ")))?;
        let (known, delay_ms) = {
            let state = self.state.lock().unwrap();
            let known = state
                .containers
                .iter()
                .any(|c| c.id == container || c.short_name() == container);
            (known, state.exec_delay_ms)
        };
        if !known {
            return Err(CoreError::ContainerNotFound(container.to_string()));
        }
        if delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .exec_results
            .pop_front()
            .unwrap_or_default())
    }

    async fn run_throwaway(
        &self,
        image: &str,
        mounts: &[MountSpec],
        argv: &[String],
        _cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        self.guard(&format!("run {image} {}", argv.join(" ")))?;
        // Simulate `tar czf /backup/<name>` by materializing the archive into
        // the host side of the /backup mount.
        if argv.iter().any(|a| a == "czf") {
            if let Some(backup_mount) = mounts.iter().find(|m| m.target == "/backup") {
                if let Some(inside) = argv.iter().find(|a| a.starts_with("/backup/")) {
                    let rel = inside.trim_start_matches("/backup/");
                    let host_path = Path::new(&backup_mount.source).join(rel);
                    let payload = self.state.lock().unwrap().archive_payload.clone();
                    std::fs::write(&host_path, payload)
                        .map_err(|err| CoreError::io(host_path, err))?;
                }
            }
        }
        Ok(ExecOutput::default())
    }

    async fn list_services(&self, _cancel: &CancellationToken) -> Result<Vec<ServiceSummary>> {
        self.guard("service-ls")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .services
            .iter()
            .map(|s| ServiceSummary {
                id: s.id.clone(),
                name: s.name.clone(),
                mode: s.mode.clone(),
                image: s.image.clone(),
            })
            .collect())
    }

    async fn inspect_service(
        &self,
        id: &str,
        _cancel: &CancellationToken,
    ) -> Result<ServiceDetails> {
        self.guard(&format!("service-inspect {id}"))?;
        let state = self.state.lock().unwrap();
        state
            .services
            .iter()
            .find(|s| s.id == id || s.name == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "service",
                name: id.to_string(),
            })
    }

    async fn create_service(
        &self,
        spec: &ServiceCreateSpec,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard(&format!("service-create {}", spec.name))
    }

    async fn remove_service(&self, name: &str, _cancel: &CancellationToken) -> Result<()> {
        self.guard(&format!("service-rm {name}"))?;
        self.state
            .lock()
            .unwrap()
            .services
            .retain(|s| s.name != name && s.id != name);
        Ok(())
    }

    async fn list_nodes(&self, _cancel: &CancellationToken) -> Result<Vec<NodeSummary>> {
        self.guard("node-ls")?;
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn list_secrets(&self, _cancel: &CancellationToken) -> Result<Vec<SecretSummary>> {
        self.guard("secret-ls")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .secrets
            .iter()
            .map(|s| SecretSummary {
                id: s.id.clone(),
                name: s.name.clone(),
            })
            .collect())
    }

    async fn inspect_secret(&self, id: &str, _cancel: &CancellationToken) -> Result<SecretDetails> {
        self.guard(&format!("secret-inspect {id}"))?;
        let state = self.state.lock().unwrap();
        state
            .secrets
            .iter()
            .find(|s| s.id == id || s.name == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "secret",
                name: id.to_string(),
            })
    }

    async fn create_secret(
        &self,
        name: &str,
        _data: &[u8],
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard(&format!("secret-create {name}"))
    }

    async fn remove_secret(&self, name: &str, _cancel: &CancellationToken) -> Result<()> {
        self.guard(&format!("secret-rm {name}"))?;
        self.state
            .lock()
            .unwrap()
            .secrets
            .retain(|s| s.name != name && s.id != name);
        Ok(())
    }

    async fn list_configs(&self, _cancel: &CancellationToken) -> Result<Vec<ConfigSummary>> {
        self.guard("config-ls")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .configs
            .iter()
            .map(|c| ConfigSummary {
                id: c.id.clone(),
                name: c.name.clone(),
            })
            .collect())
    }

    async fn inspect_config(&self, id: &str, _cancel: &CancellationToken) -> Result<ConfigDetails> {
        self.guard(&format!("config-inspect {id}"))?;
        let state = self.state.lock().unwrap();
        state
            .configs
            .iter()
            .find(|c| c.id == id || c.name == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "config",
                name: id.to_string(),
            })
    }

    async fn create_config(
        &self,
        name: &str,
        _data: &[u8],
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard(&format!("config-create {name}"))
    }

    async fn remove_config(&self, name: &str, _cancel: &CancellationToken) -> Result<()> {
        self.guard(&format!("config-rm {name}"))?;
        self.state
            .lock()
            .unwrap()
            .configs
            .retain(|c| c.name != name && c.id != name);
        Ok(())
    }

    async fn list_networks(
        &self,
        scope: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<NetworkSummary>> {
        self.guard("network-ls")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .networks
            .iter()
            .filter(|n| scope.map_or(true, |s| n.scope == s))
            .map(|n| NetworkSummary {
                id: n.id.clone(),
                name: n.name.clone(),
                driver: n.driver.clone(),
                scope: n.scope.clone(),
                labels: String::new(),
            })
            .collect())
    }

    async fn inspect_network(
        &self,
        id: &str,
        _cancel: &CancellationToken,
    ) -> Result<NetworkDetails> {
        self.guard(&format!("network-inspect {id}"))?;
        let state = self.state.lock().unwrap();
        state
            .networks
            .iter()
            .find(|n| n.id == id || n.name == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "network",
                name: id.to_string(),
            })
    }

    async fn create_network(
        &self,
        spec: &NetworkCreateSpec,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard(&format!("network-create {}", spec.name))
    }

    async fn remove_network(&self, name: &str, _cancel: &CancellationToken) -> Result<()> {
        self.guard(&format!("network-rm {name}"))?;
        self.state
            .lock()
            .unwrap()
            .networks
            .retain(|n| n.name != name && n.id != name);
        Ok(())
    }
}
