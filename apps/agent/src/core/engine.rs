use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::error::{CoreError, Result};

/// Substrings the engine CLI emits when its daemon endpoint is unreachable.
const DAEMON_DOWN_MARKERS: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "Is the docker daemon running",
];

const STDERR_TAIL_BYTES: usize = 512;

// ---------------------------------------------------------------------------
// Engine-side data types
// ---------------------------------------------------------------------------

/// One line of `ps --format '{{json .}}'` output.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: String,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Labels", default)]
    pub labels: String,
}

impl ContainerSummary {
    pub fn label_map(&self) -> HashMap<String, String> {
        parse_label_csv(&self.labels)
    }

    pub fn first_name(&self) -> &str {
        self.names.split(',').next().unwrap_or("").trim()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerHealth {
    #[serde(rename = "Status", default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerRunState {
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i64,
    #[serde(rename = "StartedAt", default)]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "Health", default)]
    pub health: Option<ContainerHealth>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerConfigSection {
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: String,
    #[serde(rename = "User", default)]
    pub user: String,
    #[serde(rename = "Hostname", default)]
    pub hostname: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MountDetails {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "Source", default)]
    pub source: String,
    #[serde(rename = "Destination", default)]
    pub destination: String,
    #[serde(rename = "RW", default = "default_rw")]
    pub rw: bool,
}

fn default_rw() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestartPolicyDetails {
    #[serde(rename = "Name", default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortBindingDetails {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfigDetails {
    #[serde(rename = "RestartPolicy", default)]
    pub restart_policy: Option<RestartPolicyDetails>,
    #[serde(rename = "PortBindings", default)]
    pub port_bindings: Option<HashMap<String, Option<Vec<PortBindingDetails>>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSettingsDetails {
    #[serde(rename = "Networks", default)]
    pub networks: HashMap<String, serde_json::Value>,
}

/// One element of an `inspect` array for a container.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerDetails {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Created", default)]
    pub created: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "Image", default)]
    pub image_id: String,
    #[serde(rename = "State", default)]
    pub state: ContainerRunState,
    #[serde(rename = "Config", default)]
    pub config: ContainerConfigSection,
    #[serde(rename = "Mounts", default)]
    pub mounts: Vec<MountDetails>,
    #[serde(rename = "HostConfig", default)]
    pub host_config: HostConfigDetails,
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettingsDetails,
}

impl ContainerDetails {
    /// Inspect reports names with a leading slash.
    pub fn short_name(&self) -> &str {
        self.name.trim_start_matches('/')
    }

    pub fn health_status(&self) -> String {
        self.state
            .health
            .as_ref()
            .map(|h| h.status.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeSummary {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Driver", default)]
    pub driver: String,
    #[serde(rename = "Labels", default)]
    pub labels: String,
    #[serde(rename = "Mountpoint", default)]
    pub mountpoint: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeDetails {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Driver", default)]
    pub driver: String,
    #[serde(rename = "Mountpoint", default)]
    pub mountpoint: String,
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(rename = "Scope", default)]
    pub scope: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageDetails {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Size", default)]
    pub size: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSummary {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Driver", default)]
    pub driver: String,
    #[serde(rename = "Scope", default)]
    pub scope: String,
    #[serde(rename = "Labels", default)]
    pub labels: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpamConfigDetails {
    #[serde(rename = "Subnet", default)]
    pub subnet: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpamDetails {
    #[serde(rename = "Config", default)]
    pub config: Option<Vec<IpamConfigDetails>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkDetails {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Driver", default)]
    pub driver: String,
    #[serde(rename = "Scope", default)]
    pub scope: String,
    #[serde(rename = "Attachable", default)]
    pub attachable: bool,
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(rename = "IPAM", default)]
    pub ipam: IpamDetails,
}

impl NetworkDetails {
    pub fn subnets(&self) -> Vec<String> {
        self.ipam
            .config
            .as_ref()
            .map(|cfgs| cfgs.iter().map(|c| c.subnet.clone()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceSummary {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Mode", default)]
    pub mode: String,
    #[serde(rename = "Image", default)]
    pub image: String,
}

/// Detailed service inspect. The raw spec is kept verbatim so a restore can
/// recreate everything the typed fields do not model.
#[derive(Debug, Clone, Default)]
pub struct ServiceDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub mode: String,
    pub replicas: Option<u64>,
    pub labels: HashMap<String, String>,
    pub raw: serde_json::Value,
}

impl ServiceDetails {
    pub fn from_raw(raw: serde_json::Value) -> Self {
        let spec = &raw["Spec"];
        let labels = spec["Labels"]
            .as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let (mode, replicas) = if let Some(r) = spec["Mode"]["Replicated"]["Replicas"].as_u64() {
            ("replicated".to_string(), Some(r))
        } else if spec["Mode"]["Global"].is_object() {
            ("global".to_string(), None)
        } else {
            ("replicated".to_string(), None)
        };
        Self {
            id: raw["ID"].as_str().unwrap_or_default().to_string(),
            name: spec["Name"].as_str().unwrap_or_default().to_string(),
            image: spec["TaskTemplate"]["ContainerSpec"]["Image"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            mode,
            replicas,
            labels,
            raw,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeSummary {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Hostname", default)]
    pub hostname: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Availability", default)]
    pub availability: String,
    #[serde(rename = "ManagerStatus", default)]
    pub manager_status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecretSummary {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct SecretDetails {
    pub id: String,
    pub name: String,
    pub version: u64,
    pub labels: HashMap<String, String>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigSummary {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigDetails {
    pub id: String,
    pub name: String,
    /// Base64-encoded payload, as reported by the engine.
    pub data_base64: String,
    pub labels: HashMap<String, String>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwarmClusterInfo {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "CreatedAt", default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwarmInfo {
    #[serde(rename = "LocalNodeState", default)]
    pub local_node_state: String,
    #[serde(rename = "ControlAvailable", default)]
    pub control_available: bool,
    #[serde(rename = "Cluster", default)]
    pub cluster: Option<SwarmClusterInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineInfo {
    #[serde(rename = "ServerVersion", default)]
    pub server_version: String,
    #[serde(rename = "Swarm", default)]
    pub swarm: SwarmInfo,
}

impl EngineInfo {
    pub fn is_active_manager(&self) -> bool {
        self.swarm.local_node_state == "active" && self.swarm.control_available
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl MountSpec {
    pub fn flag(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VolumeCreateSpec {
    pub name: String,
    pub driver: Option<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkCreateSpec {
    pub name: String,
    pub driver: String,
    pub attachable: bool,
    pub labels: HashMap<String, String>,
    pub subnets: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PortSpec {
    pub host_ip: Option<String>,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

impl PortSpec {
    pub fn flag(&self) -> String {
        let proto = if self.protocol.is_empty() {
            "tcp"
        } else {
            &self.protocol
        };
        match &self.host_ip {
            Some(ip) if !ip.is_empty() => {
                format!("{}:{}:{}/{}", ip, self.host_port, self.container_port, proto)
            }
            _ => format!("{}:{}/{}", self.host_port, self.container_port, proto),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContainerCreateSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub ports: Vec<PortSpec>,
    pub networks: Vec<String>,
    pub restart_policy: Option<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceCreateSpec {
    pub name: String,
    pub image: String,
    pub replicas: Option<u64>,
    pub labels: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// The capability bundle every other component depends on
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Engine: Send + Sync {
    async fn version(&self, cancel: &CancellationToken) -> Result<String>;
    async fn info(&self, cancel: &CancellationToken) -> Result<EngineInfo>;

    async fn list_containers(&self, cancel: &CancellationToken) -> Result<Vec<ContainerSummary>>;
    async fn inspect_container(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerDetails>;
    async fn pause(&self, id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn unpause(&self, id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn stop_container(
        &self,
        id: &str,
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<()>;
    async fn start_container(&self, id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn remove_container(
        &self,
        name: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<()>;
    async fn create_container(
        &self,
        spec: &ContainerCreateSpec,
        cancel: &CancellationToken,
    ) -> Result<String>;
    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn list_volumes(&self, cancel: &CancellationToken) -> Result<Vec<VolumeSummary>>;
    async fn inspect_volume(&self, name: &str, cancel: &CancellationToken)
        -> Result<VolumeDetails>;
    async fn create_volume(
        &self,
        spec: &VolumeCreateSpec,
        cancel: &CancellationToken,
    ) -> Result<()>;
    async fn remove_volume(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    async fn export_image(
        &self,
        reference: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;
    async fn load_image(&self, path: &Path, cancel: &CancellationToken) -> Result<()>;
    async fn pull_image(&self, reference: &str, cancel: &CancellationToken) -> Result<()>;
    async fn inspect_image(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<ImageDetails>;

    async fn exec(
        &self,
        container: &str,
        argv: &[String],
        workdir: Option<&str>,
        user: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput>;
    async fn run_throwaway(
        &self,
        image: &str,
        mounts: &[MountSpec],
        argv: &[String],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput>;

    async fn list_services(&self, cancel: &CancellationToken) -> Result<Vec<ServiceSummary>>;
    async fn inspect_service(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ServiceDetails>;
    async fn create_service(
        &self,
        spec: &ServiceCreateSpec,
        cancel: &CancellationToken,
    ) -> Result<()>;
    async fn remove_service(&self, name: &str, cancel: &CancellationToken) -> Result<()>;
    async fn list_nodes(&self, cancel: &CancellationToken) -> Result<Vec<NodeSummary>>;

    async fn list_secrets(&self, cancel: &CancellationToken) -> Result<Vec<SecretSummary>>;
    async fn inspect_secret(&self, id: &str, cancel: &CancellationToken) -> Result<SecretDetails>;
    async fn create_secret(
        &self,
        name: &str,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()>;
    async fn remove_secret(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    async fn list_configs(&self, cancel: &CancellationToken) -> Result<Vec<ConfigSummary>>;
    async fn inspect_config(&self, id: &str, cancel: &CancellationToken) -> Result<ConfigDetails>;
    async fn create_config(
        &self,
        name: &str,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()>;
    async fn remove_config(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    async fn list_networks(
        &self,
        scope: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<NetworkSummary>>;
    async fn inspect_network(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<NetworkDetails>;
    async fn create_network(
        &self,
        spec: &NetworkCreateSpec,
        cancel: &CancellationToken,
    ) -> Result<()>;
    async fn remove_network(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    /// Availability probe; `Ok` means the daemon answered a version query.
    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.version(cancel).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// CLI-driven implementation
// ---------------------------------------------------------------------------

/// Adapter over the engine command-line binary. The binary path is a
/// configuration input; everything is read through `--format '{{json .}}'`
/// structured output.
pub struct CliEngine {
    binary: String,
}

impl CliEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run the engine binary and capture output without judging the exit
    /// status. The child is killed if `cancel` trips.
    async fn output(
        &self,
        op: &'static str,
        args: &[String],
        stdin: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        debug!(op, "invoking engine");
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            CoreError::EngineUnavailable(format!("failed to spawn {}: {err}", self.binary))
        })?;

        if let Some(data) = stdin {
            if let Some(mut handle) = child.stdin.take() {
                handle
                    .write_all(data)
                    .await
                    .map_err(|err| CoreError::EngineError {
                        op: op.to_string(),
                        stderr_tail: format!("writing stdin: {err}"),
                    })?;
            }
        }

        let output = tokio::select! {
            out = child.wait_with_output() => out.map_err(|err| CoreError::EngineError {
                op: op.to_string(),
                stderr_tail: err.to_string(),
            })?,
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
        };

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1) as i64,
        })
    }

    /// Run and fail on a non-zero exit, classifying the stderr.
    async fn run(
        &self,
        op: &'static str,
        subject: Option<(&'static str, &str)>,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let out = self.output(op, args, None, cancel).await?;
        if out.success() {
            return Ok(out.stdout);
        }
        Err(classify_failure(op, subject, &out.stderr))
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Map a failed engine invocation to the error taxonomy.
fn classify_failure(
    op: &'static str,
    subject: Option<(&'static str, &str)>,
    stderr: &str,
) -> CoreError {
    if DAEMON_DOWN_MARKERS.iter().any(|m| stderr.contains(m)) {
        return CoreError::EngineUnavailable(stderr_tail(stderr));
    }
    if let Some((entity, name)) = subject {
        if stderr.contains("No such") || stderr.contains("no such") || stderr.contains("not found")
        {
            return CoreError::NotFound {
                entity,
                name: name.to_string(),
            };
        }
    }
    CoreError::EngineError {
        op: op.to_string(),
        stderr_tail: stderr_tail(stderr),
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let cut = trimmed.len() - STDERR_TAIL_BYTES;
    // Stay on a char boundary.
    let mut start = cut;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

/// Parse one-JSON-object-per-line listing output. Malformed lines are skipped
/// with a warning, never fatal.
pub fn parse_json_lines<T: DeserializeOwned>(stdout: &str) -> Vec<T> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<T>(line) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(error = %err, line, "skipping malformed engine output line");
                None
            }
        })
        .collect()
}

/// Parse a single-entity inspect result (a one-element JSON array).
fn parse_inspect<T: DeserializeOwned>(
    stdout: &str,
    entity: &'static str,
    name: &str,
) -> Result<T> {
    let mut values: Vec<T> =
        serde_json::from_str(stdout).map_err(|err| CoreError::EngineError {
            op: format!("{entity} inspect"),
            stderr_tail: err.to_string(),
        })?;
    if values.is_empty() {
        return Err(CoreError::NotFound {
            entity,
            name: name.to_string(),
        });
    }
    Ok(values.remove(0))
}

/// Parse flattened `k1=v1,k2=v2` labels into a map. Whitespace is trimmed and
/// pairs without `=` are dropped.
pub fn parse_label_csv(labels: &str) -> HashMap<String, String> {
    labels
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn container_create_args(spec: &ContainerCreateSpec) -> Vec<String> {
    let mut out = args(&["create", "--name", &spec.name]);
    for env in &spec.env {
        out.push("-e".into());
        out.push(env.clone());
    }
    let mut labels: Vec<_> = spec.labels.iter().collect();
    labels.sort();
    for (key, value) in labels {
        out.push("--label".into());
        out.push(format!("{key}={value}"));
    }
    for mount in &spec.mounts {
        out.push("-v".into());
        out.push(mount.flag());
    }
    for port in &spec.ports {
        out.push("-p".into());
        out.push(port.flag());
    }
    if let Some(network) = spec.networks.first() {
        out.push("--network".into());
        out.push(network.clone());
    }
    if let Some(policy) = &spec.restart_policy {
        if !policy.is_empty() {
            out.push("--restart".into());
            out.push(policy.clone());
        }
    }
    if let Some(dir) = &spec.working_dir {
        if !dir.is_empty() {
            out.push("-w".into());
            out.push(dir.clone());
        }
    }
    if let Some(user) = &spec.user {
        if !user.is_empty() {
            out.push("-u".into());
            out.push(user.clone());
        }
    }
    if let Some(host) = &spec.hostname {
        if !host.is_empty() {
            out.push("--hostname".into());
            out.push(host.clone());
        }
    }
    out.push(spec.image.clone());
    out.extend(spec.command.iter().cloned());
    out
}

fn throwaway_args(image: &str, mounts: &[MountSpec], argv: &[String]) -> Vec<String> {
    let mut out = args(&["run", "--rm"]);
    for mount in mounts {
        out.push("-v".into());
        out.push(mount.flag());
    }
    out.push(image.to_string());
    out.extend(argv.iter().cloned());
    out
}

#[async_trait]
impl Engine for CliEngine {
    async fn version(&self, cancel: &CancellationToken) -> Result<String> {
        let stdout = self
            .run(
                "version",
                None,
                &args(&["version", "--format", "{{json .}}"]),
                cancel,
            )
            .await?;
        let value: serde_json::Value =
            serde_json::from_str(stdout.trim()).map_err(|err| CoreError::EngineError {
                op: "version".into(),
                stderr_tail: err.to_string(),
            })?;
        let version = value["Server"]["Version"]
            .as_str()
            .or_else(|| value["Client"]["Version"].as_str())
            .unwrap_or_default()
            .to_string();
        if version.is_empty() {
            return Err(CoreError::EngineUnavailable(
                "engine reported no server version".into(),
            ));
        }
        Ok(version)
    }

    async fn info(&self, cancel: &CancellationToken) -> Result<EngineInfo> {
        let stdout = self
            .run(
                "info",
                None,
                &args(&["info", "--format", "{{json .}}"]),
                cancel,
            )
            .await?;
        serde_json::from_str(stdout.trim()).map_err(|err| CoreError::EngineError {
            op: "info".into(),
            stderr_tail: err.to_string(),
        })
    }

    async fn list_containers(&self, cancel: &CancellationToken) -> Result<Vec<ContainerSummary>> {
        let stdout = self
            .run(
                "ps",
                None,
                &args(&["ps", "-a", "--format", "{{json .}}"]),
                cancel,
            )
            .await?;
        Ok(parse_json_lines(&stdout))
    }

    async fn inspect_container(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerDetails> {
        let stdout = self
            .run(
                "container inspect",
                Some(("container", id)),
                &args(&["inspect", "--type", "container", id]),
                cancel,
            )
            .await?;
        parse_inspect(&stdout, "container", id)
    }

    async fn pause(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(
            "pause",
            Some(("container", id)),
            &args(&["pause", id]),
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn unpause(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(
            "unpause",
            Some(("container", id)),
            &args(&["unpause", id]),
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn stop_container(
        &self,
        id: &str,
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeout = timeout_secs.to_string();
        self.run(
            "stop",
            Some(("container", id)),
            &args(&["stop", "-t", &timeout, id]),
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn start_container(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(
            "start",
            Some(("container", id)),
            &args(&["start", id]),
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn remove_container(
        &self,
        name: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut cmd_args = args(&["rm"]);
        if force {
            cmd_args.push("-f".into());
        }
        cmd_args.push(name.to_string());
        self.run("rm", Some(("container", name)), &cmd_args, cancel)
            .await
            .map(|_| ())
    }

    async fn create_container(
        &self,
        spec: &ContainerCreateSpec,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let stdout = self
            .run("create", None, &container_create_args(spec), cancel)
            .await?;
        Ok(stdout.trim().to_string())
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run(
            "network connect",
            Some(("network", network)),
            &args(&["network", "connect", network, container]),
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn list_volumes(&self, cancel: &CancellationToken) -> Result<Vec<VolumeSummary>> {
        let stdout = self
            .run(
                "volume ls",
                None,
                &args(&["volume", "ls", "--format", "{{json .}}"]),
                cancel,
            )
            .await?;
        Ok(parse_json_lines(&stdout))
    }

    async fn inspect_volume(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<VolumeDetails> {
        let stdout = self
            .run(
                "volume inspect",
                Some(("volume", name)),
                &args(&["volume", "inspect", name]),
                cancel,
            )
            .await?;
        parse_inspect(&stdout, "volume", name)
    }

    async fn create_volume(
        &self,
        spec: &VolumeCreateSpec,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut cmd_args = args(&["volume", "create"]);
        if let Some(driver) = &spec.driver {
            cmd_args.push("--driver".into());
            cmd_args.push(driver.clone());
        }
        let mut labels: Vec<_> = spec.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            cmd_args.push("--label".into());
            cmd_args.push(format!("{key}={value}"));
        }
        cmd_args.push(spec.name.clone());
        self.run("volume create", None, &cmd_args, cancel)
            .await
            .map(|_| ())
    }

    async fn remove_volume(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(
            "volume rm",
            Some(("volume", name)),
            &args(&["volume", "rm", name]),
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn export_image(
        &self,
        reference: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let path = path.to_string_lossy().into_owned();
        self.run(
            "save",
            Some(("image", reference)),
            &args(&["save", "-o", &path, reference]),
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn load_image(&self, path: &Path, cancel: &CancellationToken) -> Result<()> {
        let path = path.to_string_lossy().into_owned();
        self.run("load", None, &args(&["load", "-i", &path]), cancel)
            .await
            .map(|_| ())
    }

    async fn pull_image(&self, reference: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(
            "pull",
            Some(("image", reference)),
            &args(&["pull", reference]),
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn inspect_image(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<ImageDetails> {
        let stdout = self
            .run(
                "image inspect",
                Some(("image", reference)),
                &args(&["image", "inspect", reference]),
                cancel,
            )
            .await?;
        parse_inspect(&stdout, "image", reference)
    }

    async fn exec(
        &self,
        container: &str,
        argv: &[String],
        workdir: Option<&str>,
        user: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        let mut cmd_args = args(&["exec"]);
        if let Some(dir) = workdir {
            cmd_args.push("-w".into());
            cmd_args.push(dir.to_string());
        }
        if let Some(user) = user {
            cmd_args.push("-u".into());
            cmd_args.push(user.to_string());
        }
        cmd_args.push(container.to_string());
        cmd_args.extend(argv.iter().cloned());

        let out = self.output("exec", &cmd_args, None, cancel).await?;
        if out.combined().contains("No such container") {
            return Err(CoreError::ContainerNotFound(container.to_string()));
        }
        Ok(out)
    }

    async fn run_throwaway(
        &self,
        image: &str,
        mounts: &[MountSpec],
        argv: &[String],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        let cmd_args = throwaway_args(image, mounts, argv);
        let out = self.output("run", &cmd_args, None, cancel).await?;
        if !out.success() && DAEMON_DOWN_MARKERS.iter().any(|m| out.stderr.contains(m)) {
            return Err(CoreError::EngineUnavailable(stderr_tail(&out.stderr)));
        }
        Ok(out)
    }

    async fn list_services(&self, cancel: &CancellationToken) -> Result<Vec<ServiceSummary>> {
        let stdout = self
            .run(
                "service ls",
                None,
                &args(&["service", "ls", "--format", "{{json .}}"]),
                cancel,
            )
            .await?;
        Ok(parse_json_lines(&stdout))
    }

    async fn inspect_service(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ServiceDetails> {
        let stdout = self
            .run(
                "service inspect",
                Some(("service", id)),
                &args(&["service", "inspect", id]),
                cancel,
            )
            .await?;
        let raw: serde_json::Value = parse_inspect(&stdout, "service", id)?;
        Ok(ServiceDetails::from_raw(raw))
    }

    async fn create_service(
        &self,
        spec: &ServiceCreateSpec,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut cmd_args = args(&["service", "create", "--detach", "--name", &spec.name]);
        if let Some(replicas) = spec.replicas {
            cmd_args.push("--replicas".into());
            cmd_args.push(replicas.to_string());
        }
        let mut labels: Vec<_> = spec.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            cmd_args.push("--label".into());
            cmd_args.push(format!("{key}={value}"));
        }
        cmd_args.push(spec.image.clone());
        self.run("service create", None, &cmd_args, cancel)
            .await
            .map(|_| ())
    }

    async fn remove_service(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(
            "service rm",
            Some(("service", name)),
            &args(&["service", "rm", name]),
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn list_nodes(&self, cancel: &CancellationToken) -> Result<Vec<NodeSummary>> {
        let stdout = self
            .run(
                "node ls",
                None,
                &args(&["node", "ls", "--format", "{{json .}}"]),
                cancel,
            )
            .await?;
        Ok(parse_json_lines(&stdout))
    }

    async fn list_secrets(&self, cancel: &CancellationToken) -> Result<Vec<SecretSummary>> {
        let stdout = self
            .run(
                "secret ls",
                None,
                &args(&["secret", "ls", "--format", "{{json .}}"]),
                cancel,
            )
            .await?;
        Ok(parse_json_lines(&stdout))
    }

    async fn inspect_secret(&self, id: &str, cancel: &CancellationToken) -> Result<SecretDetails> {
        let stdout = self
            .run(
                "secret inspect",
                Some(("secret", id)),
                &args(&["secret", "inspect", id]),
                cancel,
            )
            .await?;
        let raw: serde_json::Value = parse_inspect(&stdout, "secret", id)?;
        Ok(SecretDetails {
            id: raw["ID"].as_str().unwrap_or_default().to_string(),
            name: raw["Spec"]["Name"].as_str().unwrap_or_default().to_string(),
            version: raw["Version"]["Index"].as_u64().unwrap_or_default(),
            labels: value_labels(&raw["Spec"]["Labels"]),
            created_at: value_time(&raw["CreatedAt"]),
        })
    }

    async fn create_secret(
        &self,
        name: &str,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cmd_args = args(&["secret", "create", name, "-"]);
        let out = self
            .output("secret create", &cmd_args, Some(data), cancel)
            .await?;
        if !out.success() {
            return Err(classify_failure("secret create", None, &out.stderr));
        }
        Ok(())
    }

    async fn remove_secret(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(
            "secret rm",
            Some(("secret", name)),
            &args(&["secret", "rm", name]),
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn list_configs(&self, cancel: &CancellationToken) -> Result<Vec<ConfigSummary>> {
        let stdout = self
            .run(
                "config ls",
                None,
                &args(&["config", "ls", "--format", "{{json .}}"]),
                cancel,
            )
            .await?;
        Ok(parse_json_lines(&stdout))
    }

    async fn inspect_config(&self, id: &str, cancel: &CancellationToken) -> Result<ConfigDetails> {
        let stdout = self
            .run(
                "config inspect",
                Some(("config", id)),
                &args(&["config", "inspect", id]),
                cancel,
            )
            .await?;
        let raw: serde_json::Value = parse_inspect(&stdout, "config", id)?;
        Ok(ConfigDetails {
            id: raw["ID"].as_str().unwrap_or_default().to_string(),
            name: raw["Spec"]["Name"].as_str().unwrap_or_default().to_string(),
            data_base64: raw["Spec"]["Data"].as_str().unwrap_or_default().to_string(),
            labels: value_labels(&raw["Spec"]["Labels"]),
            created_at: value_time(&raw["CreatedAt"]),
        })
    }

    async fn create_config(
        &self,
        name: &str,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cmd_args = args(&["config", "create", name, "-"]);
        let out = self
            .output("config create", &cmd_args, Some(data), cancel)
            .await?;
        if !out.success() {
            return Err(classify_failure("config create", None, &out.stderr));
        }
        Ok(())
    }

    async fn remove_config(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(
            "config rm",
            Some(("config", name)),
            &args(&["config", "rm", name]),
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn list_networks(
        &self,
        scope: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<NetworkSummary>> {
        let mut cmd_args = args(&["network", "ls", "--format", "{{json .}}"]);
        if let Some(scope) = scope {
            cmd_args.push("--filter".into());
            cmd_args.push(format!("scope={scope}"));
        }
        let stdout = self.run("network ls", None, &cmd_args, cancel).await?;
        Ok(parse_json_lines(&stdout))
    }

    async fn inspect_network(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<NetworkDetails> {
        let stdout = self
            .run(
                "network inspect",
                Some(("network", id)),
                &args(&["network", "inspect", id]),
                cancel,
            )
            .await?;
        parse_inspect(&stdout, "network", id)
    }

    async fn create_network(
        &self,
        spec: &NetworkCreateSpec,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut cmd_args = args(&["network", "create"]);
        if !spec.driver.is_empty() {
            cmd_args.push("--driver".into());
            cmd_args.push(spec.driver.clone());
        }
        if spec.attachable {
            cmd_args.push("--attachable".into());
        }
        for subnet in &spec.subnets {
            cmd_args.push("--subnet".into());
            cmd_args.push(subnet.clone());
        }
        let mut labels: Vec<_> = spec.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            cmd_args.push("--label".into());
            cmd_args.push(format!("{key}={value}"));
        }
        cmd_args.push(spec.name.clone());
        self.run("network create", None, &cmd_args, cancel)
            .await
            .map(|_| ())
    }

    async fn remove_network(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(
            "network rm",
            Some(("network", name)),
            &args(&["network", "rm", name]),
            cancel,
        )
        .await
        .map(|_| ())
    }
}

fn value_labels(value: &serde_json::Value) -> HashMap<String, String> {
    value
        .as_object()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn value_time(value: &serde_json::Value) -> Option<chrono::DateTime<chrono::Utc>> {
    value
        .as_str()
        .and_then(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok())
}
