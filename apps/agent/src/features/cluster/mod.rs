use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use keldris_types::{
    ClusterBackupMeta, ClusterBackupOptions, ClusterManifest, ClusterRestoreOptions,
    ClusterState, ClusterVolumeRecord, ConfigRecord, NetworkRecord, NodeRecord, SecretRecord,
    ServiceRecord, StackRecord,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::crypto::{build_secret_envelope, SecretCipher};
use crate::core::engine::{Engine, NetworkCreateSpec, ServiceCreateSpec, VolumeCreateSpec};
use crate::core::error::{CoreError, Result};
use crate::features::stack::topological_order;

const CLUSTER_BACKUP_VERSION: &str = "1.0";
const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";
const DEPENDS_ON_LABEL: &str = "com.docker.compose.depends_on";

/// Networks the engine manages itself; they are never backed up or restored.
const BUILTIN_NETWORKS: &[&str] = &["ingress", "docker_gwbridge"];

/// Captures a clustered engine's control-plane state: nodes, services,
/// stacks, and optionally secrets (metadata only), configs, networks and
/// volumes.
pub struct ClusterBackup {
    engine: Arc<dyn Engine>,
    cipher: Arc<dyn SecretCipher>,
}

impl ClusterBackup {
    pub fn new(engine: Arc<dyn Engine>, cipher: Arc<dyn SecretCipher>) -> Self {
        Self { engine, cipher }
    }

    pub async fn backup(
        &self,
        opts: &ClusterBackupOptions,
        cancel: &CancellationToken,
    ) -> Result<(ClusterManifest, PathBuf)> {
        let engine_info = self.engine.info(cancel).await?;
        if !engine_info.is_active_manager() {
            return Err(CoreError::NotManager);
        }
        let cluster_state = engine_info
            .swarm
            .cluster
            .as_ref()
            .map(|c| ClusterState {
                cluster_id: c.id.clone(),
                created_at: c.created_at,
            })
            .unwrap_or_else(|| ClusterState {
                cluster_id: String::new(),
                created_at: None,
            });

        // Nodes and services are required; failures here fail the backup.
        let nodes: Vec<NodeRecord> = self
            .engine
            .list_nodes(cancel)
            .await?
            .into_iter()
            .map(|n| NodeRecord {
                role: if n.manager_status.is_empty() {
                    "worker".into()
                } else {
                    "manager".into()
                },
                id: n.id,
                hostname: n.hostname,
                availability: n.availability,
                state: n.status,
                manager_status: (!n.manager_status.is_empty()).then_some(n.manager_status),
            })
            .collect();

        let mut services = Vec::new();
        for summary in self.engine.list_services(cancel).await? {
            let details = self.engine.inspect_service(&summary.id, cancel).await?;
            let depends_on = details
                .labels
                .get(DEPENDS_ON_LABEL)
                .map(|raw| parse_depends_on_label(raw))
                .unwrap_or_default();
            services.push(ServiceRecord {
                id: details.id,
                name: details.name,
                image: details.image,
                mode: details.mode,
                replicas: details.replicas,
                labels: details.labels,
                depends_on,
                raw_spec: details.raw,
            });
        }

        let stacks = derive_stacks(&services);

        let secrets = if opts.include_secrets {
            Some(self.collect_secrets(cancel).await)
        } else {
            None
        };
        let configs = if opts.include_configs {
            Some(self.collect_configs(cancel).await)
        } else {
            None
        };
        let networks = if opts.include_networks {
            Some(self.collect_networks(cancel).await)
        } else {
            None
        };
        let volumes = if opts.include_volumes {
            Some(self.collect_volumes(cancel).await)
        } else {
            None
        };

        let manifest = ClusterManifest {
            metadata: ClusterBackupMeta {
                id: Uuid::new_v4(),
                timestamp: chrono::Utc::now(),
                version: CLUSTER_BACKUP_VERSION.into(),
                hostname: hostname::get()
                    .map(|h| h.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                service_count: services.len() as u64,
                stack_count: stacks.len() as u64,
                node_count: nodes.len() as u64,
            },
            cluster_state,
            nodes,
            services,
            stacks,
            secrets,
            configs,
            networks,
            volumes,
        };

        let path = write_cluster_manifest(Path::new(&opts.output_dir), &manifest)?;
        info!(
            services = manifest.metadata.service_count,
            nodes = manifest.metadata.node_count,
            path = %path.display(),
            "cluster backup written"
        );
        Ok((manifest, path))
    }

    /// Secret values never leave the engine; only the reference envelope is
    /// captured. Failures skip the entry.
    async fn collect_secrets(&self, cancel: &CancellationToken) -> Vec<SecretRecord> {
        let summaries = match self.engine.list_secrets(cancel).await {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "secret listing failed, skipping section");
                return Vec::new();
            }
        };
        let mut records = Vec::new();
        for summary in summaries {
            let details = match self.engine.inspect_secret(&summary.id, cancel).await {
                Ok(details) => details,
                Err(err) => {
                    warn!(secret = %summary.name, error = %err, "secret inspect failed, skipping");
                    continue;
                }
            };
            let envelope = match build_secret_envelope(
                self.cipher.as_ref(),
                &details.id,
                &details.name,
                details.version,
            )
            .await
            {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(secret = %details.name, error = %err, "envelope build failed, skipping");
                    continue;
                }
            };
            records.push(SecretRecord {
                id: details.id,
                name: details.name,
                labels: details.labels,
                created_at: details.created_at,
                envelope,
            });
        }
        records
    }

    async fn collect_configs(&self, cancel: &CancellationToken) -> Vec<ConfigRecord> {
        let summaries = match self.engine.list_configs(cancel).await {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "config listing failed, skipping section");
                return Vec::new();
            }
        };
        let mut records = Vec::new();
        for summary in summaries {
            match self.engine.inspect_config(&summary.id, cancel).await {
                Ok(details) => records.push(ConfigRecord {
                    id: details.id,
                    name: details.name,
                    data_base64: details.data_base64,
                    labels: details.labels,
                    created_at: details.created_at,
                }),
                Err(err) => {
                    warn!(config = %summary.name, error = %err, "config inspect failed, skipping")
                }
            }
        }
        records
    }

    async fn collect_networks(&self, cancel: &CancellationToken) -> Vec<NetworkRecord> {
        let summaries = match self.engine.list_networks(Some("swarm"), cancel).await {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "network listing failed, skipping section");
                return Vec::new();
            }
        };
        let mut records = Vec::new();
        for summary in summaries {
            if BUILTIN_NETWORKS.contains(&summary.name.as_str()) {
                continue;
            }
            match self.engine.inspect_network(&summary.id, cancel).await {
                Ok(details) => {
                    let subnets = details.subnets();
                    records.push(NetworkRecord {
                        id: details.id,
                        name: details.name.clone(),
                        driver: details.driver.clone(),
                        scope: details.scope.clone(),
                        attachable: details.attachable,
                        labels: details.labels.clone().unwrap_or_default(),
                        subnets,
                    })
                }
                Err(err) => {
                    warn!(network = %summary.name, error = %err, "network inspect failed, skipping")
                }
            }
        }
        records
    }

    async fn collect_volumes(&self, cancel: &CancellationToken) -> Vec<ClusterVolumeRecord> {
        match self.engine.list_volumes(cancel).await {
            Ok(list) => list
                .into_iter()
                .map(|v| ClusterVolumeRecord {
                    name: v.name,
                    driver: v.driver,
                    labels: crate::core::engine::parse_label_csv(&v.labels),
                    mountpoint: (!v.mountpoint.is_empty()).then_some(v.mountpoint),
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, "volume listing failed, skipping section");
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ClusterRestoreOutcome {
    pub networks_restored: u64,
    pub volumes_restored: u64,
    pub configs_restored: u64,
    pub secrets_restored: u64,
    pub services_restored: u64,
    pub warnings: Vec<String>,
}

/// Restores a cluster manifest in the fixed order networks, volumes,
/// configs, secrets, then services in dependency order.
pub struct ClusterRestore {
    engine: Arc<dyn Engine>,
}

impl ClusterRestore {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    pub async fn restore(
        &self,
        manifest: &ClusterManifest,
        opts: &ClusterRestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<ClusterRestoreOutcome> {
        let engine_info = self.engine.info(cancel).await?;
        if !engine_info.is_active_manager() {
            return Err(CoreError::NotManager);
        }

        // Service order is computed up front so a cycle aborts before any
        // engine mutation.
        let ordered_services = order_services(&manifest.services)?;

        let mut outcome = ClusterRestoreOutcome::default();

        for network in manifest.networks.iter().flatten() {
            if BUILTIN_NETWORKS.contains(&network.name.as_str()) {
                continue;
            }
            if opts.force {
                // Removal failures are expected when the network is absent.
                let _ = self.engine.remove_network(&network.name, cancel).await;
            }
            let spec = NetworkCreateSpec {
                name: network.name.clone(),
                driver: network.driver.clone(),
                attachable: network.attachable,
                labels: network.labels.clone(),
                subnets: network.subnets.clone(),
            };
            match self.engine.create_network(&spec, cancel).await {
                Ok(()) => outcome.networks_restored += 1,
                Err(err) => {
                    warn!(network = %network.name, error = %err, "network restore failed");
                    outcome.warnings.push(format!("network {}: {err}", network.name));
                }
            }
        }

        for volume in manifest.volumes.iter().flatten() {
            if opts.force {
                let _ = self.engine.remove_volume(&volume.name, cancel).await;
            }
            let spec = VolumeCreateSpec {
                name: volume.name.clone(),
                driver: Some(volume.driver.clone()),
                labels: volume.labels.clone(),
            };
            match self.engine.create_volume(&spec, cancel).await {
                Ok(()) => outcome.volumes_restored += 1,
                Err(err) => {
                    warn!(volume = %volume.name, error = %err, "volume restore failed");
                    outcome.warnings.push(format!("volume {}: {err}", volume.name));
                }
            }
        }

        for config in manifest.configs.iter().flatten() {
            if opts.force {
                let _ = self.engine.remove_config(&config.name, cancel).await;
            }
            let data = match base64::engine::general_purpose::STANDARD
                .decode(&config.data_base64)
            {
                Ok(data) => data,
                Err(err) => {
                    warn!(config = %config.name, error = %err, "config payload not decodable");
                    outcome.warnings.push(format!("config {}: {err}", config.name));
                    continue;
                }
            };
            match self.engine.create_config(&config.name, &data, cancel).await {
                Ok(()) => outcome.configs_restored += 1,
                Err(err) => {
                    warn!(config = %config.name, error = %err, "config restore failed");
                    outcome.warnings.push(format!("config {}: {err}", config.name));
                }
            }
        }

        for secret in manifest.secrets.iter().flatten() {
            // The envelope carries no value; the caller supplies plaintext.
            let plaintext = opts
                .secret_plaintexts
                .get(&secret.id)
                .or_else(|| opts.secret_plaintexts.get(&secret.name));
            let Some(plaintext) = plaintext else {
                warn!(secret = %secret.name, "no plaintext supplied, skipping");
                outcome
                    .warnings
                    .push(format!("secret {} skipped: no plaintext supplied", secret.name));
                continue;
            };
            if opts.force {
                let _ = self.engine.remove_secret(&secret.name, cancel).await;
            }
            match self
                .engine
                .create_secret(&secret.name, plaintext.as_bytes(), cancel)
                .await
            {
                Ok(()) => outcome.secrets_restored += 1,
                Err(err) => {
                    warn!(secret = %secret.name, error = %err, "secret restore failed");
                    outcome.warnings.push(format!("secret {}: {err}", secret.name));
                }
            }
        }

        for name in &ordered_services {
            let record = manifest
                .services
                .iter()
                .find(|s| &s.name == name)
                .expect("ordered name comes from the service set");
            if opts.force {
                let _ = self.engine.remove_service(&record.name, cancel).await;
            }
            let spec = ServiceCreateSpec {
                name: record.name.clone(),
                image: record.image.clone(),
                replicas: record.replicas,
                labels: record.labels.clone(),
            };
            match self.engine.create_service(&spec, cancel).await {
                Ok(()) => outcome.services_restored += 1,
                Err(err) => {
                    warn!(service = %record.name, error = %err, "service restore failed");
                    outcome.warnings.push(format!("service {}: {err}", record.name));
                }
            }
        }

        info!(
            networks = outcome.networks_restored,
            volumes = outcome.volumes_restored,
            configs = outcome.configs_restored,
            secrets = outcome.secrets_restored,
            services = outcome.services_restored,
            "cluster restore finished"
        );
        Ok(outcome)
    }
}

/// `depends_on` labels carry comma-separated entries, optionally with
/// condition suffixes (`db:service_started`); only the names matter here.
fn parse_depends_on_label(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|entry| entry.trim().split(':').next().unwrap_or("").to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

fn derive_stacks(services: &[ServiceRecord]) -> Vec<StackRecord> {
    let mut stacks: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for service in services {
        if let Some(namespace) = service.labels.get(STACK_NAMESPACE_LABEL) {
            stacks
                .entry(namespace.clone())
                .or_default()
                .push(service.name.clone());
        }
    }
    stacks
        .into_iter()
        .map(|(name, mut services)| {
            services.sort();
            StackRecord { name, services }
        })
        .collect()
}

/// Same ordering algorithm as the stack planner, over the service-label
/// dependency edges.
fn order_services(services: &[ServiceRecord]) -> Result<Vec<String>> {
    let nodes: BTreeMap<String, Vec<String>> = services
        .iter()
        .map(|s| (s.name.clone(), s.depends_on.clone()))
        .collect();
    topological_order(&nodes)
}

fn write_cluster_manifest(output_dir: &Path, manifest: &ClusterManifest) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir).map_err(|err| CoreError::io(output_dir, err))?;
    let stamp = manifest.metadata.timestamp.format("%Y%m%d_%H%M%S");
    let path = output_dir.join(format!("cluster_backup_{stamp}.json"));
    let tmp = output_dir.join(format!("cluster_backup_{stamp}.json.tmp"));
    let json = serde_json::to_vec_pretty(manifest)
        .map_err(|err| CoreError::InvalidBackupData(err.to_string()))?;
    std::fs::write(&tmp, json).map_err(|err| CoreError::io(&tmp, err))?;
    std::fs::rename(&tmp, &path).map_err(|err| CoreError::io(&path, err))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crypto::PlainCipher;
    use crate::core::engine::{EngineInfo, NetworkDetails, NodeSummary, ServiceDetails};
    use crate::core::testing::FakeEngine;
    use std::collections::HashMap;

    fn manager_info() -> EngineInfo {
        serde_json::from_str(
            r#"{"Swarm":{"LocalNodeState":"active","ControlAvailable":true,"Cluster":{"ID":"cluster-1"}}}"#,
        )
        .unwrap()
    }

    fn service(name: &str, labels: &[(&str, &str)]) -> ServiceDetails {
        ServiceDetails {
            id: format!("svc-{name}"),
            name: name.to_string(),
            image: format!("{name}:1"),
            mode: "replicated".into(),
            replicas: Some(1),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            raw: serde_json::json!({"ID": format!("svc-{name}")}),
        }
    }

    fn backup_opts(dir: &Path) -> ClusterBackupOptions {
        ClusterBackupOptions {
            output_dir: dir.to_string_lossy().into_owned(),
            include_secrets: true,
            include_configs: true,
            include_networks: true,
            include_volumes: true,
        }
    }

    #[tokio::test]
    async fn non_manager_is_rejected_before_any_reads() {
        let engine = Arc::new(FakeEngine::new());
        let backup = ClusterBackup::new(engine.clone(), Arc::new(PlainCipher));
        let dir = tempfile::tempdir().unwrap();
        let err = backup
            .backup(&backup_opts(dir.path()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotManager));
        assert_eq!(engine.calls(), vec!["info"]);
    }

    #[tokio::test]
    async fn backup_collects_all_sections() {
        let engine = Arc::new(FakeEngine::with_state(|state| {
            state.info = manager_info();
            state.nodes.push(NodeSummary {
                id: "n1".into(),
                hostname: "host-a".into(),
                status: "Ready".into(),
                availability: "Active".into(),
                manager_status: "Leader".into(),
            });
            state.services.push(service(
                "api",
                &[
                    (STACK_NAMESPACE_LABEL, "shop"),
                    (DEPENDS_ON_LABEL, "db:service_started"),
                ],
            ));
            state.services.push(service("db", &[(STACK_NAMESPACE_LABEL, "shop")]));
            state.secrets.push(crate::core::engine::SecretDetails {
                id: "sec1".into(),
                name: "db_password".into(),
                version: 3,
                labels: HashMap::new(),
                created_at: None,
            });
            state.configs.push(crate::core::engine::ConfigDetails {
                id: "cfg1".into(),
                name: "app_config".into(),
                data_base64: base64::engine::general_purpose::STANDARD.encode(b"key=value"),
                labels: HashMap::new(),
                created_at: None,
            });
            state.networks.push(NetworkDetails {
                id: "net1".into(),
                name: "backend".into(),
                driver: "overlay".into(),
                scope: "swarm".into(),
                attachable: true,
                labels: None,
                ..NetworkDetails::default()
            });
            state.networks.push(NetworkDetails {
                id: "net2".into(),
                name: "ingress".into(),
                driver: "overlay".into(),
                scope: "swarm".into(),
                ..NetworkDetails::default()
            });
            state.volumes.push(FakeEngine::volume("shop_data"));
        }));
        let backup = ClusterBackup::new(engine, Arc::new(PlainCipher));
        let dir = tempfile::tempdir().unwrap();

        let (manifest, path) = backup
            .backup(&backup_opts(dir.path()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(path.exists());
        assert_eq!(manifest.cluster_state.cluster_id, "cluster-1");
        assert_eq!(manifest.metadata.node_count, 1);
        assert_eq!(manifest.metadata.service_count, 2);
        assert_eq!(manifest.metadata.stack_count, 1);
        assert_eq!(manifest.nodes[0].role, "manager");

        let api = manifest.services.iter().find(|s| s.name == "api").unwrap();
        assert_eq!(api.depends_on, vec!["db"]);

        assert_eq!(manifest.stacks[0].name, "shop");
        assert_eq!(manifest.stacks[0].services, vec!["api", "db"]);

        let secrets = manifest.secrets.as_ref().unwrap();
        assert_eq!(secrets.len(), 1);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&secrets[0].envelope.docker_encrypted_ref)
            .unwrap();
        assert_eq!(decoded, b"docker-secret-ref:sec1:db_password:3");

        // Builtin networks are never captured.
        let networks = manifest.networks.as_ref().unwrap();
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].name, "backend");

        assert_eq!(manifest.configs.as_ref().unwrap().len(), 1);
        assert_eq!(manifest.volumes.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn optional_section_failure_degrades() {
        let engine = Arc::new(FakeEngine::with_state(|state| {
            state.info = manager_info();
            state.fail.insert("secret-ls".into());
        }));
        let backup = ClusterBackup::new(engine, Arc::new(PlainCipher));
        let dir = tempfile::tempdir().unwrap();
        let (manifest, _) = backup
            .backup(&backup_opts(dir.path()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(manifest.secrets.as_ref().unwrap().len(), 0);
    }

    fn restore_manifest() -> ClusterManifest {
        ClusterManifest {
            metadata: ClusterBackupMeta {
                id: Uuid::new_v4(),
                timestamp: chrono::Utc::now(),
                version: CLUSTER_BACKUP_VERSION.into(),
                hostname: "host-a".into(),
                service_count: 3,
                stack_count: 0,
                node_count: 1,
            },
            cluster_state: ClusterState {
                cluster_id: "cluster-1".into(),
                created_at: None,
            },
            nodes: vec![],
            services: vec![
                ServiceRecord {
                    id: "svc-web".into(),
                    name: "web".into(),
                    image: "web:1".into(),
                    mode: "replicated".into(),
                    replicas: Some(2),
                    labels: HashMap::new(),
                    depends_on: vec!["api".into()],
                    raw_spec: serde_json::Value::Null,
                },
                ServiceRecord {
                    id: "svc-api".into(),
                    name: "api".into(),
                    image: "api:1".into(),
                    mode: "replicated".into(),
                    replicas: Some(1),
                    labels: HashMap::new(),
                    depends_on: vec!["db".into()],
                    raw_spec: serde_json::Value::Null,
                },
                ServiceRecord {
                    id: "svc-db".into(),
                    name: "db".into(),
                    image: "db:1".into(),
                    mode: "replicated".into(),
                    replicas: Some(1),
                    labels: HashMap::new(),
                    depends_on: vec![],
                    raw_spec: serde_json::Value::Null,
                },
            ],
            stacks: vec![],
            secrets: Some(vec![SecretRecord {
                id: "sec1".into(),
                name: "db_password".into(),
                labels: HashMap::new(),
                created_at: None,
                envelope: keldris_types::SecretEnvelope {
                    docker_encrypted_ref: "ref".into(),
                    keldris_encrypted: "enc".into(),
                    checksum: "sum".into(),
                    encrypted_at: chrono::Utc::now(),
                },
            }]),
            configs: Some(vec![ConfigRecord {
                id: "cfg1".into(),
                name: "app_config".into(),
                data_base64: base64::engine::general_purpose::STANDARD.encode(b"key=value"),
                labels: HashMap::new(),
                created_at: None,
            }]),
            networks: Some(vec![NetworkRecord {
                id: "net1".into(),
                name: "backend".into(),
                driver: "overlay".into(),
                scope: "swarm".into(),
                attachable: true,
                labels: HashMap::new(),
                subnets: vec![],
            }]),
            volumes: Some(vec![ClusterVolumeRecord {
                name: "shop_data".into(),
                driver: "local".into(),
                labels: HashMap::new(),
                mountpoint: None,
            }]),
        }
    }

    #[tokio::test]
    async fn restore_runs_in_fixed_order_with_topo_sorted_services() {
        let engine = Arc::new(FakeEngine::with_state(|state| {
            state.info = manager_info();
        }));
        let restore = ClusterRestore::new(engine.clone());
        let mut opts = ClusterRestoreOptions::default();
        opts.secret_plaintexts
            .insert("sec1".into(), "hunter2".into());

        let outcome = restore
            .restore(&restore_manifest(), &opts, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.networks_restored, 1);
        assert_eq!(outcome.volumes_restored, 1);
        assert_eq!(outcome.configs_restored, 1);
        assert_eq!(outcome.secrets_restored, 1);
        assert_eq!(outcome.services_restored, 3);
        assert!(outcome.warnings.is_empty());

        let calls = engine.calls();
        let idx = |needle: &str| calls.iter().position(|c| c == needle).unwrap();
        assert!(idx("network-create backend") < idx("volume-create shop_data"));
        assert!(idx("volume-create shop_data") < idx("config-create app_config"));
        assert!(idx("config-create app_config") < idx("secret-create db_password"));
        assert!(idx("secret-create db_password") < idx("service-create db"));
        assert!(idx("service-create db") < idx("service-create api"));
        assert!(idx("service-create api") < idx("service-create web"));
    }

    #[tokio::test]
    async fn missing_secret_plaintext_is_skipped() {
        let engine = Arc::new(FakeEngine::with_state(|state| {
            state.info = manager_info();
        }));
        let restore = ClusterRestore::new(engine.clone());
        let outcome = restore
            .restore(
                &restore_manifest(),
                &ClusterRestoreOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.secrets_restored, 0);
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.contains("no plaintext supplied")));
        assert!(!engine.calls().iter().any(|c| c.starts_with("secret-create")));
    }

    #[tokio::test]
    async fn service_cycle_aborts_before_mutation() {
        let engine = Arc::new(FakeEngine::with_state(|state| {
            state.info = manager_info();
        }));
        let restore = ClusterRestore::new(engine.clone());
        let mut manifest = restore_manifest();
        manifest.services[2].depends_on = vec!["web".into()];

        let err = restore
            .restore(
                &manifest,
                &ClusterRestoreOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::CircularDependency(_)));
        assert!(!engine.calls().iter().any(|c| c.contains("create")));
    }

    #[test]
    fn depends_on_label_parsing_strips_conditions() {
        assert_eq!(
            parse_depends_on_label("db:service_started, cache , ,broker:service_healthy:true"),
            vec!["db", "cache", "broker"]
        );
    }
}
