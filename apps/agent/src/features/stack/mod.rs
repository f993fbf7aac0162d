use std::collections::{BTreeMap, VecDeque};
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::core::error::{CoreError, Result};

/// A compose field that is either a scalar or a sequence of scalars.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(value) => vec![value],
            StringOrList::Many(values) => values,
        }
    }
}

/// `depends_on` is either a sequence of service names or a mapping from name
/// to a condition tag. Both normalize to the name list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

impl DependsOn {
    pub fn names(&self) -> Vec<String> {
        match self {
            DependsOn::List(names) => names.clone(),
            DependsOn::Map(map) => map.keys().cloned().collect(),
        }
    }
}

/// `environment` is either a `K=V` sequence or a mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvSpec {
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

/// A service mount, short (`source:target[:mode]`) or long form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MountEntry {
    Short(String),
    Long(LongMount),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LongMount {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub volumes: Vec<MountEntry>,
    #[serde(default)]
    pub environment: Option<EnvSpec>,
    #[serde(default)]
    pub env_file: Option<StringOrList>,
    #[serde(default)]
    pub depends_on: Option<DependsOn>,
    #[serde(default)]
    pub ports: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub restart: Option<String>,
    #[serde(default)]
    pub command: Option<StringOrList>,
    #[serde(default)]
    pub healthcheck: Option<serde_yaml::Value>,
    #[serde(default)]
    pub labels: Option<serde_yaml::Value>,
}

impl ServiceSpec {
    pub fn dependency_names(&self) -> Vec<String> {
        self.depends_on
            .as_ref()
            .map(|d| d.names())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeDecl {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub labels: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComposeFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
    #[serde(default)]
    pub volumes: BTreeMap<String, Option<VolumeDecl>>,
    #[serde(default)]
    pub networks: BTreeMap<String, serde_yaml::Value>,
}

/// Where a mount's data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    Named {
        logical_name: String,
        engine_name: String,
    },
    Bind {
        host_path: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct MountPoint {
    pub service: String,
    pub source: MountSource,
    pub container_path: String,
    pub mode: Option<String>,
}

/// Everything a backup needs to know about one stack, derived from its
/// composition file.
#[derive(Debug, Clone)]
pub struct StackPlan {
    pub stack_name: String,
    pub composition_dir: PathBuf,
    pub compose: ComposeFile,
    pub dependency_order: Vec<String>,
    pub mounts: Vec<MountPoint>,
}

pub fn parse_compose(path: &Path) -> Result<ComposeFile> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            CoreError::CompositionNotFound(path.to_path_buf())
        } else {
            CoreError::io(path, err)
        }
    })?;
    let compose: ComposeFile = serde_yaml::from_str(&raw)
        .map_err(|err| CoreError::InvalidComposition(err.to_string()))?;
    if compose.services.is_empty() {
        return Err(CoreError::InvalidComposition(
            "composition defines no services".into(),
        ));
    }
    Ok(compose)
}

/// Parse, order and classify one composition file.
pub fn plan(composition_path: &Path, stack_override: Option<&str>) -> Result<StackPlan> {
    let compose = parse_compose(composition_path)?;
    let composition_dir = composition_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let stack_name = match stack_override {
        Some(name) => name.to_string(),
        None => stack_name_from_dir(&composition_dir),
    };
    let dependency_order = dependency_order(&compose)?;
    let mounts = classify_mounts(&compose, &composition_dir, &stack_name);
    Ok(StackPlan {
        stack_name,
        composition_dir,
        compose,
        dependency_order,
        mounts,
    })
}

pub fn stack_name_from_dir(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stack".to_string())
}

pub fn dependency_order(compose: &ComposeFile) -> Result<Vec<String>> {
    let nodes: BTreeMap<String, Vec<String>> = compose
        .services
        .iter()
        .map(|(name, spec)| (name.clone(), spec.dependency_names()))
        .collect();
    topological_order(&nodes)
}

/// Kahn's algorithm with alphabetical tie-breaking: the initial ready set and
/// every later batch of newly-ready nodes are enqueued in sorted order, so
/// the emitted sequence is deterministic.
pub fn topological_order(nodes: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>> {
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (name, deps) in nodes {
        indegree.entry(name).or_insert(0);
        for dep in deps {
            // Dependencies on names outside the set count as satisfied.
            if !nodes.contains_key(dep) {
                continue;
            }
            *indegree.entry(name).or_insert(0) += 1;
            dependents.entry(dep).or_default().push(name);
        }
    }

    // BTreeMap iteration already yields the no-dependency set alphabetically.
    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        let mut ready = Vec::new();
        if let Some(waiting) = dependents.get(name) {
            for dependent in waiting {
                let degree = indegree.get_mut(dependent).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(*dependent);
                }
            }
        }
        ready.sort_unstable();
        queue.extend(ready);
    }

    if order.len() < nodes.len() {
        let mut remaining: Vec<String> = nodes
            .keys()
            .filter(|name| !order.contains(*name))
            .cloned()
            .collect();
        remaining.sort_unstable();
        return Err(CoreError::CircularDependency(remaining));
    }
    Ok(order)
}

/// Split every service mount into named-volume and host-path classes.
pub fn classify_mounts(
    compose: &ComposeFile,
    composition_dir: &Path,
    stack_name: &str,
) -> Vec<MountPoint> {
    let mut mounts = Vec::new();
    for (service, spec) in &compose.services {
        for entry in &spec.volumes {
            let (source_raw, target, mode) = match entry {
                MountEntry::Short(short) => {
                    let mut parts = short.splitn(3, ':');
                    let source = parts.next().unwrap_or("").to_string();
                    let target = match parts.next() {
                        Some(t) => t.to_string(),
                        // A bare named volume with no target is engine-managed
                        // anonymous storage; nothing to classify.
                        None => continue,
                    };
                    (source, target, parts.next().map(str::to_string))
                }
                MountEntry::Long(long) => {
                    if long.source.is_empty() || long.target.is_empty() {
                        continue;
                    }
                    let mode = long.read_only.then(|| "ro".to_string());
                    (long.source.clone(), long.target.clone(), mode)
                }
            };

            let source = if is_host_path(&source_raw) {
                MountSource::Bind {
                    host_path: resolve_host_path(composition_dir, &source_raw),
                }
            } else {
                MountSource::Named {
                    engine_name: resolve_volume_name(compose, stack_name, &source_raw),
                    logical_name: source_raw,
                }
            };
            mounts.push(MountPoint {
                service: service.clone(),
                source,
                container_path: target,
                mode,
            });
        }
    }
    mounts
}

fn is_host_path(source: &str) -> bool {
    source.starts_with('/') || source.starts_with("./") || source.starts_with("..")
}

/// Engine-side name for a logical volume: the explicit `name:` from the
/// top-level volumes block when present, otherwise `<stack>_<logical>`.
pub fn resolve_volume_name(compose: &ComposeFile, stack_name: &str, logical: &str) -> String {
    if let Some(Some(decl)) = compose.volumes.get(logical) {
        if let Some(name) = &decl.name {
            return name.clone();
        }
    }
    format!("{stack_name}_{logical}")
}

fn resolve_host_path(composition_dir: &Path, source: &str) -> PathBuf {
    let joined = if Path::new(source).is_absolute() {
        PathBuf::from(source)
    } else {
        composition_dir.join(source)
    };
    match joined.canonicalize() {
        Ok(resolved) => resolved,
        Err(_) => normalize_lexically(&joined),
    }
}

/// Component-wise `.`/`..` removal for paths that do not (yet) exist on disk.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Total bytes and file count under a host directory. I/O errors contribute
/// zero and never abort the walk; a tripped token stops it early.
pub fn walk_stats(root: &Path, cancel: &CancellationToken) -> (u64, u64) {
    let mut size_bytes = 0u64;
    let mut file_count = 0u64;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        if cancel.is_cancelled() {
            break;
        }
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                if let Ok(meta) = entry.metadata() {
                    size_bytes += meta.len();
                    file_count += 1;
                }
            }
        }
    }
    (size_bytes, file_count)
}
