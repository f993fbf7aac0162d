use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A conflict detected while planning a restore against a live engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub entity: &'static str,
    pub name: String,
    pub existing_id: Option<String>,
    pub description: String,
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} exists", self.entity, self.name)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    // Pre-flight
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("invalid composition: {0}")]
    InvalidComposition(String),
    #[error("composition file not found: {0}")]
    CompositionNotFound(PathBuf),
    #[error("engine is not an active cluster manager")]
    NotManager,

    // Planning
    #[error("circular dependency among services: {}", .0.join(", "))]
    CircularDependency(Vec<String>),
    #[error("{entity} not found: {name}")]
    NotFound { entity: &'static str, name: String },

    // Execution
    #[error("engine command `{op}` failed: {stderr_tail}")]
    EngineError { op: String, stderr_tail: String },
    #[error("hook timed out after {0:?}")]
    HookTimeout(Duration),
    #[error("hook exited with status {exit_code}")]
    HookFailed { exit_code: i64 },
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("container failed to start: status={status} exit_code={exit_code}")]
    ContainerStartFailed { status: String, exit_code: i64 },
    #[error("restore conflicts: {}", .0.iter().map(|c| c.to_string()).collect::<Vec<_>>().join("; "))]
    Conflicts(Vec<Conflict>),
    #[error("hook has no command to run")]
    NoCommand,

    // Integrity
    #[error("invalid backup data: {0}")]
    InvalidBackupData(String),
    #[error("checksum mismatch for {path}")]
    ChecksumMismatch { path: String },
    #[error("image id {image_id} already registered with a different checksum")]
    ImageIdCollision { image_id: String },

    // Concurrency
    #[error("operation cancelled")]
    Cancelled,
    #[error("shutdown in progress, not accepting new jobs")]
    ShutdownInProgress,

    // Storage
    #[error("store error: {0}")]
    Store(String),
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
