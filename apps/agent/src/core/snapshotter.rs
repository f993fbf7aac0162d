use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::error::Result;

/// Opaque repository configuration handed through to the snapshot backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoConfig {
    pub repository: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotReport {
    pub snapshot_id: String,
    pub size_bytes: u64,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
}

/// Content-addressed snapshot backend, invoked as an external process. The
/// core only drives it; storage and deduplication at the file level are its
/// problem.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn backup(
        &self,
        repo: &RepoConfig,
        paths: &[PathBuf],
        excludes: &[String],
        tags: &[String],
        cancel: &CancellationToken,
    ) -> Result<SnapshotReport>;
}

/// Discards everything; used when no snapshot repository is configured.
#[derive(Default)]
pub struct NullSnapshotter;

#[async_trait]
impl Snapshotter for NullSnapshotter {
    async fn backup(
        &self,
        _repo: &RepoConfig,
        paths: &[PathBuf],
        _excludes: &[String],
        _tags: &[String],
        _cancel: &CancellationToken,
    ) -> Result<SnapshotReport> {
        Ok(SnapshotReport {
            snapshot_id: String::new(),
            size_bytes: 0,
            files_new: paths.len() as u64,
            files_changed: 0,
            files_unmodified: 0,
        })
    }
}
