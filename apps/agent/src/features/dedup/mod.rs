use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use keldris_types::DedupEntry;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::error::{CoreError, Result};
use crate::core::store::Store;

/// SHA-256 hex digest of a file, read in chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|err| CoreError::io(path, err))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).map_err(|err| CoreError::io(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Default)]
struct Maps {
    by_checksum: HashMap<String, DedupEntry>,
    by_image_id: HashMap<String, DedupEntry>,
}

impl Maps {
    fn insert(&mut self, entry: DedupEntry) {
        self.by_checksum
            .insert(entry.checksum.clone(), entry.clone());
        self.by_image_id.insert(entry.image_id.clone(), entry);
    }

    fn evict(&mut self, checksum: &str) {
        if let Some(entry) = self.by_checksum.remove(checksum) {
            self.by_image_id.remove(&entry.image_id);
        }
    }
}

/// Process-wide mapping from image identity and content checksum to a stored
/// artifact, so a given image is physically kept at most once per host.
pub struct DedupIndex {
    store: Arc<dyn Store>,
    maps: RwLock<Maps>,
}

impl DedupIndex {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            maps: RwLock::new(Maps::default()),
        }
    }

    /// Hydrate the in-memory maps from the store. Idempotent.
    pub async fn load_cache(&self, org_id: Uuid) -> Result<()> {
        let entries = self.store.list_dedup_entries(org_id).await?;
        let mut maps = self.maps.write().await;
        maps.by_checksum.clear();
        maps.by_image_id.clear();
        let count = entries.len();
        for entry in entries {
            maps.insert(entry);
        }
        debug!(org_id = %org_id, entries = count, "dedup cache loaded");
        Ok(())
    }

    /// Fast image-identity lookup consulted before an export is attempted.
    /// A hit whose artifact has vanished from disk is evicted and misses.
    pub async fn find_by_image_id(&self, image_id: &str) -> Option<DedupEntry> {
        let entry = {
            let maps = self.maps.read().await;
            maps.by_image_id.get(image_id).cloned()
        };
        let entry = entry?;
        if Path::new(&entry.artifact_path).exists() {
            return Some(entry);
        }
        warn!(image_id, path = %entry.artifact_path, "dedup artifact missing, evicting");
        self.maps.write().await.evict(&entry.checksum);
        None
    }

    /// Checksum lookup: memory first, then the store. Entries whose artifact
    /// file no longer exists are dropped from both layers.
    pub async fn check_duplicate(
        &self,
        org_id: Uuid,
        _image_id: &str,
        checksum: &str,
    ) -> Result<Option<DedupEntry>> {
        let cached = {
            let maps = self.maps.read().await;
            maps.by_checksum.get(checksum).cloned()
        };
        if let Some(entry) = cached {
            if Path::new(&entry.artifact_path).exists() {
                return Ok(Some(entry));
            }
            warn!(checksum, path = %entry.artifact_path, "dedup artifact missing, evicting");
            self.maps.write().await.evict(checksum);
            return Ok(None);
        }

        let Some(entry) = self
            .store
            .get_dedup_entry_by_checksum(org_id, checksum)
            .await?
        else {
            return Ok(None);
        };
        if !Path::new(&entry.artifact_path).exists() {
            warn!(checksum, path = %entry.artifact_path, "stored dedup entry has no artifact, deleting");
            self.store.delete_dedup_entry(entry.id).await?;
            return Ok(None);
        }
        self.maps.write().await.insert(entry.clone());
        Ok(Some(entry))
    }

    /// Record one more reference to an artifact, creating the entry when the
    /// checksum is new. Re-registering an image id under a different checksum
    /// is a producer bug and is rejected.
    pub async fn register(
        &self,
        org_id: Uuid,
        image_id: &str,
        checksum: &str,
        backup_id: Uuid,
        artifact_path: &Path,
        size_bytes: u64,
    ) -> Result<DedupEntry> {
        let mut maps = self.maps.write().await;

        if let Some(existing) = maps.by_image_id.get(image_id) {
            if existing.checksum != checksum {
                return Err(CoreError::ImageIdCollision {
                    image_id: image_id.to_string(),
                });
            }
        }

        if let Some(entry) = maps.by_checksum.get(checksum).cloned() {
            let mut entry = entry;
            entry.reference_count += 1;
            self.store.update_dedup_entry(&entry).await?;
            maps.insert(entry.clone());
            return Ok(entry);
        }

        let entry = DedupEntry {
            id: Uuid::new_v4(),
            org_id,
            image_id: image_id.to_string(),
            checksum: checksum.to_string(),
            origin_backup_id: backup_id,
            artifact_path: artifact_path.to_string_lossy().into_owned(),
            size_bytes,
            reference_count: 1,
        };
        self.store.create_dedup_entry(&entry).await?;
        maps.insert(entry.clone());
        Ok(entry)
    }

    pub async fn increment(&self, entry: &DedupEntry) -> Result<DedupEntry> {
        let mut maps = self.maps.write().await;
        let mut updated = entry.clone();
        updated.reference_count += 1;
        self.store.update_dedup_entry(&updated).await?;
        maps.insert(updated.clone());
        Ok(updated)
    }

    /// Drop one reference; refuses to go below zero.
    pub async fn decrement(&self, entry: &DedupEntry) -> Result<DedupEntry> {
        let mut maps = self.maps.write().await;
        let mut updated = entry.clone();
        updated.reference_count = (updated.reference_count - 1).max(0);
        self.store.update_dedup_entry(&updated).await?;
        maps.insert(updated.clone());
        Ok(updated)
    }

    /// Delete every zero-reference artifact and its rows. File removal is
    /// best-effort; the row goes away regardless.
    pub async fn cleanup_unused(&self, org_id: Uuid) -> Result<(usize, u64)> {
        let entries = self.store.list_dedup_entries(org_id).await?;
        let mut removed = 0usize;
        let mut bytes_freed = 0u64;
        let mut maps = self.maps.write().await;
        for entry in entries {
            if entry.reference_count > 0 {
                continue;
            }
            if let Err(err) = std::fs::remove_file(&entry.artifact_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %entry.artifact_path, error = %err, "failed to remove dedup artifact");
                }
            } else {
                bytes_freed += entry.size_bytes;
            }
            self.store.delete_dedup_entry(entry.id).await?;
            maps.evict(&entry.checksum);
            removed += 1;
        }
        info!(org_id = %org_id, removed, bytes_freed, "dedup cleanup finished");
        Ok((removed, bytes_freed))
    }

    /// Write the entry list as JSON for transport to another host.
    pub async fn export(&self, org_id: Uuid, path: &Path) -> Result<usize> {
        let entries = self.store.list_dedup_entries(org_id).await?;
        let json = serde_json::to_vec_pretty(&entries)
            .map_err(|err| CoreError::InvalidBackupData(err.to_string()))?;
        std::fs::write(path, json).map_err(|err| CoreError::io(path, err))?;
        Ok(entries.len())
    }

    /// Import a previously exported entry list. Entries with a vanished
    /// artifact are skipped; entries colliding with an existing row sum their
    /// reference counts instead of replacing them.
    pub async fn import(&self, org_id: Uuid, path: &Path) -> Result<usize> {
        let raw = std::fs::read(path).map_err(|err| CoreError::io(path, err))?;
        let entries: Vec<DedupEntry> = serde_json::from_slice(&raw)
            .map_err(|err| CoreError::InvalidBackupData(err.to_string()))?;

        let mut imported = 0usize;
        let mut maps = self.maps.write().await;
        for mut entry in entries {
            if !Path::new(&entry.artifact_path).exists() {
                warn!(path = %entry.artifact_path, "skipping import of entry with missing artifact");
                continue;
            }
            entry.org_id = org_id;
            match self
                .store
                .get_dedup_entry_by_checksum(org_id, &entry.checksum)
                .await?
            {
                Some(mut existing) => {
                    existing.reference_count += entry.reference_count;
                    self.store.update_dedup_entry(&existing).await?;
                    maps.insert(existing);
                }
                None => {
                    self.store.create_dedup_entry(&entry).await?;
                    maps.insert(entry);
                }
            }
            imported += 1;
        }
        Ok(imported)
    }

    #[cfg(test)]
    async fn entry_for(&self, checksum: &str) -> Option<DedupEntry> {
        self.maps.read().await.by_checksum.get(checksum).cloned()
    }
}
