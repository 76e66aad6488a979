//! Per-node file catalog.
//!
//! The catalog is the node's table of [`FileRecord`]s. It is kept in memory,
//! written to `memory.json` after every change and re-verified against the
//! content store by the periodic integrity scan. Writers to the same file id
//! are serialized by a per-record lock; different ids never wait on each other.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use byte_unit::Byte;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::content::ContentStore;
use crate::common::{crc32, duration_ms, elapsed_ms, now_ms, FileId};
use crate::error::{Error, Result};
use crate::protocol::{
    AddRequest, Catalog, DeleteRequest, FileCopy, FileRecord, FileStatus, UpdateRequest,
};

const SNAPSHOT_FILE: &str = "memory.json";

/// On-disk form of the catalog. Content is never part of it.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    files: Catalog,
}

/// What one integrity scan changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Expired tombstones removed.
    pub purged: usize,
    /// Records whose stored checksums were overwritten.
    pub repaired: usize,
    /// Records skipped because a write held them.
    pub skipped: usize,
}

pub struct NodeCatalog {
    snapshot_path: PathBuf,
    content: ContentStore,
    records: Mutex<Catalog>,
    record_locks: DashMap<FileId, Arc<tokio::sync::Mutex<()>>>,
    // Serializes snapshot writes so an older snapshot never lands last.
    persist_lock: tokio::sync::Mutex<()>,
    tombstone_grace: Duration,
}

impl NodeCatalog {
    /// Opens the catalog rooted at `root`: creates the storage directories,
    /// loads the persisted snapshot, runs one integrity scan and persists once.
    /// The catalog is ready to serve requests when this returns.
    pub async fn open(root: &Path, tombstone_grace: Duration) -> Result<NodeCatalog> {
        tokio::fs::create_dir_all(root).await?;
        let content = ContentStore::open(root).await?;
        let snapshot_path = root.join(SNAPSHOT_FILE);
        let files = load_snapshot(&snapshot_path).await?;
        info!("Loaded {} records from {}", files.len(), snapshot_path.display());

        let catalog = NodeCatalog {
            snapshot_path,
            content,
            records: Mutex::new(files),
            record_locks: DashMap::new(),
            persist_lock: tokio::sync::Mutex::new(()),
            tombstone_grace,
        };

        catalog.integrity_scan().await?;
        catalog.persist().await?;
        Ok(catalog)
    }

    fn records(&self) -> MutexGuard<'_, Catalog> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) async fn lock_record(&self, id: &FileId) -> OwnedMutexGuard<()> {
        let lock = self.record_locks.entry(id.clone()).or_default().clone();
        lock.lock_owned().await
    }

    fn try_lock_record(&self, id: &FileId) -> Option<OwnedMutexGuard<()>> {
        let lock = self.record_locks.entry(id.clone()).or_default().clone();
        lock.try_lock_owned().ok()
    }

    /// Drops the lock entry of a record that no longer exists. Must be called
    /// while holding that record's guard; the entry stays if anyone else is
    /// waiting on it.
    fn forget_record_lock(&self, id: &FileId) {
        // One owner in the table, one in the caller's guard.
        self.record_locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 2);
    }

    #[cfg(test)]
    pub(super) fn lock_entries(&self) -> usize {
        self.record_locks.len()
    }

    /// Writes the full catalog snapshot to disk.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let document = CatalogDocument {
            files: self.records().clone(),
        };
        let data = serde_json::to_vec(&document)?;

        let tmp = self.snapshot_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.snapshot_path).await?;
        Ok(())
    }

    /// Stores a file, replacing any previous record with the same id.
    pub async fn add_file(&self, req: AddRequest) -> Result<()> {
        let AddRequest {
            id,
            version,
            content,
            meta,
        } = req;
        let _guard = self.lock_record(&id).await;

        // The old record, if any, stays in place until the new content is on
        // disk.
        let content_checksum = match self.write_content(&id, &content).await {
            Ok(checksum) => checksum,
            Err(e) => {
                if !self.records().contains_key(&id) {
                    self.forget_record_lock(&id);
                }
                return Err(e);
            }
        };

        let now = now_ms();
        let record = FileRecord {
            id: id.clone(),
            version,
            meta_checksum: meta.checksum(),
            meta,
            status: FileStatus::Live,
            date_added: now,
            date_updated: Some(now),
            date_deleted: None,
            content_checksum,
        };
        info!(
            "Added file {} v{} ({}, {:#})",
            id,
            record.version,
            record.meta.name,
            Byte::from_u64(record.meta.size)
        );
        self.records().insert(id, record);

        self.persist().await
    }

    async fn write_content(&self, id: &FileId, content: &[u8]) -> Result<u32> {
        self.content.store(id, content).await?;
        self.content.checksum(id).await
    }

    /// Overwrites the fields present in `req` and recomputes both checksums.
    pub async fn update_file(&self, req: UpdateRequest) -> Result<()> {
        let id = req.id.clone();
        let _guard = self.lock_record(&id).await;

        {
            let mut records = self.records();
            let Some(record) = records.get_mut(&id) else {
                drop(records);
                self.forget_record_lock(&id);
                return Err(Error::NotFound(id));
            };
            if let Some(version) = req.version {
                record.version = version;
            }
            if let Some(meta) = req.meta {
                record.meta = meta;
            }
            if let Some(status) = req.status {
                record.status = status;
            }
            if let Some(date_added) = req.date_added {
                record.date_added = date_added;
            }
            if req.date_deleted.is_some() {
                record.date_deleted = req.date_deleted;
            }
            record.date_updated = Some(req.date_updated.unwrap_or_else(now_ms));
        }

        let written = match &req.content {
            Some(content) => self.write_content(&id, content).await,
            None => self.content.checksum(&id).await,
        };

        {
            let mut records = self.records();
            let record = records.get_mut(&id).ok_or_else(|| Error::NotFound(id.clone()))?;
            record.content_checksum = written?;
            record.meta_checksum = record.meta.checksum();
            info!("Updated file {} v{} ({})", id, record.version, record.meta.name);
        }

        self.persist().await
    }

    /// Soft delete leaves a tombstone; forced delete drops the record.
    /// Content is erased either way.
    pub async fn delete_file(&self, req: DeleteRequest) -> Result<()> {
        let id = req.id.clone();
        let _guard = self.lock_record(&id).await;

        if !self.records().contains_key(&id) {
            self.forget_record_lock(&id);
            return Err(Error::NotFound(id));
        }

        if req.force {
            self.content.erase(&id).await?;
            self.records().remove(&id);
            self.forget_record_lock(&id);
            info!("Erased file {}", id);
            return self.persist().await;
        }

        {
            let mut records = self.records();
            let record = records.get_mut(&id).ok_or_else(|| Error::NotFound(id.clone()))?;
            record.status = FileStatus::Deleted;
            record.date_deleted = Some(now_ms());
            if let Some(version) = req.version {
                record.version = version;
            }
        }

        let erased = self.content.erase(&id).await;

        {
            let mut records = self.records();
            let record = records.get_mut(&id).ok_or_else(|| Error::NotFound(id.clone()))?;
            erased?;
            record.content_checksum = crc32(&[]);
            info!("Deleted file {} ({})", id, record.meta.name);
        }

        self.persist().await
    }

    /// Detached copy of a record. Reads never wait on the record lock.
    pub async fn get_file(&self, id: &FileId, include_content: bool) -> Result<FileCopy> {
        let record = self
            .records()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        debug!("File requested: {} v{} ({})", id, record.version, record.meta.name);

        let content = if include_content {
            Some(self.content.fetch(id).await?)
        } else {
            None
        };
        Ok(FileCopy { record, content })
    }

    pub fn catalog_snapshot(&self) -> Catalog {
        self.records().clone()
    }

    /// Number of files this node holds, tombstones excluded.
    pub fn file_count(&self) -> usize {
        self.records().values().filter(|r| !r.is_tombstone()).count()
    }

    pub async fn integrity_scan(&self) -> Result<ScanReport> {
        self.integrity_scan_at(now_ms()).await
    }

    /// Purges expired tombstones and heals stored checksums that no longer
    /// match the record or its content. Records held by a write are skipped.
    pub async fn integrity_scan_at(&self, now: u64) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let grace = duration_ms(self.tombstone_grace);
        let ids: Vec<FileId> = self.records().keys().cloned().collect();

        for id in ids {
            let Some(_guard) = self.try_lock_record(&id) else {
                report.skipped += 1;
                continue;
            };
            let Some(record) = self.records().get(&id).cloned() else {
                self.forget_record_lock(&id);
                continue;
            };

            if record.is_tombstone()
                && record.date_deleted.map_or(true, |deleted| elapsed_ms(now, deleted) > grace)
            {
                if let Err(e) = self.content.erase(&id).await {
                    warn!("Failed to erase content of expired file {}: {}", id, e);
                    continue;
                }
                self.records().remove(&id);
                self.forget_record_lock(&id);
                report.purged += 1;
                debug!("Purged expired tombstone {}", id);
                continue;
            }

            let meta_checksum = record.meta.checksum();
            let content_checksum = match self.content.checksum(&id).await {
                Ok(checksum) => checksum,
                Err(e) => {
                    warn!("Failed to checksum content of {}: {}", id, e);
                    continue;
                }
            };

            let mut faults = Vec::new();
            if meta_checksum != record.meta_checksum {
                faults.push(Error::Corruption {
                    id: id.clone(),
                    stored: record.meta_checksum,
                    computed: meta_checksum,
                });
            }
            if content_checksum != record.content_checksum {
                faults.push(Error::Corruption {
                    id: id.clone(),
                    stored: record.content_checksum,
                    computed: content_checksum,
                });
            }
            if faults.is_empty() {
                continue;
            }

            for fault in &faults {
                warn!("{}, keeping the computed value", fault);
            }
            if let Some(stored) = self.records().get_mut(&id) {
                stored.meta_checksum = meta_checksum;
                stored.content_checksum = content_checksum;
                report.repaired += 1;
            }
        }

        if report.purged > 0 || report.repaired > 0 {
            info!(
                "Integrity scan purged {} and repaired {} records",
                report.purged, report.repaired
            );
            self.persist().await?;
        }
        Ok(report)
    }
}

async fn load_snapshot(path: &Path) -> Result<Catalog> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Catalog::new()),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str::<CatalogDocument>(&raw) {
        Ok(document) => Ok(document.files),
        Err(e) => {
            warn!("Ignoring unreadable catalog {}: {}", path.display(), e);
            Ok(Catalog::new())
        }
    }
}
