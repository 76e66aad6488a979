use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::common::{crc32, FileId};
use crate::error::Result;

const STAGING_DIR: &str = ".staging";

/// Raw file payloads, one blob per file id.
pub struct ContentStore {
    // The path to the blob directory.
    files_dir: PathBuf,
    // Partial writes. Ids never start with a dot, so no blob can land here.
    staging_dir: PathBuf,
}

impl ContentStore {
    /// Opens the store under `root/files`, creating the directories if needed.
    pub async fn open(root: &Path) -> Result<ContentStore> {
        let files_dir = root.join("files");
        let staging_dir = files_dir.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging_dir).await?;
        Ok(ContentStore {
            files_dir,
            staging_dir,
        })
    }

    fn blob_path(&self, id: &FileId) -> PathBuf {
        self.files_dir.join(id.as_str())
    }

    /// Writes or overwrites the blob. The data lands in a temp file first and
    /// is renamed over the old blob, so readers never see a torn write.
    pub async fn store(&self, id: &FileId, data: &[u8]) -> Result<()> {
        let path = self.blob_path(id);
        let tmp = self.staging_dir.join(id.as_str());
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Stored bytes, or an empty buffer when the blob is missing.
    pub async fn fetch(&self, id: &FileId) -> Result<Vec<u8>> {
        match tokio::fs::read(self.blob_path(id)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the blob. Missing blobs are fine.
    pub async fn erase(&self, id: &FileId) -> Result<()> {
        match tokio::fs::remove_file(self.blob_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// CRC-32 of the stored bytes; a missing blob counts as empty content.
    pub async fn checksum(&self, id: &FileId) -> Result<u32> {
        let data = self.fetch(id).await?;
        Ok(crc32(&data))
    }
}
