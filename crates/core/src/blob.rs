use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::RwLock,
};

use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

use crate::{StorageError, StorageResult};

/// Trait for attachment content storage.
///
/// Keys are content addressed, so putting an existing key is a no-op and
/// re-processing a message never rewrites stored content.
pub trait BlobStore: Send + Sync {
    fn put(
        &self,
        key: &str,
        content: &[u8],
    ) -> impl std::future::Future<Output = StorageResult<()>> + Send;

    fn get(&self, key: &str) -> impl std::future::Future<Output = StorageResult<Vec<u8>>> + Send;
}

/// Rejects keys that could escape the storage root.
fn check_key(key: &str) -> StorageResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    match valid {
        true => Ok(()),
        false => Err(StorageError::Invalid(format!("blob key '{key}'"))),
    }
}

/// Stores blobs as files under a base directory, one file per key.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    base_path: PathBuf,
}

impl FileBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }
}

impl BlobStore for FileBlobStore {
    async fn put(&self, key: &str, content: &[u8]) -> StorageResult<()> {
        check_key(key)?;
        let path = self.blob_path(key);
        if fs::try_exists(&path).await? {
            debug!(key, "Blob already stored");
            return Ok(());
        }
        fs::create_dir_all(&self.base_path).await?;

        // one partial file per writer, readers only ever see a complete blob
        let partial = self
            .base_path
            .join(format!(".{key}.{:016x}.partial", rand::random::<u64>()));
        if let Err(e) = write_partial(&partial, content).await {
            fs::remove_file(&partial).await.ok();
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&partial, &path).await {
            fs::remove_file(&partial).await.ok();
            if fs::try_exists(&path).await.unwrap_or(false) {
                debug!(key, "Blob stored by a concurrent writer");
                return Ok(());
            }
            return Err(e.into());
        }
        debug!(key, size = content.len(), path = %path.display(), "Stored blob");
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        check_key(key)?;
        Ok(fs::read(self.blob_path(key)).await?)
    }
}

async fn write_partial(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(content).await?;
    file.sync_all().await
}

/// In-memory blob storage, useful for testing.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|blobs| blobs.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs
            .read()
            .map(|blobs| blobs.contains_key(key))
            .unwrap_or_default()
    }
}

impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, content: &[u8]) -> StorageResult<()> {
        check_key(key)?;
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| StorageError::Engine("blob store lock poisoned".to_string()))?;
        blobs
            .entry(key.to_string())
            .or_insert_with(|| content.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        check_key(key)?;
        let blobs = self
            .blobs
            .read()
            .map_err(|_| StorageError::Engine("blob store lock poisoned".to_string()))?;
        blobs.get(key).cloned().ok_or(StorageError::NotFound)
    }
}
