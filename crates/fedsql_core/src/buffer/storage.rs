use std::collections::HashMap;
use std::fmt::Debug;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use fedsql_error::{DbError, Result, ResultExt};
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use super::batch::BatchKey;

/// Secondary storage for batches evicted from memory.
pub trait StorageManager: Debug + Sync + Send {
    /// Write the serialized batch. Overwrites an existing batch with the same
    /// key.
    fn write(&self, key: &BatchKey, data: &[u8]) -> Result<()>;

    /// Read back exactly the bytes previously written for the key.
    fn read(&self, key: &BatchKey) -> Result<Bytes>;

    /// Remove a single batch. Removing a missing batch is not an error.
    fn remove(&self, key: &BatchKey) -> Result<()>;

    /// Remove all batches for a buffer.
    fn remove_buffer(&self, buffer_id: Uuid) -> Result<()>;
}

/// Storage that keeps serialized batches in memory.
#[derive(Debug, Default)]
pub struct MemoryStorageManager {
    batches: Mutex<HashMap<BatchKey, Bytes>>,
}

impl MemoryStorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_batches(&self) -> usize {
        self.batches.lock().len()
    }
}

impl StorageManager for MemoryStorageManager {
    fn write(&self, key: &BatchKey, data: &[u8]) -> Result<()> {
        self.batches
            .lock()
            .insert(*key, Bytes::copy_from_slice(data));
        Ok(())
    }

    fn read(&self, key: &BatchKey) -> Result<Bytes> {
        self.batches.lock().get(key).cloned().ok_or_else(|| {
            DbError::component("Missing batch in storage")
                .with_field("buffer", key.buffer_id)
                .with_field("batch", key.batch)
        })
    }

    fn remove(&self, key: &BatchKey) -> Result<()> {
        self.batches.lock().remove(key);
        Ok(())
    }

    fn remove_buffer(&self, buffer_id: Uuid) -> Result<()> {
        self.batches
            .lock()
            .retain(|key, _| key.buffer_id != buffer_id);
        Ok(())
    }
}

/// Storage writing one file per batch, grouped in a directory per buffer.
#[derive(Debug)]
pub struct FileStorageManager {
    root: PathBuf,
}

impl FileStorageManager {
    pub fn try_new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).context("Failed to create spill directory")?;
        Ok(FileStorageManager { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn buffer_dir(&self, buffer_id: Uuid) -> PathBuf {
        self.root.join(buffer_id.to_string())
    }

    fn batch_path(&self, key: &BatchKey) -> PathBuf {
        self.buffer_dir(key.buffer_id)
            .join(format!("{}.batch", key.batch))
    }
}

impl StorageManager for FileStorageManager {
    fn write(&self, key: &BatchKey, data: &[u8]) -> Result<()> {
        let dir = self.buffer_dir(key.buffer_id);
        fs::create_dir_all(&dir).context("Failed to create buffer directory")?;

        let path = self.batch_path(key);
        trace!(?path, len = data.len(), "writing batch to file");
        fs::write(&path, data).context_fn(|| format!("Failed to write batch to {path:?}"))?;

        Ok(())
    }

    fn read(&self, key: &BatchKey) -> Result<Bytes> {
        let path = self.batch_path(key);
        let data = fs::read(&path).context_fn(|| format!("Failed to read batch from {path:?}"))?;
        Ok(Bytes::from(data))
    }

    fn remove(&self, key: &BatchKey) -> Result<()> {
        match fs::remove_file(self.batch_path(key)) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_buffer(&self, buffer_id: Uuid) -> Result<()> {
        match fs::remove_dir_all(self.buffer_dir(buffer_id)) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
