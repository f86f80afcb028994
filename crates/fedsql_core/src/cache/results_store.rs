use std::collections::HashMap;
use std::fmt::Debug;

use bytes::Bytes;
use fedsql_error::Result;
use parking_lot::RwLock;

/// Shared tier storage for cache payloads.
///
/// Values placed into the shared cache tier serialize whatever they can't
/// share by reference here, and read it back on restore.
pub trait ResultsStore: Debug + Sync + Send {
    fn put(&self, key: &str, data: Bytes) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Bytes>>;

    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryResultsStore {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryResultsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultsStore for MemoryResultsStore {
    fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.entries.write().insert(key.to_string(), data);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}
