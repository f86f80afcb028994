use std::sync::Arc;

use bytes::Bytes;
use fedsql_error::{DbError, Result, ResultExt};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::access_info::AccessInfo;
use super::cachable::Cachable;
use super::results_store::ResultsStore;
use crate::arrays::field::{ColumnSchema, Row};
use crate::buffer::buffer_manager::BufferManager;
use crate::buffer::tuple_buffer::TupleBuffer;
use crate::request::command::Command;

/// Complete result of a query held in the result set cache.
///
/// Rows live in a closed tuple buffer. Entries placed into the shared tier
/// also write their rows to the results store so that the buffer can be
/// rebuilt if it's been released.
#[derive(Debug)]
pub struct CachedResults {
    buffer: Mutex<Option<Arc<TupleBuffer>>>,
    schema: ColumnSchema,
    row_count: usize,
    store_key: String,
    /// Command that produced the results, used to authorize cache hits.
    command: Arc<Command>,
    access_info: AccessInfo,
}

impl CachedResults {
    /// Create cached results from a final buffer.
    pub fn try_new(buffer: Arc<TupleBuffer>, command: Arc<Command>, access_info: AccessInfo) -> Result<Self> {
        if !buffer.is_final() {
            return Err(DbError::internal("Only complete results can be cached"));
        }
        Ok(CachedResults {
            schema: buffer.schema().clone(),
            row_count: buffer.row_count(),
            buffer: Mutex::new(Some(buffer)),
            store_key: format!("results-{}", Uuid::new_v4()),
            command,
            access_info,
        })
    }

    pub fn schema(&self) -> &ColumnSchema {
        &self.schema
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn command(&self) -> &Arc<Command> {
        &self.command
    }

    /// The buffer holding the rows, if still resident.
    pub fn buffer(&self) -> Option<Arc<TupleBuffer>> {
        self.buffer.lock().clone()
    }

    /// Drop the reference to the buffer, rows will need to be restored from
    /// the results store before the next read.
    pub fn release_buffer(&self) {
        self.buffer.lock().take();
    }
}

impl Cachable for CachedResults {
    fn prepare(&self, store: &dyn ResultsStore, _buffers: &Arc<BufferManager>) -> Result<()> {
        let buffer = self
            .buffer()
            .ok_or_else(|| DbError::internal("Cached results have no buffer to prepare"))?;
        let rows = buffer
            .get_rows(1, self.row_count)?
            .ok_or_else(|| DbError::internal("Cached results buffer not final"))?;

        let bytes = serde_json::to_vec(&rows).context("Failed to serialize cached results")?;
        store.put(&self.store_key, Bytes::from(bytes))?;
        debug!(key = %self.store_key, rows = self.row_count, "stored cached results");

        Ok(())
    }

    fn restore(&self, store: &dyn ResultsStore, buffers: &Arc<BufferManager>) -> Result<()> {
        let mut buffer = self.buffer.lock();
        if buffer.is_some() {
            return Ok(());
        }

        let bytes = store.get(&self.store_key)?.ok_or_else(|| {
            DbError::component("Cached results missing from results store")
                .with_field("key", &self.store_key)
        })?;
        let rows: Vec<Row> =
            serde_json::from_slice(&bytes).context("Failed to deserialize cached results")?;

        let restored = buffers.create_tuple_buffer(self.schema.clone());
        restored.add_tuples(rows)?;
        restored.close()?;
        debug!(key = %self.store_key, rows = restored.row_count(), "restored cached results");

        *buffer = Some(Arc::new(restored));
        Ok(())
    }

    fn access_info(&self) -> &AccessInfo {
        &self.access_info
    }

    fn data_dependent(&self) -> bool {
        true
    }

    fn on_evict(&self, store: &dyn ResultsStore) {
        if let Err(e) = store.remove(&self.store_key) {
            warn!(%e, key = %self.store_key, "failed to remove cached results from store");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::storage::MemoryStorageManager;
    use crate::cache::results_store::MemoryResultsStore;
    use crate::request::command::CommandKind;
    use crate::testutil::{int_rows, int_schema};

    fn buffers() -> Arc<BufferManager> {
        Arc::new(BufferManager::new(4, 16, Arc::new(MemoryStorageManager::new())))
    }

    fn results(buffers: &Arc<BufferManager>, rows: usize) -> CachedResults {
        let buffer = buffers.create_tuple_buffer(int_schema());
        buffer.add_tuples(int_rows(rows)).unwrap();
        buffer.close().unwrap();
        CachedResults::try_new(
            Arc::new(buffer),
            Arc::new(Command::new("select * from pm1.g1", CommandKind::Query)),
            AccessInfo::new(["pm1.g1"], 0),
        )
        .unwrap()
    }

    #[test]
    fn rejects_open_buffer() {
        let buffers = buffers();
        let buffer = buffers.create_tuple_buffer(int_schema());
        let command = Arc::new(Command::new("select * from pm1.g1", CommandKind::Query));
        assert!(CachedResults::try_new(Arc::new(buffer), command, AccessInfo::default()).is_err());
    }

    #[test]
    fn restore_after_release() {
        let buffers = buffers();
        let store = MemoryResultsStore::new();
        let results = results(&buffers, 10);

        results.prepare(&store, &buffers).unwrap();
        assert_eq!(1, store.len());

        results.release_buffer();
        assert!(results.buffer().is_none());

        results.restore(&store, &buffers).unwrap();
        let buffer = results.buffer().unwrap();
        assert!(buffer.is_final());
        assert_eq!(int_rows(10), buffer.get_rows(1, 10).unwrap().unwrap());

        results.on_evict(&store);
        assert!(store.is_empty());
    }

    #[test]
    fn restore_fails_without_stored_rows() {
        let buffers = buffers();
        let store = MemoryResultsStore::new();
        let results = results(&buffers, 3);
        results.release_buffer();

        let err = results.restore(&store, &buffers).unwrap_err();
        assert_eq!(fedsql_error::DbErrorKind::Component, err.kind());
    }
}
