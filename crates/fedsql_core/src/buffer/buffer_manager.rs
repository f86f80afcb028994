use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use fedsql_error::{DbError, Result};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use super::batch::{BatchKey, TupleBatch};
use super::storage::StorageManager;
use super::tuple_buffer::TupleBuffer;
use crate::arrays::field::ColumnSchema;

/// Manages memory for batches across all tuple buffers.
///
/// Keeps at most `max_in_memory_batches` batches resident. The least recently
/// used batch is serialized to storage when the limit is exceeded, and read
/// back when requested again.
#[derive(Debug)]
pub struct BufferManager {
    batch_size: usize,
    state: Mutex<ManagerState>,
    storage: Arc<dyn StorageManager>,
    spilled: AtomicU64,
    reloaded: AtomicU64,
}

#[derive(Debug)]
struct ManagerState {
    /// Resident batches.
    memory: LruCache<BatchKey, Arc<TupleBatch>>,
    /// Batches that have a copy in storage.
    persisted: HashSet<BatchKey>,
}

impl BufferManager {
    pub fn new(
        batch_size: usize,
        max_in_memory_batches: usize,
        storage: Arc<dyn StorageManager>,
    ) -> Self {
        let cap = NonZeroUsize::new(max_in_memory_batches).unwrap_or(NonZeroUsize::MIN);
        BufferManager {
            batch_size,
            state: Mutex::new(ManagerState {
                memory: LruCache::new(cap),
                persisted: HashSet::new(),
            }),
            storage,
            spilled: AtomicU64::new(0),
            reloaded: AtomicU64::new(0),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Create a new tuple buffer using the manager's batch size.
    pub fn create_tuple_buffer(self: &Arc<Self>, schema: ColumnSchema) -> TupleBuffer {
        TupleBuffer::new(self.clone(), schema, self.batch_size)
    }

    pub fn create_tuple_buffer_with_batch_size(
        self: &Arc<Self>,
        schema: ColumnSchema,
        batch_size: usize,
    ) -> TupleBuffer {
        TupleBuffer::new(self.clone(), schema, batch_size)
    }

    /// Number of batches written to storage.
    pub fn spill_count(&self) -> u64 {
        self.spilled.load(Ordering::Relaxed)
    }

    /// Number of batches read back from storage.
    pub fn reload_count(&self) -> u64 {
        self.reloaded.load(Ordering::Relaxed)
    }

    pub fn resident_batches(&self) -> usize {
        self.state.lock().memory.len()
    }

    /// Evict every resident batch to storage.
    pub fn evict_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        while let Some((key, batch)) = state.memory.pop_lru() {
            self.spill(&mut state, key, &batch)?;
        }
        Ok(())
    }

    pub(crate) fn add_batch(&self, key: BatchKey, batch: Arc<TupleBatch>) -> Result<()> {
        let mut state = self.state.lock();
        self.insert_resident(&mut state, key, batch)
    }

    pub(crate) fn get_batch(&self, key: BatchKey) -> Result<Arc<TupleBatch>> {
        let mut state = self.state.lock();
        if let Some(batch) = state.memory.get(&key) {
            return Ok(batch.clone());
        }

        if !state.persisted.contains(&key) {
            return Err(DbError::internal("Batch not found")
                .with_field("buffer", key.buffer_id)
                .with_field("batch", key.batch));
        }

        let bytes = self.storage.read(&key)?;
        let batch: TupleBatch = serde_json::from_slice(&bytes)?;
        let batch = Arc::new(batch);
        self.reloaded.fetch_add(1, Ordering::Relaxed);
        trace!(buffer = %key.buffer_id, batch = key.batch, "reloaded batch from storage");

        self.insert_resident(&mut state, key, batch.clone())?;

        Ok(batch)
    }

    pub(crate) fn remove_batch(&self, key: BatchKey) -> Result<()> {
        let mut state = self.state.lock();
        state.memory.pop(&key);
        if state.persisted.remove(&key) {
            self.storage.remove(&key)?;
        }
        Ok(())
    }

    pub(crate) fn remove_buffer(&self, buffer_id: Uuid, num_batches: usize) -> Result<()> {
        let mut state = self.state.lock();
        let mut any_persisted = false;
        for batch in 0..num_batches {
            let key = BatchKey { buffer_id, batch };
            state.memory.pop(&key);
            any_persisted |= state.persisted.remove(&key);
        }

        if any_persisted {
            self.storage.remove_buffer(buffer_id)?;
        }

        Ok(())
    }

    fn insert_resident(
        &self,
        state: &mut ManagerState,
        key: BatchKey,
        batch: Arc<TupleBatch>,
    ) -> Result<()> {
        if let Some((evicted_key, evicted)) = state.memory.push(key, batch) {
            // `push` returns the old value when replacing the same key.
            if evicted_key != key {
                self.spill(state, evicted_key, &evicted)?;
            }
        }
        Ok(())
    }

    fn spill(&self, state: &mut ManagerState, key: BatchKey, batch: &TupleBatch) -> Result<()> {
        // Batches are immutable once added, an existing copy is still valid.
        if state.persisted.contains(&key) {
            return Ok(());
        }

        let bytes = serde_json::to_vec(batch)?;
        self.storage.write(&key, &bytes)?;
        state.persisted.insert(key);
        self.spilled.fetch_add(1, Ordering::Relaxed);
        debug!(buffer = %key.buffer_id, batch = key.batch, bytes = bytes.len(), "spilled batch to storage");

        Ok(())
    }
}
