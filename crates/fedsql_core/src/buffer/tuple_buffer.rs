use std::sync::Arc;

use fedsql_error::{DbError, DbErrorKind, Result};
use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::batch::{BatchKey, TupleBatch};
use super::buffer_manager::BufferManager;
use crate::arrays::field::{ColumnSchema, Row};

/// Append-only row storage organized into fixed size batches.
///
/// Rows are addressed by 1-based row number. Complete batches are handed to
/// the buffer manager which may evict them to storage. The in-progress batch
/// stays with the buffer until it fills up or the buffer is closed.
///
/// Single writer, multiple readers.
#[derive(Debug)]
pub struct TupleBuffer {
    id: Uuid,
    schema: ColumnSchema,
    batch_size: usize,
    manager: Arc<BufferManager>,
    state: Mutex<BufferState>,
}

#[derive(Debug)]
struct BufferState {
    /// Rows not yet part of a complete batch.
    current: Vec<Row>,
    /// Number of batches handed off to the manager.
    num_batches: usize,
    row_count: usize,
    closed: bool,
    forward_only: bool,
    /// Batches below this index have been released (forward-only).
    lowest_batch: usize,
}

impl TupleBuffer {
    pub(crate) fn new(manager: Arc<BufferManager>, schema: ColumnSchema, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        TupleBuffer {
            id: Uuid::new_v4(),
            schema,
            batch_size,
            manager,
            state: Mutex::new(BufferState {
                current: Vec::with_capacity(batch_size),
                num_batches: 0,
                row_count: 0,
                closed: false,
                forward_only: false,
                lowest_batch: 0,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn schema(&self) -> &ColumnSchema {
        &self.schema
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Mark this buffer as forward-only.
    ///
    /// Batches before the most recently requested batch are released and can
    /// no longer be read.
    pub fn set_forward_only(&self, forward_only: bool) {
        self.state.lock().forward_only = forward_only;
    }

    pub fn is_forward_only(&self) -> bool {
        self.state.lock().forward_only
    }

    /// Number of rows in the buffer.
    ///
    /// Only final once the buffer is closed.
    pub fn row_count(&self) -> usize {
        self.state.lock().row_count
    }

    /// If the buffer has been closed and the row count is final.
    pub fn is_final(&self) -> bool {
        self.state.lock().closed
    }

    pub fn add_tuple(&self, row: Row) -> Result<()> {
        let mut state = self.state.lock();
        self.add_tuple_inner(&mut state, row)
    }

    pub fn add_tuples(&self, rows: impl IntoIterator<Item = Row>) -> Result<()> {
        let mut state = self.state.lock();
        for row in rows {
            self.add_tuple_inner(&mut state, row)?;
        }
        Ok(())
    }

    fn add_tuple_inner(&self, state: &mut BufferState, row: Row) -> Result<()> {
        if state.closed {
            return Err(DbError::internal("Cannot add rows to a closed buffer")
                .with_field("buffer", self.id));
        }
        if row.len() != self.schema.num_columns() {
            return Err(DbError::internal("Row width does not match buffer schema")
                .with_field("expected", self.schema.num_columns())
                .with_field("got", row.len()));
        }

        state.current.push(row);
        state.row_count += 1;

        if state.current.len() >= self.batch_size {
            self.flush_current(state)?;
        }

        Ok(())
    }

    fn flush_current(&self, state: &mut BufferState) -> Result<()> {
        if state.current.is_empty() {
            return Ok(());
        }

        let rows = std::mem::replace(&mut state.current, Vec::with_capacity(self.batch_size));
        let begin_row = state.num_batches * self.batch_size + 1;
        let key = self.key(state.num_batches);
        self.manager
            .add_batch(key, Arc::new(TupleBatch::new(begin_row, rows)))?;
        state.num_batches += 1;

        Ok(())
    }

    /// Close the buffer, fixing the row count.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        self.flush_current(&mut state)?;
        state.closed = true;
        Ok(())
    }

    /// Get the batch containing the given 1-based row.
    ///
    /// Returns `None` if the row isn't available yet because the buffer is
    /// still being written to. Rows past the end of a closed buffer return an
    /// empty batch.
    pub fn get_batch(&self, row: usize) -> Result<Option<Arc<TupleBatch>>> {
        if row == 0 {
            return Err(DbError::internal("Row numbers start at 1"));
        }

        let mut state = self.state.lock();

        if row > state.row_count {
            if state.closed {
                return Ok(Some(Arc::new(TupleBatch::empty(row))));
            }
            return Ok(None);
        }

        let batch_idx = (row - 1) / self.batch_size;
        if batch_idx < state.lowest_batch {
            return Err(DbError::with_kind(
                DbErrorKind::Processing,
                "Row is no longer available in forward-only buffer",
            )
            .with_field("row", row));
        }

        let batch = if batch_idx < state.num_batches {
            self.manager.get_batch(self.key(batch_idx))?
        } else {
            // Row is in the in-progress batch.
            let begin_row = state.num_batches * self.batch_size + 1;
            Arc::new(TupleBatch::new(begin_row, state.current.clone()))
        };

        if state.forward_only {
            for idx in state.lowest_batch..batch_idx.min(state.num_batches) {
                self.manager.remove_batch(self.key(idx))?;
            }
            state.lowest_batch = state.lowest_batch.max(batch_idx);
        }

        Ok(Some(batch))
    }

    /// Get up to `count` rows starting at `begin_row`.
    ///
    /// Returns `None` if the buffer isn't final and doesn't yet hold all of
    /// the requested rows.
    pub fn get_rows(&self, begin_row: usize, count: usize) -> Result<Option<Vec<Row>>> {
        let (row_count, closed) = {
            let state = self.state.lock();
            (state.row_count, state.closed)
        };

        // Clients may ask for far more rows than exist.
        let end_row = begin_row.saturating_add(count.max(1) - 1);
        if !closed && end_row > row_count {
            return Ok(None);
        }
        let end_row = end_row.min(row_count);

        let mut rows = Vec::with_capacity((end_row + 1).saturating_sub(begin_row));
        let mut row = begin_row;
        while row <= end_row {
            let batch = match self.get_batch(row)? {
                Some(batch) => batch,
                None => return Ok(None),
            };
            if batch.is_empty() {
                break;
            }
            let take_end = batch.end_row().min(end_row);
            rows.extend_from_slice(&batch.rows[(row - batch.begin_row)..=(take_end - batch.begin_row)]);
            row = take_end + 1;
        }

        Ok(Some(rows))
    }

    fn key(&self, batch: usize) -> BatchKey {
        BatchKey {
            buffer_id: self.id,
            batch,
        }
    }
}

impl Drop for TupleBuffer {
    fn drop(&mut self) {
        let num_batches = self.state.get_mut().num_batches;
        if let Err(e) = self.manager.remove_buffer(self.id, num_batches) {
            warn!(%e, buffer = %self.id, "failed to remove buffer batches");
        }
    }
}
