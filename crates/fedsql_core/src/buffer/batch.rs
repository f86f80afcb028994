use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::arrays::field::Row;

/// Identifies a single batch of a tuple buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchKey {
    pub buffer_id: Uuid,
    /// Zero-based batch number within the buffer.
    pub batch: usize,
}

/// A contiguous run of rows from a tuple buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleBatch {
    /// 1-based row number of the first row in this batch.
    pub begin_row: usize,
    pub rows: Vec<Row>,
}

impl TupleBatch {
    pub fn new(begin_row: usize, rows: Vec<Row>) -> Self {
        TupleBatch { begin_row, rows }
    }

    /// An empty batch positioned at the given row.
    pub fn empty(begin_row: usize) -> Self {
        TupleBatch {
            begin_row,
            rows: Vec::new(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 1-based row number of the last row in this batch.
    ///
    /// For an empty batch, this is one before `begin_row`.
    pub fn end_row(&self) -> usize {
        self.begin_row + self.rows.len() - 1
    }

    pub fn contains_row(&self, row: usize) -> bool {
        !self.rows.is_empty() && row >= self.begin_row && row <= self.end_row()
    }

    /// Get a row by its 1-based row number.
    pub fn get_row(&self, row: usize) -> Option<&Row> {
        if !self.contains_row(row) {
            return None;
        }
        self.rows.get(row - self.begin_row)
    }
}
