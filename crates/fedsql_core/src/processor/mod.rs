//! Executable plans.

pub mod access;
pub mod batched;

use std::fmt::Debug;
use std::sync::Arc;
use std::task::{Context, Poll};

use fedsql_error::Result;

use crate::arrays::field::{ColumnSchema, Row};
use crate::dqp::data_tier::DataTierManager;
use crate::request::context::CommandContext;

/// An optimized, executable plan.
///
/// Lifecycle is `initialize` -> `open` -> `poll_next_batch` until `None` ->
/// `close`. Plans taken from the plan cache are templates and must be cloned
/// with `clone_plan` before initializing.
pub trait ProcessorPlan: Debug + Sync + Send {
    fn initialize(&mut self, context: &CommandContext, data_manager: &Arc<DataTierManager>) -> Result<()>;

    fn open(&mut self) -> Result<()>;

    /// Poll for the next batch of rows.
    ///
    /// `Ready(Ok(None))` once all rows have been produced. `Pending` when
    /// blocked on a source, the context's waker will be woken when progress
    /// can be made.
    fn poll_next_batch(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Vec<Row>>>>;

    /// Release any sources. Safe to call more than once.
    fn close(&mut self) -> Result<()>;

    fn output_schema(&self) -> &ColumnSchema;

    /// Copy of the plan without any execution state.
    fn clone_plan(&self) -> Box<dyn ProcessorPlan>;

    /// Limit the number of rows the plan produces.
    fn apply_row_limit(&mut self, limit: usize);

    /// Whether executing the plan needs to be wrapped in a transaction for
    /// atomicity.
    fn requires_transaction(&self, transactional_reads: bool) -> bool;
}
