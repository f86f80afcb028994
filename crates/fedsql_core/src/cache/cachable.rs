use std::sync::Arc;

use fedsql_error::Result;

use super::access_info::AccessInfo;
use super::results_store::ResultsStore;
use crate::buffer::buffer_manager::BufferManager;

/// Capabilities a value needs to be held in a [`SessionAwareCache`].
///
/// [`SessionAwareCache`]: super::session_cache::SessionAwareCache
pub trait Cachable: Send + Sync + 'static {
    /// Prepare the value for the shared tier.
    ///
    /// Called once before a shared entry is stored. An error skips caching
    /// the value.
    fn prepare(&self, store: &dyn ResultsStore, buffers: &Arc<BufferManager>) -> Result<()>;

    /// Restore a value read from the shared tier.
    ///
    /// An error evicts the entry.
    fn restore(&self, store: &dyn ResultsStore, buffers: &Arc<BufferManager>) -> Result<()>;

    /// Objects the value was computed from.
    fn access_info(&self) -> &AccessInfo;

    /// Whether any data change to an accessed object invalidates the value,
    /// as opposed to only structural changes.
    fn data_dependent(&self) -> bool;

    /// Release anything held outside of the value itself when evicted.
    fn on_evict(&self, _store: &dyn ResultsStore) {}
}
