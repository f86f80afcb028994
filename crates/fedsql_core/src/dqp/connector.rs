use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::task::{Context, Poll};

use fedsql_error::Result;
use parking_lot::RwLock;
use tracing::debug;

use super::AtomicRequestMessage;
use crate::arrays::field::Row;

/// What a source can do, used when planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceCapabilities {
    pub supports_order_by: bool,
    pub supports_row_limit: bool,
    pub supports_batched_updates: bool,
    pub supports_transactions: bool,
}

impl Default for SourceCapabilities {
    fn default() -> Self {
        SourceCapabilities {
            supports_order_by: true,
            supports_row_limit: true,
            supports_batched_updates: false,
            supports_transactions: true,
        }
    }
}

/// A single execution against a source.
pub trait ConnectorExecution: Debug + Send {
    /// Poll for the next row.
    ///
    /// `Ready(Ok(None))` signals end of data. `Pending` must arrange for the
    /// context's waker to be woken once more data is available.
    fn poll_next_row(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Row>>>;

    /// Ask the source to stop producing rows.
    fn cancel(&mut self) -> Result<()>;

    /// Release source resources. Called exactly once.
    fn close(&mut self) -> Result<()>;
}

pub trait ConnectorManager: Debug + Sync + Send {
    fn binding_name(&self) -> &str;

    fn register_request(&self, message: &AtomicRequestMessage) -> Result<Box<dyn ConnectorExecution>>;

    fn capabilities(&self) -> SourceCapabilities;
}

pub trait ConnectorManagerRepository: Debug + Sync + Send {
    fn connector_manager(&self, binding: &str) -> Option<Arc<dyn ConnectorManager>>;
}

/// Connector managers keyed by binding name.
///
/// Read mostly, lookups only take a read lock.
#[derive(Debug, Default)]
pub struct ConnectorManagers {
    managers: RwLock<HashMap<String, Arc<dyn ConnectorManager>>>,
}

impl ConnectorManagers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, manager: Arc<dyn ConnectorManager>) {
        let binding = manager.binding_name().to_string();
        debug!(%binding, "adding connector manager");
        self.managers.write().insert(binding, manager);
    }

    pub fn remove(&self, binding: &str) -> Option<Arc<dyn ConnectorManager>> {
        self.managers.write().remove(binding)
    }

    pub fn bindings(&self) -> Vec<String> {
        self.managers.read().keys().cloned().collect()
    }
}

impl ConnectorManagerRepository for ConnectorManagers {
    fn connector_manager(&self, binding: &str) -> Option<Arc<dyn ConnectorManager>> {
        self.managers.read().get(binding).cloned()
    }
}
