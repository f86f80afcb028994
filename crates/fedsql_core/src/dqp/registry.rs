use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::connector_work::SourceShared;
use super::limiter::SourceLimiter;
use super::{AtomicRequestId, SourceWarning};
use crate::request::request_id::RequestId;

/// Open atomic requests and source warnings of a single user request.
#[derive(Debug)]
pub struct AtomicRequestRegistry {
    request_id: RequestId,
    next_execution: AtomicU64,
    limiter: Arc<SourceLimiter>,
    sources: Mutex<HashMap<AtomicRequestId, Arc<SourceShared>>>,
    warnings: Mutex<Vec<SourceWarning>>,
}

impl AtomicRequestRegistry {
    pub fn new(request_id: RequestId, source_concurrency: usize) -> Self {
        AtomicRequestRegistry {
            request_id,
            next_execution: AtomicU64::new(0),
            limiter: Arc::new(SourceLimiter::new(source_concurrency)),
            sources: Mutex::new(HashMap::new()),
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn limiter(&self) -> &Arc<SourceLimiter> {
        &self.limiter
    }

    pub(crate) fn next_atomic_id(&self, node_id: usize) -> AtomicRequestId {
        AtomicRequestId {
            request_id: self.request_id.clone(),
            node_id,
            execution_count: self.next_execution.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn register(&self, source: Arc<SourceShared>) {
        self.sources.lock().insert(source.id().clone(), source);
    }

    pub(crate) fn remove(&self, id: &AtomicRequestId) -> Option<Arc<SourceShared>> {
        self.sources.lock().remove(id)
    }

    pub fn contains(&self, id: &AtomicRequestId) -> bool {
        self.sources.lock().contains_key(id)
    }

    pub fn open_requests(&self) -> Vec<AtomicRequestId> {
        self.sources.lock().keys().cloned().collect()
    }

    /// Close a single atomic request.
    ///
    /// Returns false if no such request is open.
    pub fn close(&self, id: &AtomicRequestId) -> bool {
        match self.remove(id) {
            Some(source) => {
                debug!(%id, "closing atomic request");
                source.close();
                true
            }
            None => false,
        }
    }

    /// Ask every open source to stop producing rows.
    pub fn cancel_all(&self) {
        let sources: Vec<_> = self.sources.lock().values().cloned().collect();
        for source in sources {
            source.cancel();
        }
    }

    pub fn close_all(&self) {
        let sources: Vec<_> = self.sources.lock().drain().map(|(_, s)| s).collect();
        for source in sources {
            source.close();
        }
    }

    pub fn add_warning(&self, warning: SourceWarning) {
        self.warnings.lock().push(warning);
    }

    /// Take warnings not yet sent to the client.
    pub fn take_warnings(&self) -> Vec<SourceWarning> {
        std::mem::take(&mut *self.warnings.lock())
    }
}
