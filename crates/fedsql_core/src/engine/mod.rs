//! Request execution.
//!
//! Every user request runs as a work item on the engine's pool. Clients
//! interact with a request through futures that resolve once the work item
//! has something for them.

pub mod future;
mod lob;
mod request_work;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use fedsql_error::{DbError, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::buffer::buffer_manager::BufferManager;
use crate::buffer::storage::{FileStorageManager, MemoryStorageManager, StorageManager};
use crate::cache::access_info::ModificationTracker;
use crate::cache::cached_results::CachedResults;
use crate::cache::prepared_plan::PreparedPlan;
use crate::cache::results_store::ResultsStore;
use crate::cache::session_cache::SessionAwareCache;
use crate::config::engine::EngineConfig;
use crate::dqp::AtomicRequestId;
use crate::dqp::connector::ConnectorManagerRepository;
use crate::dqp::data_tier::DataTierManager;
use crate::dqp::registry::AtomicRequestRegistry;
use crate::request::SessionContext;
use crate::request::message::{LobChunk, RequestMessage, ResultsMessage};
use crate::request::planner::PlanningServices;
use crate::request::request::PlanningEnvironment;
use crate::request::request_id::RequestId;
use crate::runtime::pool::{ThreadedWorkPool, WorkPool};
use crate::runtime::work_item::WorkItem;
use crate::transaction::server::TransactionServer;
use crate::transaction::{TransactionManager, XaTerminator};
use future::ResultsFuture;
use lob::{LobStreams, LobWork};
use request_work::{ClientState, CursorRequest, RequestWork};

/// Collaborators the engine is built from.
#[derive(Debug)]
pub struct EngineDependencies {
    pub planning: PlanningServices,
    pub connectors: Arc<dyn ConnectorManagerRepository>,
    pub transaction_manager: Arc<dyn TransactionManager>,
    pub xa_terminator: Arc<dyn XaTerminator>,
    /// Backing store for the shared tier of the caches.
    pub results_store: Arc<dyn ResultsStore>,
    pub pool: Arc<dyn WorkPool>,
}

/// Create the threaded work pool sized by the config.
pub fn create_work_pool(config: &EngineConfig) -> Result<Arc<dyn WorkPool>> {
    let pool = match config.worker_threads {
        Some(threads) => ThreadedWorkPool::try_new(threads)?,
        None => ThreadedWorkPool::try_new_default()?,
    };
    Ok(Arc::new(pool))
}

/// Services shared by every request work item.
#[derive(Debug)]
pub(crate) struct ExecutionServices {
    pub(crate) config: EngineConfig,
    pub(crate) buffers: Arc<BufferManager>,
    pub(crate) data_manager: Arc<DataTierManager>,
    pub(crate) planning: PlanningEnvironment,
    pub(crate) results_cache: Arc<SessionAwareCache<CachedResults>>,
    pub(crate) transactions: Arc<TransactionServer>,
    pub(crate) pool: Arc<dyn WorkPool>,
}

#[derive(Debug, Clone)]
pub(crate) struct RequestEntry {
    item: Arc<WorkItem<RequestWork>>,
    client: Arc<Mutex<ClientState>>,
    registry: Arc<AtomicRequestRegistry>,
}

#[derive(Debug)]
pub struct Engine {
    services: Arc<ExecutionServices>,
    requests: Arc<DashMap<RequestId, RequestEntry>>,
    lob_streams: Arc<LobStreams>,
    next_execution: AtomicU64,
}

impl Engine {
    pub fn try_new(config: EngineConfig, deps: EngineDependencies) -> Result<Self> {
        config.validate()?;

        let storage: Arc<dyn StorageManager> = match &config.spill_directory {
            Some(dir) => Arc::new(FileStorageManager::try_new(dir)?),
            None => Arc::new(MemoryStorageManager::new()),
        };
        let buffers = Arc::new(BufferManager::new(
            config.batch_size,
            config.max_in_memory_batches,
            storage,
        ));

        // Both caches see the same modifications.
        let tracker = Arc::new(ModificationTracker::new());
        let plan_cache = Arc::new(SessionAwareCache::new(
            "plan_cache",
            config.max_plan_cache_entries,
            deps.results_store.clone(),
            buffers.clone(),
            tracker.clone(),
        ));
        let results_cache = Arc::new(SessionAwareCache::new(
            "results_cache",
            config.max_results_cache_entries,
            deps.results_store,
            buffers.clone(),
            tracker,
        ));

        let data_manager = Arc::new(DataTierManager::new(
            deps.connectors.clone(),
            deps.pool.clone(),
            config.connector_queue_size,
        ));
        let transactions = Arc::new(TransactionServer::new(
            deps.transaction_manager,
            deps.xa_terminator,
        ));

        info!(
            batch_size = config.batch_size,
            source_concurrency = config.user_request_source_concurrency,
            spill = ?config.spill_directory,
            "created engine"
        );

        let services = ExecutionServices {
            planning: PlanningEnvironment {
                services: deps.planning,
                plan_cache,
                connectors: deps.connectors,
            },
            config,
            buffers,
            data_manager,
            results_cache,
            transactions,
            pool: deps.pool,
        };

        Ok(Engine {
            services: Arc::new(services),
            requests: Arc::new(DashMap::new()),
            lob_streams: Arc::new(DashMap::new()),
            next_execution: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.services.buffers
    }

    pub fn transaction_server(&self) -> &Arc<TransactionServer> {
        &self.services.transactions
    }

    pub fn plan_cache(&self) -> &Arc<SessionAwareCache<PreparedPlan>> {
        &self.services.planning.plan_cache
    }

    pub fn results_cache(&self) -> &Arc<SessionAwareCache<CachedResults>> {
        &self.services.results_cache
    }

    fn entry(&self, id: &RequestId) -> Result<RequestEntry> {
        // Clone out so the table isn't locked while we work with the entry.
        self.requests
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| DbError::new("Request not found").with_field("request", id))
    }

    /// Submit a request for execution.
    ///
    /// The returned future resolves with the first window of results, or the
    /// error that stopped the request.
    pub fn execute_request(
        &self,
        session: &SessionContext,
        message: RequestMessage,
    ) -> Result<(RequestId, ResultsFuture<ResultsMessage>)> {
        let execution_id = self.next_execution.fetch_add(1, Ordering::Relaxed);
        let id = RequestId::new(session.session_id.clone(), execution_id);

        let (sender, future) = ResultsFuture::channel();
        let client = Arc::new(Mutex::new(ClientState::new(CursorRequest {
            begin_row: 1,
            fetch_size: message.fetch_size.max(1),
            sender,
        })));
        let registry = Arc::new(AtomicRequestRegistry::new(
            id.clone(),
            self.services.config.user_request_source_concurrency,
        ));

        debug!(request = %id, sql = %message.sql, "executing request");

        let work = RequestWork::new(
            id.clone(),
            self.services.clone(),
            session.clone(),
            message,
            client.clone(),
            registry.clone(),
            Arc::downgrade(&self.requests),
        );
        let item = WorkItem::new(format!("request-{id}"), work, self.services.pool.clone());

        self.requests.insert(
            id.clone(),
            RequestEntry {
                item: item.clone(),
                client,
                registry,
            },
        );
        item.submit();

        Ok((id, future))
    }

    /// Request a window of rows starting at the 1-based `begin_row`.
    pub fn process_cursor_request(
        &self,
        id: &RequestId,
        begin_row: usize,
        fetch_size: usize,
    ) -> Result<ResultsFuture<ResultsMessage>> {
        if begin_row == 0 {
            return Err(DbError::new("Row numbers start at 1").with_field("request", id));
        }

        let entry = self.entry(id)?;
        let (sender, future) = ResultsFuture::channel();
        {
            let mut client = entry.client.lock();
            if client.cursor.is_some() {
                return Err(DbError::new("Previous cursor request still pending")
                    .with_field("request", id));
            }
            client.cursor = Some(CursorRequest {
                begin_row,
                fetch_size: fetch_size.max(1),
                sender,
            });
        }
        entry.item.more_work();

        Ok(future)
    }

    /// Request the next chunk of a large object returned by the request.
    pub fn request_next_lob_chunk(&self, id: &RequestId, lob_id: &str) -> Result<ResultsFuture<LobChunk>> {
        let entry = self.entry(id)?;
        let lob = entry.client.lock().lobs.get(lob_id).cloned().ok_or_else(|| {
            DbError::new("Large object not found")
                .with_field("request", id)
                .with_field("lob", lob_id)
        })?;

        let (mut sender, future) = ResultsFuture::channel();
        let key = (id.clone(), lob_id.to_string());

        let existing = self.lob_streams.get(&key).map(|item| item.clone());
        if let Some(item) = existing {
            match item.with_work(|work| work.enqueue(sender)) {
                Ok(()) => {
                    item.more_work();
                    return Ok(future);
                }
                Err(returned) => {
                    // Previous stream finished, start from the beginning.
                    sender = returned;
                    self.lob_streams.remove(&key);
                }
            }
        }

        let mut work = LobWork::new(lob.data, self.services.config.lob_chunk_size)
            .with_registration(Arc::downgrade(&self.lob_streams), key.clone());
        if work.enqueue(sender).is_err() {
            return Err(DbError::internal("New large object stream rejected chunk request"));
        }
        let item = WorkItem::new(format!("lob-{id}-{lob_id}"), work, self.services.pool.clone());
        self.lob_streams.insert(key, item.clone());
        item.submit();

        Ok(future)
    }

    /// Cancel a request.
    ///
    /// Cooperative. Sources are asked to stop and the request fails the next
    /// time it runs.
    pub fn cancel_request(&self, id: &RequestId) -> Result<()> {
        let entry = self.entry(id)?;
        entry.client.lock().canceled = true;
        entry.registry.cancel_all();
        self.services
            .transactions
            .cancel_transactions(&id.session_id, true);
        entry.item.more_work();
        debug!(request = %id, "canceled request");
        Ok(())
    }

    /// Close a request, releasing its results.
    pub fn close_request(&self, id: &RequestId) -> Result<()> {
        let entry = self.entry(id)?;
        entry.client.lock().close_requested = true;
        self.lob_streams.retain(|(request, _), _| request != id);
        entry.item.more_work();
        Ok(())
    }

    /// Close a single atomic request of a request.
    ///
    /// Returns false if the atomic request isn't open.
    pub fn close_atomic_request(&self, id: &AtomicRequestId) -> Result<bool> {
        let entry = self.entry(&id.request_id)?;
        let closed = entry.registry.close(id);
        if closed {
            // Let the request observe the closed source.
            entry.item.more_work();
        }
        Ok(closed)
    }

    /// Requests currently open for a session, in submission order.
    pub fn requests_for_session(&self, session_id: &str) -> Vec<RequestId> {
        let mut ids: Vec<_> = self
            .requests
            .iter()
            .filter(|entry| entry.key().session_id == session_id)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Cancel and close every request of a session and release its
    /// transactions.
    pub fn terminate_session(&self, session_id: &str) -> Result<()> {
        let ids = self.requests_for_session(session_id);
        for id in &ids {
            self.cancel_request(id)?;
            self.close_request(id)?;
        }
        self.services.transactions.terminate_thread(session_id)?;
        info!(session = %session_id, requests = ids.len(), "terminated session");
        Ok(())
    }

    pub fn clear_plan_cache(&self) {
        self.plan_cache().clear_all();
    }

    pub fn clear_results_cache(&self) {
        self.results_cache().clear_all();
    }

    /// Clear cached plans and results of a single VDB version.
    pub fn clear_caches_for_vdb(&self, name: &str, version: u32) {
        self.plan_cache().clear_for_vdb(name, version);
        self.results_cache().clear_for_vdb(name, version);
    }
}
