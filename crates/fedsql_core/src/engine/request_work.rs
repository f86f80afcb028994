use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use fedsql_error::{DbError, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::future::{ResultSender, send_result};
use super::{ExecutionServices, RequestEntry};
use crate::arrays::scalar::{LobValue, ScalarValue};
use crate::buffer::tuple_buffer::TupleBuffer;
use crate::cache::access_info::AccessInfo;
use crate::cache::cache_id::CacheId;
use crate::cache::cached_results::CachedResults;
use crate::dqp::registry::AtomicRequestRegistry;
use crate::processor::ProcessorPlan;
use crate::request::SessionContext;
use crate::request::command::Command;
use crate::request::context::CommandContext;
use crate::request::message::{CursorType, RequestMessage, ResultsMessage, TransactionAutoWrap};
use crate::request::request::{ProcessedRequest, process_request};
use crate::request::request_id::RequestId;
use crate::runtime::work_item::Work;
use crate::transaction::{TransactionScope, TransactionSnapshot};

/// A client's outstanding request for a window of rows.
#[derive(Debug)]
pub(crate) struct CursorRequest {
    pub(crate) begin_row: usize,
    pub(crate) fetch_size: usize,
    pub(crate) sender: ResultSender<ResultsMessage>,
}

/// Client facing state of a request, shared between the engine and the
/// request's work item.
#[derive(Debug)]
pub(crate) struct ClientState {
    pub(crate) cursor: Option<CursorRequest>,
    pub(crate) last_delivered_row: usize,
    pub(crate) canceled: bool,
    pub(crate) close_requested: bool,
    /// Large objects sent to the client, by id.
    pub(crate) lobs: HashMap<String, LobValue>,
}

impl ClientState {
    pub(crate) fn new(cursor: CursorRequest) -> Self {
        ClientState {
            cursor: Some(cursor),
            last_delivered_row: 0,
            canceled: false,
            close_requested: false,
            lobs: HashMap::new(),
        }
    }
}

/// Plan execution owned by a request until all rows are produced.
#[derive(Debug)]
struct Execution {
    plan: Box<dyn ProcessorPlan>,
    context: CommandContext,
    commands: Vec<Arc<Command>>,
    /// Request scoped transaction to complete once the plan finishes.
    transaction: Option<TransactionSnapshot>,
    /// Where to put the results once complete, if they should be cached.
    cache_id: Option<CacheId>,
    /// Modification version before execution started.
    version: u64,
}

#[derive(Debug)]
struct Processing {
    /// None once every row has been produced, or if the rows came from the
    /// result set cache.
    execution: Option<Execution>,
    buffer: Arc<TupleBuffer>,
    from_cache: bool,
}

#[derive(Debug)]
enum RequestState {
    New,
    Processing(Box<Processing>),
    /// Holding an error until a cursor request picks it up.
    Failed(DbError),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessStatus {
    /// Yield the thread, something will wake us.
    Yield,
    /// Client asked to close.
    Close,
}

/// Drives a single user request from planning through delivering results.
#[derive(Debug)]
pub(crate) struct RequestWork {
    id: RequestId,
    services: Arc<ExecutionServices>,
    session: SessionContext,
    message: RequestMessage,
    client: Arc<Mutex<ClientState>>,
    registry: Arc<AtomicRequestRegistry>,
    /// Weak to avoid a cycle through the table holding this work item.
    requests: Weak<DashMap<RequestId, RequestEntry>>,
    state: RequestState,
}

impl RequestWork {
    pub(crate) fn new(
        id: RequestId,
        services: Arc<ExecutionServices>,
        session: SessionContext,
        message: RequestMessage,
        client: Arc<Mutex<ClientState>>,
        registry: Arc<AtomicRequestRegistry>,
        requests: Weak<DashMap<RequestId, RequestEntry>>,
    ) -> Self {
        RequestWork {
            id,
            services,
            session,
            message,
            client,
            registry,
            requests,
            state: RequestState::New,
        }
    }

    fn check_canceled(&self) -> Result<bool> {
        let client = self.client.lock();
        if client.canceled {
            return Err(DbError::canceled("Request canceled").with_field("request", &self.id));
        }
        Ok(client.close_requested)
    }

    fn results_cache_id(&self) -> CacheId {
        CacheId::new(
            &self.message.sql,
            self.message.parse_info,
            self.session.session_id.clone(),
            self.session.user.clone(),
            self.session.metadata.vdb().clone(),
        )
        .with_parameters(self.message.parameter_values.clone())
    }

    fn lookup_cached_results(&self) -> Result<Option<Processing>> {
        if !self.message.use_result_set_cache || self.message.is_batched_update() {
            return Ok(None);
        }

        let Some(cached) = self.services.results_cache.get(&self.results_cache_id()) else {
            return Ok(None);
        };

        // Shared entries may have been produced by another user.
        self.session.validator.validate_access(
            &self.session.user,
            cached.command(),
            self.session.metadata.as_ref(),
        )?;

        let Some(buffer) = cached.buffer() else {
            return Ok(None);
        };

        debug!(request = %self.id, rows = cached.row_count(), "using cached results");

        Ok(Some(Processing {
            execution: None,
            buffer,
            from_cache: true,
        }))
    }

    /// Pick the transaction to execute in.
    ///
    /// Returns the transaction and whether this request owns it.
    fn transaction_for(&self, processed: &ProcessedRequest) -> Result<(Option<TransactionSnapshot>, bool)> {
        let server = &self.services.transactions;
        let thread = &self.session.session_id;

        // Request transactions of other requests in the session aren't
        // shared.
        if let Some(existing) = server.transaction_for_thread(thread) {
            if existing.scope != TransactionScope::Request {
                return Ok((Some(existing), false));
            }
        }

        let needed = match self.message.auto_wrap {
            TransactionAutoWrap::Off => false,
            TransactionAutoWrap::On => processed.is_update(),
            TransactionAutoWrap::Detect => processed.plan.requires_transaction(false),
        };
        if !needed {
            return Ok((None, false));
        }

        let snapshot = server.begin_request(thread)?;
        debug!(request = %self.id, id = %snapshot.id, "began request transaction");
        Ok((Some(snapshot), true))
    }

    fn start(&self) -> Result<Processing> {
        if let Some(processing) = self.lookup_cached_results()? {
            return Ok(processing);
        }

        let version = self
            .services
            .results_cache
            .modification_tracker()
            .current_version();

        let context = CommandContext::new(
            self.id.clone(),
            self.session.metadata.vdb().clone(),
            self.session.user.clone(),
            self.registry.clone(),
        );
        let processed = process_request(&self.services.planning, &self.session, &self.message, context)?;

        let cache_results = self.message.use_result_set_cache
            && self.message.row_limit.is_none()
            && processed.is_query();
        let cache_id = cache_results.then(|| self.results_cache_id());

        let (transaction, owned) = self.transaction_for(&processed)?;

        let ProcessedRequest {
            plan,
            mut context,
            commands,
            ..
        } = processed;
        context.set_transaction(transaction.clone());

        let mut execution = Execution {
            plan,
            context,
            commands,
            transaction: if owned { transaction } else { None },
            cache_id,
            version,
        };

        let opened = execution
            .plan
            .initialize(&execution.context, &self.services.data_manager)
            .and_then(|_| execution.plan.open());
        if let Err(e) = opened {
            self.release(Some(execution));
            return Err(e);
        }

        let buffer = self
            .services
            .buffers
            .create_tuple_buffer(execution.plan.output_schema().clone());
        // Cached results are read again from the start.
        let forward_only =
            self.message.cursor_type == CursorType::ForwardOnly && execution.cache_id.is_none();
        buffer.set_forward_only(forward_only);

        debug!(request = %self.id, %forward_only, "started request processing");

        Ok(Processing {
            execution: Some(execution),
            buffer: Arc::new(buffer),
            from_cache: false,
        })
    }

    /// Whether processing should stop until the client asks for more rows.
    fn should_pause(&self, processing: &Processing) -> bool {
        if !processing.buffer.is_forward_only() {
            return false;
        }
        let client = self.client.lock();
        if client.cursor.is_some() {
            return false;
        }
        let buffered = processing
            .buffer
            .row_count()
            .saturating_sub(client.last_delivered_row);
        buffered >= self.services.config.max_buffered_rows
    }

    fn process_more(&self, processing: &mut Processing, cx: &mut Context<'_>) -> Result<ProcessStatus> {
        if self.check_canceled()? {
            return Ok(ProcessStatus::Close);
        }

        let mut paused = false;
        for _ in 0..self.services.config.batches_per_process {
            self.deliver_cursor(processing)?;

            if processing.execution.is_none() {
                return Ok(ProcessStatus::Yield);
            }
            if self.should_pause(processing) {
                paused = true;
                break;
            }
            let Some(execution) = processing.execution.as_mut() else {
                return Ok(ProcessStatus::Yield);
            };

            match execution.plan.poll_next_batch(cx) {
                Poll::Ready(Ok(Some(rows))) => processing.buffer.add_tuples(rows)?,
                Poll::Ready(Ok(None)) => {
                    if let Some(execution) = processing.execution.take() {
                        self.complete(execution, &processing.buffer)?;
                    }
                }
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => {
                    // Woken by the source once it has rows.
                    self.deliver_cursor(processing)?;
                    return Ok(ProcessStatus::Yield);
                }
            }
        }

        self.deliver_cursor(processing)?;

        if processing.execution.is_some() && !paused {
            // Out of batches for this run but there's more to do.
            cx.waker().wake_by_ref();
        }

        Ok(ProcessStatus::Yield)
    }

    /// Finish a plan that has produced all its rows.
    fn complete(&self, mut execution: Execution, buffer: &Arc<TupleBuffer>) -> Result<()> {
        execution.plan.close()?;
        buffer.close()?;
        self.registry.close_all();

        if let Some(transaction) = execution.transaction.take() {
            self.services.transactions.commit_context(&transaction)?;
        }

        let tracker = self.services.results_cache.modification_tracker();
        for modification in execution.commands.iter().filter_map(|c| c.modification.as_ref()) {
            tracker.record_modification(&modification.group, modification.major);
        }

        if let (Some(cache_id), [command]) = (&execution.cache_id, execution.commands.as_slice()) {
            let access = AccessInfo::new(execution.context.accessed_objects(), execution.version);
            match CachedResults::try_new(buffer.clone(), command.clone(), access) {
                Ok(results) => self.services.results_cache.put(
                    cache_id,
                    execution.context.determinism(),
                    Arc::new(results),
                    None,
                ),
                Err(e) => warn!(%e, request = %self.id, "failed to cache results"),
            }
        }

        debug!(request = %self.id, rows = buffer.row_count(), "request processing complete");
        Ok(())
    }

    /// Release an execution that didn't complete, rolling back its
    /// transaction.
    fn release(&self, execution: Option<Execution>) {
        if let Some(mut execution) = execution {
            if let Err(e) = execution.plan.close() {
                warn!(%e, request = %self.id, "failed to close plan");
            }
            if let Some(transaction) = execution.transaction.take() {
                if let Err(e) = self.services.transactions.rollback_context(&transaction) {
                    warn!(%e, request = %self.id, "failed to roll back request transaction");
                }
            }
        }
        self.registry.close_all();
    }

    /// Send the pending cursor window if the buffer can satisfy it.
    fn deliver_cursor(&self, processing: &Processing) -> Result<()> {
        let mut client = self.client.lock();
        let Some(cursor) = client.cursor.as_ref() else {
            return Ok(());
        };

        let buffer = &processing.buffer;
        let rows = match buffer.get_rows(cursor.begin_row, cursor.fetch_size) {
            Ok(Some(rows)) => rows,
            Ok(None) => return Ok(()),
            Err(e) => {
                // Bad window, the request itself is fine.
                if let Some(cursor) = client.cursor.take() {
                    send_result(cursor.sender, Err(e));
                }
                return Ok(());
            }
        };

        let Some(cursor) = client.cursor.take() else {
            return Ok(());
        };

        for value in rows.iter().flatten() {
            if let ScalarValue::Lob(lob) = value {
                client.lobs.insert(lob.id.clone(), lob.clone());
            }
        }

        let first_row = cursor.begin_row;
        let last_row = first_row + rows.len() - 1;
        client.last_delivered_row = client.last_delivered_row.max(last_row);

        let message = ResultsMessage {
            request_id: self.id.clone(),
            schema: buffer.schema().clone(),
            rows,
            first_row,
            last_row,
            final_row: buffer.is_final().then(|| buffer.row_count()),
            warnings: self.registry.take_warnings(),
            from_cache: processing.from_cache,
        };
        send_result(cursor.sender, Ok(message));

        Ok(())
    }

    /// Try to hand an error to the client. Returns the error back if there's
    /// nobody to give it to yet.
    fn deliver_error(&self, error: DbError) -> Option<DbError> {
        let mut client = self.client.lock();
        if client.close_requested {
            debug!(%error, request = %self.id, "dropping error of closed request");
            return None;
        }
        match client.cursor.take() {
            Some(cursor) => {
                send_result(cursor.sender, Err(error));
                None
            }
            None => Some(error),
        }
    }

    fn remove_request(&self) {
        if let Some(requests) = self.requests.upgrade() {
            requests.remove(&self.id);
        }
        debug!(request = %self.id, "request closed");
    }
}

impl Work for RequestWork {
    fn process(&mut self, cx: &mut Context<'_>) {
        loop {
            let state = std::mem::replace(&mut self.state, RequestState::Close);
            self.state = match state {
                RequestState::New => match self.check_canceled() {
                    Ok(true) => RequestState::Close,
                    Ok(false) => match self.start() {
                        Ok(processing) => RequestState::Processing(Box::new(processing)),
                        Err(e) => {
                            debug!(%e, request = %self.id, "request failed to start");
                            RequestState::Failed(e)
                        }
                    },
                    Err(e) => RequestState::Failed(e),
                },
                RequestState::Processing(mut processing) => {
                    match self.process_more(&mut processing, cx) {
                        Ok(ProcessStatus::Yield) => {
                            self.state = RequestState::Processing(processing);
                            return;
                        }
                        Ok(ProcessStatus::Close) => {
                            self.release(processing.execution);
                            RequestState::Close
                        }
                        Err(e) => {
                            debug!(%e, request = %self.id, "request failed");
                            self.release(processing.execution);
                            RequestState::Failed(e)
                        }
                    }
                }
                RequestState::Failed(error) => match self.deliver_error(error) {
                    Some(error) => {
                        self.state = RequestState::Failed(error);
                        return;
                    }
                    None => RequestState::Close,
                },
                RequestState::Close => {
                    self.remove_request();
                    return;
                }
            };
        }
    }

    fn is_done_processing(&self) -> bool {
        matches!(self.state, RequestState::Close)
    }
}
