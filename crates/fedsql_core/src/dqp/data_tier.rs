use std::sync::Arc;
use std::task::{Context, Poll};

use fedsql_error::{DbError, DbErrorKind, Result};
use tracing::{debug, warn};

use super::connector::ConnectorManagerRepository;
use super::connector_work::{ConnectorWork, SourceShared};
use super::registry::AtomicRequestRegistry;
use super::{AtomicRequestId, AtomicRequestMessage, SourceWarning};
use crate::arrays::field::Row;
use crate::processor::access::AccessNode;
use crate::request::context::CommandContext;
use crate::runtime::pool::WorkPool;
use crate::runtime::work_item::WorkItem;

/// Turns access nodes into atomic requests against connectors.
#[derive(Debug)]
pub struct DataTierManager {
    repository: Arc<dyn ConnectorManagerRepository>,
    pool: Arc<dyn WorkPool>,
    queue_size: usize,
}

impl DataTierManager {
    pub fn new(
        repository: Arc<dyn ConnectorManagerRepository>,
        pool: Arc<dyn WorkPool>,
        queue_size: usize,
    ) -> Self {
        DataTierManager {
            repository,
            pool,
            queue_size,
        }
    }

    pub fn repository(&self) -> &Arc<dyn ConnectorManagerRepository> {
        &self.repository
    }

    /// Register an atomic request for the node and start executing it.
    ///
    /// Failing to find the connector is reported through the returned source
    /// so that it goes through the same partial results handling as any other
    /// source failure.
    pub fn register_request(
        &self,
        context: &CommandContext,
        node: &AccessNode,
    ) -> DataTierTupleSource {
        let registry = context.registry().clone();
        let id = registry.next_atomic_id(node.node_id);

        let message = AtomicRequestMessage {
            atomic_request_id: id.clone(),
            model: node.model.clone(),
            connector_binding: node.connector_binding.clone(),
            command: node.command.clone(),
            parameters: context.parameters().to_vec(),
            row_limit: node.limit,
            fetch_size: self.queue_size,
            user: context.user().to_string(),
            transaction: context.transaction().cloned(),
            partial_results: context.partial_results(),
        };

        let shared = Arc::new(SourceShared::new(id.clone(), self.queue_size));
        registry.register(shared.clone());

        match self.repository.connector_manager(&node.connector_binding) {
            Some(manager) => {
                let work = ConnectorWork::new(
                    message,
                    manager,
                    registry.limiter().clone(),
                    shared.clone(),
                );
                let item = WorkItem::new(format!("connector-{id}"), work, self.pool.clone());
                item.submit();
            }
            None => {
                shared.set_error(
                    DbError::component("Connector binding not found")
                        .with_field("binding", node.connector_binding.clone())
                        .with_field("model", node.model.clone()),
                );
            }
        }

        debug!(%id, model = %node.model, "registered atomic request");

        DataTierTupleSource {
            id,
            model: node.model.clone(),
            connector_binding: node.connector_binding.clone(),
            shared,
            registry,
            limit: node.limit,
            rows_returned: 0,
            partial_results: context.partial_results(),
            done: false,
            closed: false,
        }
    }
}

/// Non-blocking tuple source over a single atomic request.
#[derive(Debug)]
pub struct DataTierTupleSource {
    id: AtomicRequestId,
    model: String,
    connector_binding: String,
    shared: Arc<SourceShared>,
    registry: Arc<AtomicRequestRegistry>,
    limit: Option<usize>,
    rows_returned: usize,
    partial_results: bool,
    done: bool,
    closed: bool,
}

impl DataTierTupleSource {
    pub fn id(&self) -> &AtomicRequestId {
        &self.id
    }

    pub fn rows_returned(&self) -> usize {
        self.rows_returned
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Poll for the next row.
    ///
    /// `Ready(None)` is the end of data, including sources that produced no
    /// rows at all. `Pending` means the connector hasn't produced the next row
    /// yet, and the waker will be woken when it does.
    pub fn poll_next_tuple(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Row>>> {
        if self.done {
            return Poll::Ready(Ok(None));
        }

        if self.limit.is_some_and(|limit| self.rows_returned >= limit) {
            self.stop_at_limit();
            return Poll::Ready(Ok(None));
        }

        match self.shared.poll_pop(cx) {
            Poll::Ready(Ok(Some(row))) => {
                self.rows_returned += 1;
                if self.limit == Some(self.rows_returned) {
                    self.stop_at_limit();
                }
                Poll::Ready(Ok(Some(row)))
            }
            Poll::Ready(Ok(None)) => {
                self.done = true;
                Poll::Ready(Ok(None))
            }
            Poll::Ready(Err(e)) => {
                self.done = true;
                if !self.partial_results {
                    return Poll::Ready(Err(e));
                }
                warn!(%e, model = %self.model, binding = %self.connector_binding, "source failed, continuing with partial results");
                self.registry.add_warning(SourceWarning {
                    model: self.model.clone(),
                    connector_binding: self.connector_binding.clone(),
                    message: e.get_msg().to_string(),
                    retryable: e.kind() == DbErrorKind::Component,
                });
                Poll::Ready(Ok(None))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn stop_at_limit(&mut self) {
        self.done = true;
        self.shared.cancel();
    }

    /// Release the connector side and remove this request from its owner.
    pub fn close_source(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.done = true;
        self.shared.close();
        self.registry.remove(&self.id);
    }
}

impl Drop for DataTierTupleSource {
    fn drop(&mut self) {
        self.close_source();
    }
}
