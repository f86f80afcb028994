use std::collections::VecDeque;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use fedsql_error::{DbError, Result};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::connector::{ConnectorExecution, ConnectorManager};
use super::limiter::{SourceLimiter, SourcePermit};
use super::{AtomicRequestId, AtomicRequestMessage};
use crate::arrays::field::Row;
use crate::runtime::work_item::Work;

/// Row queue shared between a connector work item (producer) and the tuple
/// source reading from it (consumer).
#[derive(Debug)]
pub struct SourceShared {
    id: AtomicRequestId,
    queue_size: usize,
    state: Mutex<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    rows: VecDeque<Row>,
    finished: bool,
    error: Option<DbError>,
    /// Source should stop early, e.g. row limit reached.
    canceled: bool,
    /// Consumer is gone.
    closed: bool,
    consumer: Option<Waker>,
    /// Woken when the queue has room again.
    producer: Option<Waker>,
    /// Woken when the consumer cancels or closes.
    stop_waker: Option<Waker>,
}

impl SourceShared {
    pub fn new(id: AtomicRequestId, queue_size: usize) -> Self {
        SourceShared {
            id,
            queue_size: queue_size.max(1),
            state: Mutex::new(SharedState::default()),
        }
    }

    pub fn id(&self) -> &AtomicRequestId {
        &self.id
    }

    /// Pop the next row.
    pub fn poll_pop(&self, cx: &mut Context<'_>) -> Poll<Result<Option<Row>>> {
        let mut state = self.state.lock();
        if let Some(row) = state.rows.pop_front() {
            if let Some(producer) = state.producer.take() {
                std::mem::drop(state);
                producer.wake();
            }
            return Poll::Ready(Ok(Some(row)));
        }

        if let Some(error) = state.error.take() {
            state.finished = true;
            return Poll::Ready(Err(error));
        }

        if state.finished || state.closed {
            return Poll::Ready(Ok(None));
        }

        state.consumer = Some(cx.waker().clone());
        Poll::Pending
    }

    pub fn cancel(&self) {
        self.stop(|state| state.canceled = true);
    }

    pub fn close(&self) {
        self.stop(|state| state.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn stop(&self, f: impl FnOnce(&mut SharedState)) {
        let producer = {
            let mut state = self.state.lock();
            f(&mut state);
            state.rows.clear();
            state.producer.take();
            state.stop_waker.take()
        };
        if let Some(producer) = producer {
            producer.wake();
        }
    }

    /// Returns (canceled, closed), registering the waker to be notified if
    /// either changes.
    fn stop_requested(&self, cx: &mut Context<'_>) -> (bool, bool) {
        let mut state = self.state.lock();
        if !state.canceled && !state.closed {
            state.stop_waker = Some(cx.waker().clone());
        }
        (state.canceled, state.closed)
    }

    /// Checks if the queue is full, registering the producer waker if it is.
    fn poll_capacity(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.lock();
        if state.rows.len() >= self.queue_size {
            state.producer = Some(cx.waker().clone());
            return Poll::Pending;
        }
        Poll::Ready(())
    }

    fn push(&self, row: Row) {
        let mut state = self.state.lock();
        if state.canceled || state.closed {
            return;
        }
        state.rows.push_back(row);
    }

    pub(crate) fn finish(&self) {
        self.state.lock().finished = true;
        self.notify_consumer();
    }

    pub(crate) fn set_error(&self, error: DbError) {
        {
            let mut state = self.state.lock();
            state.error = Some(error);
        }
        self.notify_consumer();
    }

    fn notify_consumer(&self) {
        let consumer = self.state.lock().consumer.take();
        if let Some(consumer) = consumer {
            consumer.wake();
        }
    }
}

#[derive(Debug)]
enum ConnectorState {
    AwaitingPermit,
    Executing {
        execution: Box<dyn ConnectorExecution>,
        permit: SourcePermit,
    },
    Done,
}

/// Drives a single connector execution, filling the shared queue.
#[derive(Debug)]
pub struct ConnectorWork {
    message: AtomicRequestMessage,
    manager: Arc<dyn ConnectorManager>,
    limiter: Arc<SourceLimiter>,
    shared: Arc<SourceShared>,
    state: ConnectorState,
}

impl ConnectorWork {
    pub fn new(
        message: AtomicRequestMessage,
        manager: Arc<dyn ConnectorManager>,
        limiter: Arc<SourceLimiter>,
        shared: Arc<SourceShared>,
    ) -> Self {
        ConnectorWork {
            message,
            manager,
            limiter,
            shared,
            state: ConnectorState::AwaitingPermit,
        }
    }

    /// Returns the next state and whether to keep going.
    fn poll_start(&mut self, cx: &mut Context<'_>) -> (ConnectorState, bool) {
        let (canceled, closed) = self.shared.stop_requested(cx);
        if canceled || closed {
            self.shared.finish();
            return (ConnectorState::Done, false);
        }

        let permit = match self.limiter.poll_acquire(cx) {
            Poll::Ready(permit) => permit,
            Poll::Pending => {
                trace!(id = %self.message.atomic_request_id, "waiting for source concurrency permit");
                return (ConnectorState::AwaitingPermit, false);
            }
        };

        match self.manager.register_request(&self.message) {
            Ok(execution) => {
                debug!(
                    id = %self.message.atomic_request_id,
                    binding = %self.message.connector_binding,
                    "started connector execution"
                );
                (
                    ConnectorState::Executing { execution, permit },
                    true,
                )
            }
            Err(e) => {
                self.shared.set_error(e);
                (ConnectorState::Done, false)
            }
        }
    }

    fn poll_execute(
        &mut self,
        cx: &mut Context<'_>,
        mut execution: Box<dyn ConnectorExecution>,
        permit: SourcePermit,
    ) -> ConnectorState {
        let (canceled, closed) = self.shared.stop_requested(cx);
        if canceled || closed {
            if canceled {
                if let Err(e) = execution.cancel() {
                    warn!(%e, id = %self.message.atomic_request_id, "failed to cancel connector execution");
                }
            }
            self.close_execution(execution.as_mut());
            self.shared.finish();
            return ConnectorState::Done;
        }

        let mut produced = false;
        let next = loop {
            if self.shared.poll_capacity(cx).is_pending() {
                break None;
            }

            match execution.poll_next_row(cx) {
                Poll::Ready(Ok(Some(row))) => {
                    self.shared.push(row);
                    produced = true;
                }
                Poll::Ready(Ok(None)) => {
                    self.close_execution(execution.as_mut());
                    self.shared.finish();
                    break Some(ConnectorState::Done);
                }
                Poll::Ready(Err(e)) => {
                    self.close_execution(execution.as_mut());
                    self.shared.set_error(e);
                    break Some(ConnectorState::Done);
                }
                Poll::Pending => break None,
            }
        };

        if produced {
            self.shared.notify_consumer();
        }

        match next {
            Some(state) => state,
            None => ConnectorState::Executing { execution, permit },
        }
    }

    fn close_execution(&self, execution: &mut dyn ConnectorExecution) {
        if let Err(e) = execution.close() {
            warn!(%e, id = %self.message.atomic_request_id, "failed to close connector execution");
        }
    }
}

impl Work for ConnectorWork {
    fn process(&mut self, cx: &mut Context<'_>) {
        loop {
            let state = std::mem::replace(&mut self.state, ConnectorState::Done);
            let (next, again) = match state {
                ConnectorState::AwaitingPermit => self.poll_start(cx),
                ConnectorState::Executing { execution, permit } => {
                    (self.poll_execute(cx, execution, permit), false)
                }
                ConnectorState::Done => (ConnectorState::Done, false),
            };
            self.state = next;
            if !again {
                return;
            }
        }
    }

    fn is_done_processing(&self) -> bool {
        matches!(self.state, ConnectorState::Done)
    }
}
