use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use fedsql_error::{DbError, Result};
use futures::FutureExt;
use futures::channel::oneshot;
use tracing::trace;

pub(crate) type ResultSender<T> = oneshot::Sender<Result<T>>;

/// Resolves with the outcome of an engine operation.
///
/// The engine never times out on its own. Callers wanting a deadline should
/// race this against their own timer.
pub struct ResultsFuture<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> fmt::Debug for ResultsFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultsFuture").finish_non_exhaustive()
    }
}

impl<T> ResultsFuture<T> {
    pub(crate) fn channel() -> (ResultSender<T>, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, ResultsFuture { receiver })
    }
}

impl<T> Future for ResultsFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.receiver.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(DbError::canceled(
                "Request closed before a result was produced",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Complete a future, ignoring receivers that have gone away.
pub(crate) fn send_result<T>(sender: ResultSender<T>, result: Result<T>) {
    if sender.send(result).is_err() {
        trace!("result receiver dropped");
    }
}
