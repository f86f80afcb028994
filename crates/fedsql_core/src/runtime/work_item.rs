use std::fmt;
use std::sync::Arc;
use std::task::{Context, Wake, Waker};

use fedsql_error::{DbError, Result};
use parking_lot::Mutex;
use tracing::{error, trace};

use super::pool::WorkPool;

/// Scheduling state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Ready to run. Initial state.
    MoreWork,
    /// Currently executing `process`.
    Working,
    /// Waiting for something external to call `more_work`.
    Idle,
    /// Terminal.
    Done,
}

/// A unit of resumable work.
///
/// `process` must never block. Anything that can't make progress should
/// register the waker from the context and return. Waking the waker moves the
/// item back into the pool.
pub trait Work: Send + 'static {
    fn process(&mut self, cx: &mut Context<'_>);

    fn is_done_processing(&self) -> bool;
}

/// Wraps a [`Work`] with the state machine guaranteeing at most one thread is
/// processing it at a time.
pub struct WorkItem<W> {
    name: String,
    thread_state: Mutex<ThreadState>,
    work: Mutex<W>,
    pool: Arc<dyn WorkPool>,
}

impl<W> fmt::Debug for WorkItem<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("name", &self.name)
            .field("thread_state", &*self.thread_state.lock())
            .finish_non_exhaustive()
    }
}

impl<W: Work> WorkItem<W> {
    pub fn new(name: impl Into<String>, work: W, pool: Arc<dyn WorkPool>) -> Arc<Self> {
        Arc::new(WorkItem {
            name: name.into(),
            thread_state: Mutex::new(ThreadState::MoreWork),
            work: Mutex::new(work),
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_state(&self) -> ThreadState {
        *self.thread_state.lock()
    }

    /// Submit a freshly created item to the pool.
    pub fn submit(self: &Arc<Self>) {
        self.resume_processing();
    }

    /// Run the work once.
    ///
    /// Errors if the item isn't in the `MoreWork` state.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.thread_state.lock();
            if *state != ThreadState::MoreWork {
                return Err(DbError::internal("Work item not in a runnable state")
                    .with_field("work_item", &self.name)
                    .with_field("state", format!("{:?}", *state)));
            }
            *state = ThreadState::Working;
        }

        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);

        let done = {
            let mut work = self.work.lock();
            work.process(&mut cx);
            work.is_done_processing()
        };

        self.end_processing(done);

        Ok(())
    }

    fn end_processing(self: &Arc<Self>, done: bool) {
        let mut state = self.thread_state.lock();
        if done {
            *state = ThreadState::Done;
            trace!(work_item = %self.name, "work item done");
            return;
        }

        match *state {
            ThreadState::Working => *state = ThreadState::Idle,
            ThreadState::MoreWork => {
                // More work came in while processing.
                std::mem::drop(state);
                self.resume_processing();
            }
            ThreadState::Idle | ThreadState::Done => {
                error!(work_item = %self.name, state = ?*state, "unexpected state at end of processing");
            }
        }
    }

    /// Signal that there's more work to do.
    pub fn more_work(self: &Arc<Self>) {
        let mut state = self.thread_state.lock();
        match *state {
            ThreadState::Working => *state = ThreadState::MoreWork,
            ThreadState::Idle => {
                *state = ThreadState::MoreWork;
                std::mem::drop(state);
                self.resume_processing();
            }
            ThreadState::MoreWork | ThreadState::Done => (),
        }
    }

    /// Run a function against the underlying work.
    ///
    /// Blocks while the work is being processed. Processing never blocks, so
    /// this is bounded.
    pub fn with_work<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        let mut work = self.work.lock();
        f(&mut work)
    }

    fn resume_processing(self: &Arc<Self>) {
        let item = self.clone();
        self.pool.schedule(Box::new(move || {
            if let Err(e) = item.run() {
                error!(%e, "failed to run work item");
            }
        }));
    }
}

impl<W: Work> Wake for WorkItem<W> {
    fn wake(self: Arc<Self>) {
        self.more_work();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.more_work();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::runtime::pool::QueuedWorkPool;

    /// Counts processing calls, done after `remaining` hits zero.
    struct CountingWork {
        processed: Arc<AtomicUsize>,
        remaining: usize,
        wake_self: bool,
    }

    impl Work for CountingWork {
        fn process(&mut self, cx: &mut Context<'_>) {
            self.processed.fetch_add(1, Ordering::SeqCst);
            self.remaining = self.remaining.saturating_sub(1);
            if self.wake_self {
                cx.waker().wake_by_ref();
            }
        }

        fn is_done_processing(&self) -> bool {
            self.remaining == 0
        }
    }

    fn item(remaining: usize, wake_self: bool) -> (Arc<WorkItem<CountingWork>>, Arc<QueuedWorkPool>, Arc<AtomicUsize>) {
        let pool = Arc::new(QueuedWorkPool::new());
        let processed = Arc::new(AtomicUsize::new(0));
        let item = WorkItem::new(
            "test",
            CountingWork {
                processed: processed.clone(),
                remaining,
                wake_self,
            },
            pool.clone(),
        );
        (item, pool, processed)
    }

    #[test]
    fn run_to_done() {
        let (item, _pool, processed) = item(1, false);
        assert_eq!(ThreadState::MoreWork, item.thread_state());

        item.run().unwrap();
        assert_eq!(ThreadState::Done, item.thread_state());
        assert_eq!(1, processed.load(Ordering::SeqCst));

        // Can't run from done.
        item.run().unwrap_err();
    }

    #[test]
    fn run_to_idle() {
        let (item, pool, _) = item(2, false);

        item.run().unwrap();
        assert_eq!(ThreadState::Idle, item.thread_state());
        item.run().unwrap_err();
        assert_eq!(0, pool.num_scheduled());
    }

    #[test]
    fn more_work_while_idle_schedules_once() {
        let (item, pool, processed) = item(2, false);
        item.run().unwrap();

        item.more_work();
        item.more_work();
        assert_eq!(ThreadState::MoreWork, item.thread_state());
        assert_eq!(1, pool.num_scheduled());

        pool.run_until_idle();
        assert_eq!(ThreadState::Done, item.thread_state());
        assert_eq!(2, processed.load(Ordering::SeqCst));
    }

    #[test]
    fn more_work_while_working_resubmits() {
        let (item, pool, processed) = item(3, true);

        item.run().unwrap();
        // Woke itself during processing, so it was resubmitted instead of
        // going idle.
        assert_eq!(ThreadState::MoreWork, item.thread_state());
        assert_eq!(1, pool.num_scheduled());

        pool.run_until_idle();
        assert_eq!(ThreadState::Done, item.thread_state());
        assert_eq!(3, processed.load(Ordering::SeqCst));
    }

    #[test]
    fn more_work_when_done_is_noop() {
        let (item, pool, _) = item(1, false);
        item.run().unwrap();
        item.more_work();
        assert_eq!(ThreadState::Done, item.thread_state());
        assert_eq!(0, pool.num_scheduled());
    }

    #[test]
    fn waker_triggers_more_work() {
        let (item, pool, _) = item(2, false);
        item.run().unwrap();

        let waker = Waker::from(item.clone());
        waker.wake();
        assert_eq!(1, pool.num_scheduled());
    }
}
