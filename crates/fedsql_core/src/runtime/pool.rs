use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;

use fedsql_error::{DbError, Result};
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere to run work items.
pub trait WorkPool: Debug + Sync + Send {
    fn schedule(&self, job: Job);
}

/// Work pool backed by a rayon thread pool.
#[derive(Debug, Clone)]
pub struct ThreadedWorkPool {
    pool: Arc<ThreadPool>,
    num_threads: usize,
}

impl ThreadedWorkPool {
    pub fn try_new(num_threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .thread_name(|idx| format!("fedsql-worker-{idx}"))
            .num_threads(num_threads)
            .build()
            .map_err(|e| DbError::with_source("Failed to build thread pool", Box::new(e)))?;

        info!(%num_threads, "created worker pool");

        Ok(ThreadedWorkPool {
            pool: Arc::new(pool),
            num_threads,
        })
    }

    pub fn try_new_default() -> Result<Self> {
        Self::try_new(num_cpus::get())
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

impl WorkPool for ThreadedWorkPool {
    fn schedule(&self, job: Job) {
        self.pool.spawn(job);
    }
}

/// Single threaded pool where the caller decides when jobs run.
///
/// Scheduling is fully deterministic which makes it useful for tests where
/// we want to assert on intermediate states.
#[derive(Default)]
pub struct QueuedWorkPool {
    queue: Mutex<VecDeque<Job>>,
}

impl Debug for QueuedWorkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedWorkPool")
            .field("num_scheduled", &self.num_scheduled())
            .finish()
    }
}

impl QueuedWorkPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_scheduled(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run a single job if one is queued.
    pub fn run_one(&self) -> bool {
        // Pop before running, jobs may schedule more jobs.
        let job = self.queue.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run jobs until the queue is empty, returning the number of jobs run.
    pub fn run_until_idle(&self) -> usize {
        let mut count = 0;
        while self.run_one() {
            count += 1;
        }
        debug!(%count, "queued pool idle");
        count
    }
}

impl WorkPool for QueuedWorkPool {
    fn schedule(&self, job: Job) {
        self.queue.lock().push_back(job);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn queued_runs_nested_jobs() {
        let pool = Arc::new(QueuedWorkPool::new());
        let count = Arc::new(AtomicUsize::new(0));

        let inner_pool = pool.clone();
        let inner_count = count.clone();
        pool.schedule(Box::new(move || {
            inner_count.fetch_add(1, Ordering::SeqCst);
            let c = inner_count.clone();
            inner_pool.schedule(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        assert_eq!(2, pool.run_until_idle());
        assert_eq!(2, count.load(Ordering::SeqCst));
    }

    #[test]
    fn threaded_runs_job() {
        let pool = ThreadedWorkPool::try_new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.schedule(Box::new(move || {
            tx.send(std::thread::current().name().map(|s| s.to_string()))
                .unwrap();
        }));

        let name = rx.recv().unwrap().unwrap();
        assert!(name.starts_with("fedsql-worker-"));
    }
}
