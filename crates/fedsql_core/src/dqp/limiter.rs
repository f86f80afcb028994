use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

/// Limits how many atomic requests of a single user request execute against
/// sources at the same time.
#[derive(Debug)]
pub struct SourceLimiter {
    max: usize,
    state: Mutex<LimiterState>,
}

#[derive(Debug, Default)]
struct LimiterState {
    active: usize,
    peak: usize,
    waiters: Vec<Waker>,
}

/// Held while executing. Dropping frees the slot.
#[derive(Debug)]
pub struct SourcePermit {
    limiter: Arc<SourceLimiter>,
}

impl SourceLimiter {
    pub fn new(max: usize) -> Self {
        SourceLimiter {
            max: max.max(1),
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn poll_acquire(self: &Arc<Self>, cx: &mut Context<'_>) -> Poll<SourcePermit> {
        let mut state = self.state.lock();
        if state.active < self.max {
            state.active += 1;
            state.peak = state.peak.max(state.active);
            return Poll::Ready(SourcePermit {
                limiter: self.clone(),
            });
        }

        if !state.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            state.waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Highest number of permits held at once.
    pub fn peak(&self) -> usize {
        self.state.lock().peak
    }

    fn release(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.active -= 1;
            std::mem::take(&mut state.waiters)
        };
        // Everyone retries, a waiter may have gone away in the meantime.
        for waker in waiters {
            waker.wake();
        }
    }
}

impl Drop for SourcePermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
