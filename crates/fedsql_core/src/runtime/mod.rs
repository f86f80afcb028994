//! Cooperative scheduling of resumable work.

pub mod pool;
pub mod work_item;

use std::task::{Context, Waker};

/// Context that ignores wake ups.
///
/// Useful when polling something where we'll check again regardless.
pub fn noop_context() -> Context<'static> {
    Context::from_waker(Waker::noop())
}
