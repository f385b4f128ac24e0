//! Bounded tracking of outstanding background work

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Tracks outstanding CPU-bound tasks for one subchain.
///
/// Every offloaded task holds a [`Job`] guard for its lifetime; shutdown and
/// `FinishBackgroundTasks` wait on [`JobCounter::wait_idle`], which completes
/// only once every guard has dropped. No component state is released while
/// the count is non-zero.
#[derive(Debug, Clone, Default)]
pub(crate) struct JobCounter {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    outstanding: AtomicUsize,
    idle: Notify,
}

impl JobCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers one unit of outstanding work.
    pub(crate) fn job(&self) -> Job {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        Job {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Completes once every outstanding [`Job`] guard has dropped.
    /// Cancellation safe.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Guard representing one outstanding unit of work.
#[derive(Debug)]
pub(crate) struct Job {
    inner: Arc<Inner>,
}

impl Drop for Job {
    fn drop(&mut self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
