//! Session-wide cancellation.
//!
//! Every queue and buffer a worker can block on registers itself here, so a
//! single `cancel()` wakes all of them.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Something a worker thread can be blocked on.
pub trait Abortable: Send + Sync {
    /// Set the abort flag under the structure's own lock, then wake every
    /// waiter.
    fn abort(&self);
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    targets: Mutex<Vec<Arc<dyn Abortable>>>,
    sleep_lock: Mutex<()>,
    sleep_cond: Condvar,
}

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering after cancellation aborts the target immediately.
    pub fn register(&self, target: Arc<dyn Abortable>) {
        let mut targets = self.inner.targets.lock();
        if self.is_cancelled() {
            drop(targets);
            target.abort();
            return;
        }
        targets.push(target);
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let targets: Vec<_> = self.inner.targets.lock().clone();
        for target in targets {
            target.abort();
        }
        let _guard = self.inner.sleep_lock.lock();
        self.inner.sleep_cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`, returning early on cancel. Returns true if
    /// cancelled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let mut guard = self.inner.sleep_lock.lock();
        if self.is_cancelled() {
            return true;
        }
        self.inner.sleep_cond.wait_for(&mut guard, timeout);
        self.is_cancelled()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
