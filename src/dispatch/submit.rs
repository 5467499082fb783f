//! Fire-and-forget jobs with a completion handle.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::pool::{panic_message, WorkerPool};

use super::JobDispatcher;

impl JobDispatcher {
    /// Hands `job` to the shared pool and returns immediately.
    ///
    /// A panicking job is caught and logged; the handle still completes.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> JobHandle {
        let handle = JobHandle::new();
        let completer = handle.clone();
        WorkerPool::shared().execute(move || {
            if !completer.is_canceled() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    tracing::error!(
                        panic = %panic_message(payload.as_ref()),
                        "submitted job panicked"
                    );
                }
            }
            completer.mark_done();
        });
        handle
    }
}

/// Handle to a single background job started with
/// [`JobDispatcher::submit`].
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    done: Mutex<bool>,
    completed: Condvar,
    canceled: AtomicBool,
}

impl JobHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                done: Mutex::new(false),
                completed: Condvar::new(),
                canceled: AtomicBool::new(false),
            }),
        }
    }

    /// True once the job ran to completion or was skipped after a cancel.
    pub fn is_done(&self) -> bool {
        *self.lock_done()
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Prevents a not-yet-started job from running. A job already running
    /// is not interrupted; it finishes its current work.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
    }

    /// Blocks until the job completes or `timeout` elapses. Returns `true`
    /// when the job completed within the timeout.
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.lock_done();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout) = match self
                .inner
                .completed
                .wait_timeout(done, deadline - now)
            {
                Ok(result) => result,
                Err(poisoned) => poisoned.into_inner(),
            };
            done = guard;
        }
        true
    }

    fn mark_done(&self) {
        *self.lock_done() = true;
        self.inner.completed.notify_all();
    }

    fn lock_done(&self) -> std::sync::MutexGuard<'_, bool> {
        match self.inner.done.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
