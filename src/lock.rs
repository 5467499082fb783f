//! Read-lock coordination for processors that must run under shared access.
//!
//! The dispatcher never consults ambient application state; callers that
//! need their processor wrapped in a read-lock-like context pass a
//! [`ReadAction`] carrying an explicit [`LockContext`] capability.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::thread::{self, ThreadId};

/// Capability object for a shared/exclusive lock the processor must respect.
pub trait LockContext: Send + Sync {
    /// Runs `f` under the shared read side, blocking until it is available.
    fn run_under_read_lock(&self, f: &mut dyn FnMut());

    /// Runs `f` under the read side only if it is immediately available.
    /// Returns `false` without running `f` when a pending or active
    /// exclusive operation makes acquisition conflict-prone.
    fn try_run_under_read_lock(&self, f: &mut dyn FnMut()) -> bool;

    /// True while an exclusive operation is waiting or active.
    fn is_conflict_imminent(&self) -> bool;

    /// True when the calling thread itself holds the exclusive side.
    fn is_exclusive_held_by_current_thread(&self) -> bool;
}

/// Read-lock options for one dispatch call.
#[derive(Clone)]
pub struct ReadAction {
    pub lock: Arc<dyn LockContext>,
    /// Abort a sub-range instead of blocking when the read side is
    /// contended. Aborted ranges are retried serially, once, after the
    /// parallel phase.
    pub fail_fast: bool,
}

impl ReadAction {
    pub fn new(lock: Arc<dyn LockContext>) -> Self {
        Self {
            lock,
            fail_fast: false,
        }
    }

    pub fn fail_fast(lock: Arc<dyn LockContext>) -> Self {
        Self {
            lock,
            fail_fast: true,
        }
    }
}

/// Process-local [`LockContext`] built on [`std::sync::RwLock`].
///
/// Tracks pending writers so readers can refuse to pile up behind an
/// exclusive operation, and the writing thread so a dispatch issued from
/// inside the exclusive section runs inline instead of deadlocking.
#[derive(Default)]
pub struct LocalRwLock {
    inner: RwLock<()>,
    pending_writers: AtomicUsize,
    write_owner: Mutex<Option<ThreadId>>,
}

impl LocalRwLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` under the exclusive side. Counts as a pending writer while
    /// waiting so concurrent fail-fast readers back off.
    pub fn run_under_write_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.pending_writers.fetch_add(1, Ordering::SeqCst);
        let _guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.pending_writers.fetch_sub(1, Ordering::SeqCst);
        *self.lock_owner() = Some(thread::current().id());

        // The owner must be cleared even when `f` unwinds, or the lock
        // would report an imminent conflict with no writer left. Declared
        // after the guard so it drops first and the owner is gone before
        // the write lock releases.
        struct OwnerReset<'a>(&'a LocalRwLock);
        impl Drop for OwnerReset<'_> {
            fn drop(&mut self) {
                *self.0.lock_owner() = None;
            }
        }
        let _reset = OwnerReset(self);

        f()
    }

    fn lock_owner(&self) -> std::sync::MutexGuard<'_, Option<ThreadId>> {
        match self.write_owner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl LockContext for LocalRwLock {
    fn run_under_read_lock(&self, f: &mut dyn FnMut()) {
        let _guard = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f();
    }

    fn try_run_under_read_lock(&self, f: &mut dyn FnMut()) -> bool {
        if self.is_conflict_imminent() {
            return false;
        }
        match self.inner.try_read() {
            Ok(_guard) => {
                f();
                true
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                let _guard = poisoned.into_inner();
                f();
                true
            }
            Err(TryLockError::WouldBlock) => false,
        }
    }

    fn is_conflict_imminent(&self) -> bool {
        self.pending_writers.load(Ordering::SeqCst) > 0 || self.lock_owner().is_some()
    }

    fn is_exclusive_held_by_current_thread(&self) -> bool {
        *self.lock_owner() == Some(thread::current().id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn read_lock_runs_closure() {
        let lock = LocalRwLock::new();
        let mut ran = false;
        lock.run_under_read_lock(&mut || ran = true);
        assert!(ran);
    }

    #[test]
    fn try_read_refuses_while_writer_active() {
        let lock = Arc::new(LocalRwLock::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.run_under_write_lock(|| {
                    entered_tx.send(()).ok();
                    release_rx.recv().ok();
                });
            })
        };

        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("writer never entered");
        assert!(lock.is_conflict_imminent());

        let mut ran = false;
        assert!(!lock.try_run_under_read_lock(&mut || ran = true));
        assert!(!ran);

        release_tx.send(()).ok();
        writer.join().expect("writer panicked");

        assert!(!lock.is_conflict_imminent());
        assert!(lock.try_run_under_read_lock(&mut || ran = true));
        assert!(ran);
    }

    #[test]
    fn panicking_write_closure_releases_ownership() {
        let lock = LocalRwLock::new();
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            lock.run_under_write_lock(|| panic!("write closure failed"));
        }));
        assert!(unwound.is_err());

        assert!(!lock.is_exclusive_held_by_current_thread());
        assert!(!lock.is_conflict_imminent());

        // The poisoned read side must still be acquirable.
        let mut ran = false;
        assert!(lock.try_run_under_read_lock(&mut || ran = true));
        assert!(ran);
    }

    #[test]
    fn exclusive_owner_is_thread_local() {
        let lock = Arc::new(LocalRwLock::new());
        lock.run_under_write_lock(|| {
            assert!(lock.is_exclusive_held_by_current_thread());

            let lock = Arc::clone(&lock);
            let other = thread::spawn(move || lock.is_exclusive_held_by_current_thread());
            assert!(!other.join().expect("probe thread panicked"));
        });
        assert!(!lock.is_exclusive_held_by_current_thread());
    }
}
