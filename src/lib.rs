//! Progress-aware concurrent job dispatch.
//!
//! The crate concurrently applies a processor function over a list or a
//! blocking queue of items on one shared, process-wide worker pool, under
//! a cancellable progress indicator, with read-lock coordination,
//! fail-fast semantics, and first-failure bookkeeping.
//!
//! - [`JobDispatcher::dispatch`] forks balanced item ranges across the
//!   pool and joins them, with the calling thread helping.
//! - [`JobDispatcher::drain`] runs continuous consumers over a
//!   tombstone-terminated queue with a retry queue for failed items.
//! - [`JobDispatcher::submit`] starts a single background job and returns
//!   a completion handle.
//!
//! A processor returning `Ok(false)` is an intentional early stop and
//! surfaces as the `Ok(false)` return value, never as an error;
//! cancellation of the shared [`ProgressIndicator`] surfaces as
//! [`JobError::Canceled`], distinguishable so callers can keep quiet
//! about user-initiated cancellation while still reporting real failures.

mod dispatch;
mod error;
mod lock;
mod pool;
mod progress;
mod queue;

pub use dispatch::{JobDispatcher, JobHandle};
pub use error::JobError;
pub use lock::{LocalRwLock, LockContext, ReadAction};
pub use progress::{Canceled, ProgressIndicator};
pub use queue::{ItemQueue, RetryQueue};
