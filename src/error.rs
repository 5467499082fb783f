//! Error taxonomy for dispatch and drain outcomes.

use thiserror::Error;

use crate::progress::Canceled;

/// Failure modes surfaced by [`JobDispatcher`](crate::JobDispatcher) entry
/// points.
///
/// An intentional early stop (a processor returning `Ok(false)`) is not an
/// error; it surfaces as the `Ok(false)` return value instead.
#[derive(Debug, Error)]
pub enum JobError {
    /// The shared progress indicator was canceled from outside the call.
    #[error("job canceled")]
    Canceled,

    /// The read side stayed contended through the serial retry pass of a
    /// fail-fast dispatch.
    #[error("read lock unavailable while an exclusive operation is pending")]
    LockConflict,

    /// First processor failure observed across all sub-tasks. Later
    /// concurrent failures are logged at debug level, not re-raised.
    #[error("processor failed: {0}")]
    Processor(anyhow::Error),
}

impl JobError {
    /// True for user-initiated cancellation, letting callers suppress
    /// error reporting that genuine processor bugs should still trigger.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, JobError::Canceled)
    }
}

impl From<Canceled> for JobError {
    fn from(_: Canceled) -> Self {
        JobError::Canceled
    }
}
