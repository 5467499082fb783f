//! Concurrent job dispatch over item lists and blocking queues.
//!
//! # Module Structure
//!
//! - `range`: range partitioning, the per-call shared state, and the
//!   fork/join path behind [`JobDispatcher::dispatch`]
//! - `drain`: continuous consumers for tombstone-terminated queues
//! - `submit`: fire-and-forget single jobs with completion handles

mod drain;
mod range;
mod submit;

pub use submit::JobHandle;

/// Entry point for parallel work distribution.
///
/// Holds the fan-out ceiling for its calls; all dispatchers share one
/// process-wide worker pool. The default reads hardware parallelism once at
/// construction, and tests construct dispatchers with explicit values to
/// force the inline path or a specific fan-out deterministically.
#[derive(Debug, Clone)]
pub struct JobDispatcher {
    parallelism: usize,
}

impl JobDispatcher {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }
}

impl Default for JobDispatcher {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}
