//! Fork/join execution of a processor over contiguous item ranges.
//!
//! A dispatch call partitions `[0, len)` into balanced ranges, forks one
//! pool job per range, and has every participant (pool jobs and the caller
//! alike) scan the whole task arena claiming unclaimed ranges once its own
//! is done. Failure bookkeeping is a single first-writer-wins slot shared
//! by all sub-tasks.

use std::mem;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::anyhow;

use crate::error::JobError;
use crate::lock::ReadAction;
use crate::pool::{panic_message, WorkerPool};
use crate::progress::ProgressIndicator;

use super::JobDispatcher;

/// Periodic wake interval for the join loop, keeping cancellation latency
/// low while siblings are busy.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

impl JobDispatcher {
    /// Concurrently applies `processor` to every element of `items`.
    ///
    /// Returns `Ok(true)` when every item was processed and no processor
    /// returned `Ok(false)`; `Ok(false)` on an intentional early stop;
    /// [`JobError::Processor`] re-raising the first processor failure;
    /// [`JobError::Canceled`] when the shared indicator was canceled
    /// externally and no intentional stop was recorded first.
    ///
    /// No ordering across items is guaranteed once parallel execution
    /// begins. A processor that returns `Ok(false)` for one item while
    /// another item's processor fails races on which outcome wins the
    /// shared failure slot; the winner determines whether the call reports
    /// an early stop or an error. That nondeterminism is inherent to
    /// concurrent early exit and deliberately preserved.
    pub fn dispatch<T, P>(
        &self,
        items: Vec<T>,
        progress: Option<Arc<ProgressIndicator>>,
        read_action: Option<ReadAction>,
        processor: P,
    ) -> Result<bool, JobError>
    where
        T: Send + Sync + 'static,
        P: Fn(&T) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        // Downstream cancellation checks must always have an indicator,
        // canceled or not, even when the caller supplied none.
        let progress = progress.unwrap_or_default();
        if items.is_empty() {
            return Ok(true);
        }

        let exclusive_held = read_action
            .as_ref()
            .map_or(false, |ra| ra.lock.is_exclusive_held_by_current_thread());
        if items.len() == 1 || self.parallelism() <= 1 || exclusive_held {
            // The exclusive holder already has stronger access than the
            // read side; re-acquiring would self-deadlock.
            let read_action = if exclusive_held {
                None
            } else {
                read_action.as_ref()
            };
            return process_sequentially(&items, &progress, read_action, &processor);
        }

        let ranges = partition(items.len(), self.parallelism());
        tracing::debug!(
            items = items.len(),
            ranges = ranges.len(),
            parallelism = self.parallelism(),
            "forking dispatch"
        );

        let state = Arc::new(DispatchState::new(
            items,
            &ranges,
            Arc::clone(&progress),
            read_action,
            processor,
        ));

        // Every task exists before any is started, so helpers can scan the
        // whole arena without racing task construction.
        for index in 0..state.tasks.len() {
            let state = Arc::clone(&state);
            WorkerPool::shared().execute(move || state.help_from(index));
        }

        // The calling thread participates instead of idling; with the
        // claim flags this also guarantees every range gets an executor
        // even when the pool is saturated by unrelated work.
        state.help_from(0);
        state.join();
        state.resolve()
    }
}

/// Splits `[0, len)` into `len / chunk` contiguous ranges built from the
/// tail backward, where `chunk = max(1, len / parallelism)`. The
/// lowest-indexed range absorbs the remainder and may be slightly larger.
fn partition(len: usize, parallelism: usize) -> Vec<Range<usize>> {
    debug_assert!(len > 0 && parallelism > 0);
    let chunk = (len / parallelism).max(1);
    let count = len / chunk;

    let mut ranges = Vec::with_capacity(count);
    let mut hi = len;
    for _ in 1..count {
        let lo = hi - chunk;
        ranges.push(lo..hi);
        hi = lo;
    }
    ranges.push(0..hi);
    ranges.reverse();
    ranges
}

/// One contiguous sub-range of the item list, claimed by exactly one
/// executor over its lifetime.
struct RangeTask {
    lo: usize,
    hi: usize,
    claimed: AtomicBool,
}

/// Outcome recorded by the first sub-task that ends the dispatch early.
enum Failure {
    /// A processor returned `Ok(false)`.
    Stop,
    Error(anyhow::Error),
}

/// State shared by every sub-task of one dispatch call. Owned by the call;
/// discarded once it returns.
struct DispatchState<T, P> {
    items: Vec<T>,
    tasks: Box<[RangeTask]>,
    progress: Arc<ProgressIndicator>,
    read_action: Option<ReadAction>,
    processor: P,
    failure: Mutex<Option<Failure>>,
    /// Sub-ranges that lost the fail-fast read-lock race, re-attempted
    /// serially after the parallel phase.
    deferred: Mutex<Vec<(usize, usize)>>,
    finished: Mutex<usize>,
    task_done: Condvar,
}

impl<T, P> DispatchState<T, P>
where
    T: Send + Sync,
    P: Fn(&T) -> anyhow::Result<bool> + Send + Sync,
{
    fn new(
        items: Vec<T>,
        ranges: &[Range<usize>],
        progress: Arc<ProgressIndicator>,
        read_action: Option<ReadAction>,
        processor: P,
    ) -> Self {
        let tasks = ranges
            .iter()
            .map(|range| RangeTask {
                lo: range.start,
                hi: range.end,
                claimed: AtomicBool::new(false),
            })
            .collect();
        Self {
            items,
            tasks,
            progress,
            read_action,
            processor,
            failure: Mutex::new(None),
            deferred: Mutex::new(Vec::new()),
            finished: Mutex::new(0),
            task_done: Condvar::new(),
        }
    }

    /// Claims and executes every range not yet taken by another worker,
    /// scanning the arena from `start` so forked jobs spread out before
    /// they start helping each other.
    fn help_from(&self, start: usize) {
        let count = self.tasks.len();
        for offset in 0..count {
            let index = (start + offset) % count;
            if self.try_claim(index) {
                self.run_claimed(index);
            }
        }
    }

    fn try_claim(&self, index: usize) -> bool {
        self.tasks[index]
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn run_claimed(&self, index: usize) {
        // A canceled range still counts as finished; claiming stops, the
        // join converges, and only in-flight items run to completion.
        if !self.progress.is_canceled() {
            self.process_range(index);
        }
        self.mark_finished();
    }

    fn process_range(&self, index: usize) {
        let (lo, hi) = (self.tasks[index].lo, self.tasks[index].hi);
        match &self.read_action {
            None => self.process_span(lo, hi),
            Some(action) if action.fail_fast => {
                let ran = !action.lock.is_conflict_imminent()
                    && action
                        .lock
                        .try_run_under_read_lock(&mut || self.process_span(lo, hi));
                if !ran {
                    self.defer_range(lo, hi);
                }
            }
            Some(action) => action.lock.run_under_read_lock(&mut || self.process_span(lo, hi)),
        }
    }

    /// Runs the processor over `[lo, hi)`, checking cancellation at item
    /// boundaries and recording the first stop or error into the shared
    /// failure slot.
    fn process_span(&self, lo: usize, hi: usize) {
        for item in &self.items[lo..hi] {
            if self.progress.is_canceled() {
                return;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.processor)(item)));
            match outcome {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    self.record_failure(Failure::Stop);
                    return;
                }
                Ok(Err(error)) => {
                    self.record_failure(Failure::Error(error));
                    return;
                }
                Err(payload) => {
                    self.record_failure(Failure::Error(anyhow!(
                        "processor panicked: {}",
                        panic_message(payload.as_ref())
                    )));
                    return;
                }
            }
        }
    }

    /// First writer wins; later failures are kept out of the slot but
    /// logged so they are not lost. Either way the shared indicator is
    /// canceled to stop siblings from claiming further work.
    fn record_failure(&self, failure: Failure) {
        {
            let mut slot = lock_or_recover(&self.failure);
            if slot.is_none() {
                *slot = Some(failure);
            } else if let Failure::Error(error) = &failure {
                tracing::debug!(%error, "suppressing secondary dispatch failure");
            }
        }
        self.progress.cancel();
    }

    fn defer_range(&self, lo: usize, hi: usize) {
        lock_or_recover(&self.deferred).push((lo, hi));
    }

    fn mark_finished(&self) {
        let mut finished = lock_or_recover(&self.finished);
        *finished += 1;
        self.task_done.notify_all();
    }

    /// Waits for every range to finish. The periodic wake keeps the wait
    /// honest even if a notification is missed around the timeout edge.
    fn join(&self) {
        let total = self.tasks.len();
        let mut finished = lock_or_recover(&self.finished);
        while *finished < total {
            let (guard, _timeout) = match self.task_done.wait_timeout(finished, JOIN_POLL_INTERVAL)
            {
                Ok(result) => result,
                Err(poisoned) => poisoned.into_inner(),
            };
            finished = guard;
        }
    }

    fn resolve(&self) -> Result<bool, JobError> {
        match lock_or_recover(&self.failure).take() {
            Some(Failure::Error(error)) => return Err(JobError::Processor(error)),
            Some(Failure::Stop) => return Ok(false),
            None => {}
        }
        if self.progress.is_canceled() {
            return Err(JobError::Canceled);
        }
        self.retry_deferred()
    }

    /// Re-attempts ranges that lost the fail-fast read-lock race, serially
    /// and once. A range still contended here surfaces as a lock conflict
    /// instead of retrying unboundedly.
    fn retry_deferred(&self) -> Result<bool, JobError> {
        let deferred = mem::take(&mut *lock_or_recover(&self.deferred));
        if deferred.is_empty() {
            return Ok(true);
        }
        let Some(action) = self.read_action.as_ref() else {
            return Ok(true);
        };
        tracing::debug!(ranges = deferred.len(), "retrying lock-deferred ranges serially");

        for (lo, hi) in deferred {
            if lock_or_recover(&self.failure).is_some() {
                break;
            }
            self.progress.check_canceled()?;
            if !action
                .lock
                .try_run_under_read_lock(&mut || self.process_span(lo, hi))
            {
                return Err(JobError::LockConflict);
            }
        }

        match lock_or_recover(&self.failure).take() {
            Some(Failure::Error(error)) => Err(JobError::Processor(error)),
            Some(Failure::Stop) => Ok(false),
            None => Ok(true),
        }
    }
}

/// Inline fast path: no fork/join overhead for trivial batches, and no
/// deadlock when the caller already holds the exclusive side.
fn process_sequentially<T, P>(
    items: &[T],
    progress: &ProgressIndicator,
    read_action: Option<&ReadAction>,
    processor: &P,
) -> Result<bool, JobError>
where
    P: Fn(&T) -> anyhow::Result<bool>,
{
    for item in items {
        progress.check_canceled()?;
        let outcome = match read_action {
            None => (processor)(item),
            Some(action) => {
                let mut result = Ok(true);
                action
                    .lock
                    .run_under_read_lock(&mut || result = (processor)(item));
                result
            }
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(error) => return Err(JobError::Processor(error)),
        }
    }
    Ok(true)
}

fn lock_or_recover<'a, V>(mutex: &'a Mutex<V>) -> std::sync::MutexGuard<'a, V> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
