//! Continuous draining of tombstone-terminated queues.
//!
//! `parallelism - 1` pool workers plus one inline worker cooperatively
//! empty a blocking queue. Each worker terminates on its own first
//! failure (the failed item preserved for retry) or on observing the
//! tombstone, which it re-enqueues so every sibling also gets to stop.
//! Siblings are never aborted early by one worker's failure; the queue
//! keeps draining.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use crossbeam_channel::bounded;

use crate::error::JobError;
use crate::pool::{panic_message, WorkerPool};
use crate::progress::ProgressIndicator;
use crate::queue::{ItemQueue, RetryQueue};

use super::JobDispatcher;

impl JobDispatcher {
    /// Continuously applies `processor` to items from `queue` until every
    /// worker has observed `tombstone`.
    ///
    /// Previously failed items land in `retry` and are drained ahead of
    /// fresh queue items on this and later passes. Returns `Ok(true)` when
    /// every worker finished cleanly without an intentional stop; the
    /// first failure recorded across all workers is re-raised after all of
    /// them have finished. Head-to-tail priority is approximate, not
    /// strict, once several workers drain concurrently.
    pub fn drain<T, P>(
        &self,
        queue: &ItemQueue<T>,
        retry: &Arc<RetryQueue<T>>,
        progress: &Arc<ProgressIndicator>,
        tombstone: T,
        processor: P,
    ) -> Result<bool, JobError>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        P: Fn(&T) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        let mut first_items = self.pre_drain(queue, &tombstone);
        first_items.resize_with(self.parallelism(), || None);

        let state = Arc::new(DrainState {
            queue: queue.clone(),
            retry: Arc::clone(retry),
            progress: Arc::clone(progress),
            tombstone,
            processor,
            failure: Mutex::new(None),
        });

        let spawned = self.parallelism() - 1;
        tracing::debug!(workers = spawned + 1, "draining queue");
        let (worker_done_tx, worker_done_rx) = bounded(spawned);

        // The caller keeps one first element for its own inline worker.
        let inline_first = first_items.pop().unwrap_or(None);
        for first in first_items {
            let state = Arc::clone(&state);
            let worker_done_tx = worker_done_tx.clone();
            WorkerPool::shared().execute(move || {
                let clean = state.consume(first);
                let _ = worker_done_tx.send(clean);
            });
        }

        let mut all_clean = state.consume(inline_first);

        // Every worker terminates: the tombstone is re-enqueued by each
        // one that sees it, and a failing worker exits on its own.
        for _ in 0..spawned {
            match worker_done_rx.recv() {
                Ok(clean) => all_clean &= clean,
                Err(_) => all_clean = false,
            }
        }

        if let Some(error) = lock_or_recover(&state.failure).take() {
            return Err(error);
        }
        Ok(all_clean)
    }

    /// Dequeues up to `parallelism` items ahead of spawning so each worker
    /// starts with one pop already done. A tombstone surfacing here goes
    /// straight back onto the queue, unconsumed, and ends the pre-drain.
    fn pre_drain<T>(&self, queue: &ItemQueue<T>, tombstone: &T) -> Vec<Option<T>>
    where
        T: PartialEq + Send,
    {
        let mut first_items = Vec::with_capacity(self.parallelism());
        while first_items.len() < self.parallelism() {
            match queue.try_pop() {
                Some(item) if item == *tombstone => {
                    queue.push(item);
                    break;
                }
                Some(item) => first_items.push(Some(item)),
                None => break,
            }
        }
        first_items
    }
}

/// State shared by the workers of one drain call.
struct DrainState<T, P> {
    queue: ItemQueue<T>,
    retry: Arc<RetryQueue<T>>,
    progress: Arc<ProgressIndicator>,
    tombstone: T,
    processor: P,
    failure: Mutex<Option<JobError>>,
}

impl<T, P> DrainState<T, P>
where
    T: Clone + PartialEq + Send + Sync,
    P: Fn(&T) -> anyhow::Result<bool> + Send + Sync,
{
    /// One worker loop. Returns `true` only for a clean tombstone (or
    /// end-of-input) exit with no intentional stop.
    fn consume(&self, first: Option<T>) -> bool {
        let mut next = first;
        loop {
            let item = match next.take().or_else(|| self.retry.pop()) {
                Some(item) => item,
                None => match self.queue.pop_blocking() {
                    Some(item) => item,
                    // Producers gone without a tombstone; nothing left.
                    None => return true,
                },
            };

            if item == self.tombstone {
                // Siblings still blocked on the queue must observe the
                // tombstone too.
                self.queue.push(item);
                return true;
            }

            if self.progress.is_canceled() {
                self.retry.push(item);
                self.record_failure(JobError::Canceled);
                return false;
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.processor)(&item)));
            match outcome {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return false,
                Ok(Err(error)) => {
                    // The item goes back into circulation; the failure
                    // contract is at-least-once with retry, not
                    // exactly-once.
                    self.retry.push(item);
                    self.record_failure(JobError::Processor(error));
                    return false;
                }
                Err(payload) => {
                    self.retry.push(item);
                    self.record_failure(JobError::Processor(anyhow!(
                        "processor panicked: {}",
                        panic_message(payload.as_ref())
                    )));
                    return false;
                }
            }
        }
    }

    fn record_failure(&self, error: JobError) {
        let mut slot = lock_or_recover(&self.failure);
        if slot.is_none() {
            *slot = Some(error);
        } else {
            tracing::debug!(%error, "suppressing secondary drain failure");
        }
    }
}

fn lock_or_recover<'a, V>(mutex: &'a Mutex<V>) -> std::sync::MutexGuard<'a, V> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
