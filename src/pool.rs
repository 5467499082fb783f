//! Shared worker pool reused across all dispatch calls.
//!
//! One fixed set of threads, sized to hardware parallelism, serves every
//! [`JobDispatcher`](crate::JobDispatcher) in the process. Dispatch jobs
//! never block inside the pool (they claim work, help siblings, and
//! return), so saturation from unrelated callers cannot deadlock a
//! dispatch; the calling thread always participates in its own work.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use once_cell::sync::Lazy;

type Job = Box<dyn FnOnce() + Send + 'static>;

static SHARED_POOL: Lazy<WorkerPool> = Lazy::new(|| WorkerPool::new(num_cpus::get().max(1)));

pub(crate) struct WorkerPool {
    job_tx: Sender<Job>,
}

impl WorkerPool {
    /// The process-wide pool, created on first use.
    pub(crate) fn shared() -> &'static WorkerPool {
        &SHARED_POOL
    }

    fn new(size: usize) -> Self {
        let (job_tx, job_rx) = unbounded::<Job>();
        for worker_id in 0..size {
            let job_rx = job_rx.clone();
            thread::Builder::new()
                .name(format!("job-worker-{worker_id}"))
                .spawn(move || worker_loop(job_rx))
                .expect("failed to spawn pool worker thread");
        }
        Self { job_tx }
    }

    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) {
        // The receiver side lives in the pool threads for the whole
        // process lifetime, so the send cannot fail.
        let _ = self.job_tx.send(Box::new(job));
    }
}

fn worker_loop(job_rx: Receiver<Job>) {
    while let Ok(job) = job_rx.recv() {
        // A panicking job must not retire a shared pool thread.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!(panic = %panic_message(payload.as_ref()), "pool job panicked");
        }
    }
}

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn shared_pool_runs_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            let done_tx = done_tx.clone();
            WorkerPool::shared().execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                done_tx.send(()).ok();
            });
        }
        for _ in 0..8 {
            done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("pool job never ran");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn pool_survives_panicking_job() {
        let (done_tx, done_rx) = mpsc::channel();

        WorkerPool::shared().execute(|| panic!("deliberate test panic"));
        WorkerPool::shared().execute(move || {
            done_tx.send(()).ok();
        });

        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("pool stopped running jobs after a panic");
    }

    #[test]
    fn panic_message_extracts_common_payloads() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn Any + Send> = Box::new(17_u32);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
