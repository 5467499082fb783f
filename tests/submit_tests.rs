use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use forkspan::JobDispatcher;

#[test]
fn submitted_job_runs_and_completes() {
    let dispatcher = JobDispatcher::default();
    let ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    let handle = dispatcher.submit(move || {
        flag.store(true, Ordering::SeqCst);
    });

    assert!(handle.wait_for_completion(Duration::from_secs(5)));
    assert!(handle.is_done());
    assert!(!handle.is_canceled());
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn wait_for_completion_times_out_on_a_slow_job() {
    let dispatcher = JobDispatcher::default();
    let handle = dispatcher.submit(|| thread::sleep(Duration::from_millis(300)));

    assert!(!handle.wait_for_completion(Duration::from_millis(10)));
    assert!(!handle.is_done());

    assert!(handle.wait_for_completion(Duration::from_secs(5)));
    assert!(handle.is_done());
}

#[test]
fn cancel_before_start_skips_the_job() {
    let dispatcher = JobDispatcher::default();
    let gate = Arc::new(AtomicBool::new(false));

    // Occupy every pool thread so the target job stays queued until the
    // gate opens.
    let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let blockers: Vec<_> = (0..workers.max(2) * 2)
        .map(|_| {
            let gate = Arc::clone(&gate);
            dispatcher.submit(move || {
                while !gate.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(2));
                }
            })
        })
        .collect();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let handle = dispatcher.submit(move || {
        flag.store(true, Ordering::SeqCst);
    });

    handle.cancel();
    assert!(handle.is_canceled());

    gate.store(true, Ordering::SeqCst);
    for blocker in blockers {
        assert!(blocker.wait_for_completion(Duration::from_secs(5)));
    }

    // The canceled job still completes its handle, but its body never ran.
    assert!(handle.wait_for_completion(Duration::from_secs(5)));
    assert!(handle.is_done());
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn handle_clones_share_completion_state() {
    let dispatcher = JobDispatcher::default();
    let handle = dispatcher.submit(|| {});
    let clone = handle.clone();

    assert!(handle.wait_for_completion(Duration::from_secs(5)));
    assert!(clone.is_done());
}
