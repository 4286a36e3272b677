// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios for [`ControllableWorker`], exercising a ticking
//! worker the way a real caller would drive one: start it, wait on its
//! state from another thread, and assert on the counter it advances.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use controllable_worker::{ControllableWorker, WorkerConfig, WorkerFailure, WorkerState};

#[derive(Debug, Clone, PartialEq, Eq)]
struct TickFailure(String);

fn poll_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

/// A worker whose `execute` ticks a counter every few milliseconds, pausing
/// at `i % 20 == 0` and offering a stop breakpoint at `i % 50 == 0`, with a
/// short tick so the test suite stays fast.
fn ticking_worker(
    tick: Duration,
    counter: Arc<AtomicUsize>,
    should_crash_at: Option<usize>,
) -> ControllableWorker<TickFailure> {
    ControllableWorker::new(
        "ticker".to_string(),
        WorkerConfig::default(),
        move |handle| {
            loop {
                let i = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(crash_at) = should_crash_at {
                    if i == crash_at {
                        return Err(WorkerFailure::Crashed(TickFailure(format!(
                            "boom at {i}"
                        ))));
                    }
                }
                if i % 20 == 0 {
                    handle.set_pause_breakpoint();
                }
                if i % 50 == 0 {
                    handle.set_stop_breakpoint()?;
                }
                thread::sleep(tick);
            }
        },
    )
}

/// Installed once per test binary so a `cargo test -- --nocapture` run shows
/// the worker's `tracing` events alongside the assertions.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn scenario_1_running_after_a_few_ticks() {
    init_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let worker = ticking_worker(Duration::from_millis(5), counter.clone(), None);
    worker.start().unwrap();

    assert!(poll_until(
        || counter.load(Ordering::SeqCst) >= 4,
        Duration::from_secs(2)
    ));
    assert_eq!(worker.current_state(), WorkerState::Running);

    worker.stop().unwrap();
    assert!(poll_until(|| worker.is_stopped(), Duration::from_secs(2)));
}

#[test]
fn scenario_2_pause_then_resume_continues_from_the_same_count() {
    let counter = Arc::new(AtomicUsize::new(0));
    let worker = ticking_worker(Duration::from_millis(2), counter.clone(), None);
    worker.start().unwrap();

    worker.pause().unwrap();
    assert!(poll_until(|| worker.is_paused(), Duration::from_secs(2)));
    let count_at_pause = counter.load(Ordering::SeqCst);
    assert_eq!(count_at_pause % 20, 0, "must pause exactly at a breakpoint");

    thread::sleep(Duration::from_millis(30));
    assert_eq!(counter.load(Ordering::SeqCst), count_at_pause);

    worker.resume().unwrap();
    assert!(poll_until(|| worker.is_running(), Duration::from_secs(2)));
    assert!(poll_until(
        || counter.load(Ordering::SeqCst) > count_at_pause,
        Duration::from_secs(2)
    ));

    worker.stop().unwrap();
    assert!(poll_until(|| worker.is_stopped(), Duration::from_secs(2)));
}

#[test]
fn scenario_3_stop_request_drains_to_stopping_then_stopped() {
    let counter = Arc::new(AtomicUsize::new(0));
    let worker = ticking_worker(Duration::from_millis(2), counter.clone(), None);
    worker.start().unwrap();

    assert!(poll_until(
        || counter.load(Ordering::SeqCst) >= 3,
        Duration::from_secs(2)
    ));
    worker.stop().unwrap();
    assert_eq!(worker.current_state(), WorkerState::RunningWaitingForStop);

    assert!(poll_until(|| worker.is_stopping(), Duration::from_secs(2)));
    assert!(poll_until(|| worker.is_stopped(), Duration::from_secs(2)));
}

#[test]
fn scenario_4_crash_then_restart_allows_a_fresh_run() {
    let counter = Arc::new(AtomicUsize::new(0));
    let worker = ticking_worker(Duration::from_millis(2), counter.clone(), Some(15));
    worker.start().unwrap();

    assert!(poll_until(|| worker.is_crashed(), Duration::from_secs(2)));
    let failure = worker.last_crash_failure().expect("crash must be captured");
    assert_eq!(failure, TickFailure("boom at 15".to_string()));

    worker.restart().unwrap();
    assert!(poll_until(|| worker.is_stopped(), Duration::from_secs(2)));
    assert!(worker.last_crash_failure().is_none());
}

#[test]
fn scenario_5_pause_superseded_by_stop_before_any_breakpoint() {
    let counter = Arc::new(AtomicUsize::new(0));
    // A slow tick so neither breakpoint fires before we issue both control calls.
    let worker = ticking_worker(Duration::from_millis(200), counter, None);
    worker.start().unwrap();
    assert!(poll_until(|| worker.is_running(), Duration::from_secs(2)));

    worker.pause().unwrap();
    assert_eq!(worker.current_state(), WorkerState::RunningWaitingForPause);
    worker.stop().unwrap();
    assert_eq!(worker.current_state(), WorkerState::RunningWaitingForStop);

    assert!(poll_until(|| worker.is_stopping(), Duration::from_secs(2)));
    assert!(poll_until(|| worker.is_stopped(), Duration::from_secs(2)));
}

#[test]
fn scenario_6_stop_rescinded_by_start_returns_to_running() {
    let counter = Arc::new(AtomicUsize::new(0));
    // A slow tick so no stop breakpoint fires before the rescinding start lands.
    let worker = ticking_worker(Duration::from_millis(200), counter, None);
    worker.start().unwrap();
    assert!(poll_until(|| worker.is_running(), Duration::from_secs(2)));

    worker.stop().unwrap();
    assert_eq!(worker.current_state(), WorkerState::RunningWaitingForStop);

    worker.start().unwrap();
    assert_eq!(
        worker.current_state(),
        WorkerState::Running,
        "a pending stop must be rescinded by a fresh start"
    );

    worker.stop().unwrap();
    assert!(poll_until(|| worker.is_stopped(), Duration::from_secs(2)));
}

#[test]
fn scenario_7_user_execute_returns_normally_sets_its_own_flag() {
    let did_finish = Arc::new(AtomicUsize::new(0));
    let flag = did_finish.clone();
    let worker: ControllableWorker<TickFailure> =
        ControllableWorker::new("self-terminating".to_string(), WorkerConfig::default(), move |_h| {
            flag.store(1, Ordering::SeqCst);
            Ok(())
        });

    worker.start().unwrap();
    assert!(poll_until(|| worker.is_stopped(), Duration::from_secs(2)));
    assert_eq!(did_finish.load(Ordering::SeqCst), 1);
}
