// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::std::{
    collections::HashSet,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
    },
    time::{
        Duration,
        Instant,
    },
};
use ::weft::{
    fiber,
    scheduler::Tid,
    FiberState,
    Scheduler,
    SharedFiber,
};

//======================================================================================================================
// Unit Tests
//======================================================================================================================

/// Schedules 1000 independent callbacks and checks that every single one ran
/// exactly once by the time stop() returns (drain semantics).
#[test]
fn thousand_callbacks_run_exactly_once() -> Result<()> {
    let scheduler: Scheduler = Scheduler::new(4, false, "counter");
    scheduler.start();

    let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    for _ in 0..1000 {
        let counter_ref: Arc<AtomicUsize> = counter.clone();
        scheduler.schedule_call(
            move || {
                counter_ref.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
    }
    scheduler.stop();
    weft::ensure_eq!(counter.load(Ordering::SeqCst), 1000);
    Ok(())
}

/// A callback with thread affinity only ever executes on that worker; an
/// unconstrained callback may execute anywhere.
#[test]
fn affinity_pins_callbacks_to_their_worker() -> Result<()> {
    let scheduler: Scheduler = Scheduler::new(3, false, "pinned");
    scheduler.start();

    let worker_tids: Vec<Tid> = scheduler.thread_ids();
    weft::ensure_eq!(worker_tids.len(), 3);

    let mismatches: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let runs: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    for &want in &worker_tids {
        for _ in 0..32 {
            let mismatches_ref: Arc<AtomicUsize> = mismatches.clone();
            let runs_ref: Arc<AtomicUsize> = runs.clone();
            scheduler.schedule_call(
                move || {
                    if unsafe { libc::gettid() } != want {
                        mismatches_ref.fetch_add(1, Ordering::SeqCst);
                    }
                    runs_ref.fetch_add(1, Ordering::SeqCst);
                },
                Some(want),
            );
        }
    }
    scheduler.stop();
    weft::ensure_eq!(runs.load(Ordering::SeqCst), 3 * 32);
    weft::ensure_eq!(mismatches.load(Ordering::SeqCst), 0);
    Ok(())
}

/// Unconstrained callbacks spread over the pool; every observed tid must be
/// one of the pool's workers.
#[test]
fn unconstrained_callbacks_stay_inside_the_pool() -> Result<()> {
    let scheduler: Scheduler = Scheduler::new(2, false, "spread");
    scheduler.start();

    let worker_tids: HashSet<Tid> = scheduler.thread_ids().into_iter().collect();
    let observed: Arc<Mutex<HashSet<Tid>>> = Arc::new(Mutex::new(HashSet::new()));
    for _ in 0..64 {
        let observed_ref: Arc<Mutex<HashSet<Tid>>> = observed.clone();
        scheduler.schedule_call(
            move || {
                observed_ref.lock().unwrap().insert(unsafe { libc::gettid() });
            },
            None,
        );
    }
    scheduler.stop();
    for tid in observed.lock().unwrap().iter() {
        weft::ensure_eq!(worker_tids.contains(tid), true);
    }
    Ok(())
}

/// Fibers interleave cooperatively: a fiber that yields READY goes back to
/// the queue and resumes later, preserving its sequential execution order.
#[test]
fn fibers_interleave_through_ready_yields() -> Result<()> {
    let scheduler: Scheduler = Scheduler::new(2, false, "interleave");
    scheduler.start();

    let steps: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let mut fibers: Vec<SharedFiber> = Vec::new();
    for index in 0..8 {
        let steps_ref: Arc<AtomicUsize> = steps.clone();
        fibers.push(scheduler.spawn(&format!("looper-{}", index), async move {
            for _ in 0..10 {
                steps_ref.fetch_add(1, Ordering::SeqCst);
                fiber::yield_to_ready().await;
            }
        }));
    }

    let deadline: Instant = Instant::now() + Duration::from_secs(5);
    while steps.load(Ordering::SeqCst) < 80 {
        assert!(Instant::now() < deadline, "fibers did not finish in time");
        std::thread::sleep(Duration::from_millis(1));
    }
    scheduler.stop();
    for fiber in fibers {
        weft::ensure_eq!(fiber.state(), FiberState::Term);
    }
    Ok(())
}

/// Stop drains: work queued right before stop() still runs to completion
/// before stop() returns, and nothing runs twice.
#[test]
fn stop_drains_queued_callbacks() -> Result<()> {
    let scheduler: Scheduler = Scheduler::new(2, false, "drainer");
    scheduler.start();

    let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let counter_ref: Arc<AtomicUsize> = counter.clone();
        scheduler.schedule_call(
            move || {
                // Make the drain take long enough that stop() observably
                // waits for it.
                std::thread::sleep(Duration::from_micros(100));
                counter_ref.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
    }
    scheduler.stop();
    weft::ensure_eq!(counter.load(Ordering::SeqCst), 100);
    Ok(())
}

/// A panicking task is contained: the scheduler keeps running everything
/// else.
#[test]
fn panicking_tasks_are_isolated() -> Result<()> {
    let scheduler: Scheduler = Scheduler::new(2, false, "isolated");
    scheduler.start();

    let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    for index in 0..50 {
        let counter_ref: Arc<AtomicUsize> = counter.clone();
        if index % 10 == 0 {
            scheduler.schedule_call(|| panic!("deliberate failure"), None);
        }
        scheduler.schedule_call(
            move || {
                counter_ref.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
    }
    scheduler.stop();
    weft::ensure_eq!(counter.load(Ordering::SeqCst), 50);
    Ok(())
}

/// A panicking fiber ends in EXCEPT and its failure never unwinds a worker.
#[test]
fn panicking_fiber_ends_in_except() -> Result<()> {
    let scheduler: Scheduler = Scheduler::new(1, false, "except");
    scheduler.start();

    let fiber: SharedFiber = scheduler.spawn("doomed", async {
        fiber::yield_to_ready().await;
        panic!("deliberate failure");
    });
    let deadline: Instant = Instant::now() + Duration::from_secs(5);
    while fiber.state() != FiberState::Except {
        assert!(Instant::now() < deadline, "fiber did not fail in time");
        std::thread::sleep(Duration::from_millis(1));
    }
    scheduler.stop();
    Ok(())
}

/// Batched scheduling delivers every entry.
#[test]
fn schedule_all_delivers_the_whole_batch() -> Result<()> {
    let scheduler: Scheduler = Scheduler::new(2, false, "batch");
    scheduler.start();

    let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let batch: Vec<weft::Runnable> = (0..64)
        .map(|_| {
            let counter_ref: Arc<AtomicUsize> = counter.clone();
            weft::Runnable::Callback(Box::new(move || {
                counter_ref.fetch_add(1, Ordering::SeqCst);
            }))
        })
        .collect();
    scheduler.schedule_all(batch);
    scheduler.stop();
    weft::ensure_eq!(counter.load(Ordering::SeqCst), 64);
    Ok(())
}
