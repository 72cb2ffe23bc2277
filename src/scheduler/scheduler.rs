// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The multi-threaded fiber scheduler.
//!
//! N OS worker threads share one mutex-protected pending list of
//! (fiber-or-callback, affinity) entries. Each worker repeatedly picks the
//! next entry whose affinity matches it, resumes it to a suspension or
//! completion point, and falls back to the idle hook when nothing is
//! runnable. Fibers are cooperative: a fiber keeps its worker until it
//! yields, suspends in a hooked I/O call, or finishes.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fiber::{
        Fiber,
        FiberState,
        SharedFiber,
    },
    pal,
    scheduler::{
        entry::ScheduleEntry,
        hooks::ChannelHooks,
        Callback,
        Runnable,
        SchedulerHooks,
        Tid,
    },
};
use ::parking_lot::{
    Condvar,
    Mutex,
};
use ::std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    thread,
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

thread_local! {
    /// The scheduler owning the calling thread, if it is a worker (or the
    /// constructing thread of a caller-mode scheduler).
    static CURRENT_SCHEDULER: RefCell<Option<Scheduler>> = RefCell::new(None);
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Shared handle to a scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    /// Diagnostic name; worker threads are named `{name}-{index}`.
    name: String,
    /// Total worker slots, including the caller thread in caller mode.
    thread_count: usize,
    /// Whether the constructing thread serves as a worker during stop().
    use_caller: bool,
    /// OS tid of the constructing thread in caller mode.
    root_tid: Option<Tid>,
    /// Extension seams (trickle/idle/stopping), see [SchedulerHooks].
    hooks: Arc<dyn SchedulerHooks>,
    /// Pending tasks.
    pending: Mutex<VecDeque<ScheduleEntry>>,
    /// Handles of the spawned worker threads.
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    /// OS tids of all worker slots; complete once start() returns.
    thread_ids: Mutex<Vec<Tid>>,
    /// Signalled as workers register their tids.
    registered: Condvar,
    started: AtomicBool,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    /// Workers currently mid-execution of a task.
    active_count: AtomicUsize,
    /// Workers currently blocked in the idle hook.
    idle_count: AtomicUsize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Scheduler {
    /// Creates a scheduler with `threads` worker slots and the default idle
    /// behavior (park on a wakeup channel). With `use_caller`, the calling
    /// thread takes one slot and drains the run loop inside [Scheduler::stop].
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Self {
        Self::with_hooks(threads, use_caller, name, Arc::new(ChannelHooks::new()))
    }

    /// Creates a scheduler with custom hooks. Used by the I/O manager to park
    /// idle workers in epoll_wait.
    pub fn with_hooks(threads: usize, use_caller: bool, name: &str, hooks: Arc<dyn SchedulerHooks>) -> Self {
        assert!(threads > 0, "a scheduler needs at least one worker slot");
        let root_tid: Option<Tid> = use_caller.then(pal::linux::gettid);
        let scheduler: Scheduler = Self {
            inner: Arc::new(SchedulerInner {
                name: name.to_string(),
                thread_count: threads,
                use_caller,
                root_tid,
                hooks,
                pending: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(Vec::new()),
                registered: Condvar::new(),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                auto_stop: AtomicBool::new(false),
                active_count: AtomicUsize::new(0),
                idle_count: AtomicUsize::new(0),
            }),
        };
        if use_caller {
            CURRENT_SCHEDULER.with(|cell| {
                cell.replace(Some(scheduler.clone()));
            });
            scheduler
                .inner
                .thread_ids
                .lock()
                .push(root_tid.expect("caller mode records the root tid"));
        }
        scheduler
    }

    /// Returns the scheduler owning the calling thread, if any.
    pub fn current() -> Option<Scheduler> {
        CURRENT_SCHEDULER.with(|cell| cell.borrow().clone())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// OS tids of all worker slots. Complete once [Scheduler::start] returns,
    /// usable as affinity targets for [Scheduler::schedule].
    pub fn thread_ids(&self) -> Vec<Tid> {
        self.inner.thread_ids.lock().clone()
    }

    /// Number of workers currently blocked in the idle hook.
    pub fn idle_workers(&self) -> usize {
        self.inner.idle_count.load(Ordering::SeqCst)
    }

    /// Whether two handles refer to the same scheduler.
    pub fn same(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Spins up the worker threads. Idempotent. Returns once every worker has
    /// registered its OS tid.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let spawn_count: usize = self.inner.thread_count - usize::from(self.inner.use_caller);
        for index in 0..spawn_count {
            let scheduler: Scheduler = self.clone();
            let builder = thread::Builder::new().name(format!("{}-{}", self.inner.name, index));
            let handle = builder
                .spawn(move || scheduler.worker_main())
                .expect("failed to spawn worker thread");
            self.inner.threads.lock().push(handle);
        }
        let mut thread_ids = self.inner.thread_ids.lock();
        while thread_ids.len() < self.inner.thread_count {
            self.inner.registered.wait(&mut thread_ids);
        }
        debug!("{}: started {} worker(s)", self.inner.name, self.inner.thread_count);
    }

    /// Appends a runnable to the pending list. If the list was empty, one
    /// trickle wakes an idle worker so the task is noticed immediately.
    pub fn schedule(&self, runnable: Runnable, thread: Option<Tid>) {
        if let Runnable::Fiber(ref fiber) = runnable {
            fiber.mark_queued();
        }
        let need_trickle: bool = {
            let mut pending = self.inner.pending.lock();
            let was_empty: bool = pending.is_empty();
            pending.push_back(ScheduleEntry { runnable, thread });
            was_empty
        };
        if need_trickle {
            self.inner.hooks.trickle(self);
        }
    }

    /// Schedules a fiber for resumption.
    pub fn schedule_fiber(&self, fiber: SharedFiber, thread: Option<Tid>) {
        self.schedule(Runnable::Fiber(fiber), thread);
    }

    /// Schedules a plain callback.
    pub fn schedule_call<F: FnOnce() + Send + 'static>(&self, callback: F, thread: Option<Tid>) {
        self.schedule(Runnable::Callback(Box::new(callback)), thread);
    }

    /// Schedules a batch of runnables, amortizing the wakeup signal to one
    /// trickle per batch.
    pub fn schedule_all<I: IntoIterator<Item = Runnable>>(&self, runnables: I) {
        let need_trickle: bool = {
            let mut pending = self.inner.pending.lock();
            let was_empty: bool = pending.is_empty();
            for runnable in runnables {
                if let Runnable::Fiber(ref fiber) = runnable {
                    fiber.mark_queued();
                }
                pending.push_back(ScheduleEntry { runnable, thread: None });
            }
            was_empty && !pending.is_empty()
        };
        if need_trickle {
            self.inner.hooks.trickle(self);
        }
    }

    /// Creates a fiber running `coroutine` and schedules it.
    pub fn spawn<F: Future<Output = ()> + Send + 'static>(&self, name: &str, coroutine: F) -> SharedFiber {
        let fiber: SharedFiber = Fiber::new(name, coroutine);
        self.schedule_fiber(fiber.clone(), None);
        fiber
    }

    /// Whether stop() has been requested.
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// The scheduler-level stop predicate: stop was requested, the pending
    /// list is empty, and no worker is mid-task. Hook implementations may add
    /// further conditions on top.
    pub fn base_stopping(&self) -> bool {
        self.inner.auto_stop.load(Ordering::SeqCst)
            && self.inner.stopping.load(Ordering::SeqCst)
            && self.inner.pending.lock().is_empty()
            && self.inner.active_count.load(Ordering::SeqCst) == 0
    }

    /// Stops the scheduler, draining the pending list first: every task queued
    /// before (or during) the drain runs to completion exactly once before
    /// this returns. In caller mode this must be called on the constructing
    /// thread, which serves as the draining worker; otherwise it must be
    /// called from outside the workers.
    pub fn stop(&self) {
        self.inner.auto_stop.store(true, Ordering::SeqCst);
        self.inner.stopping.store(true, Ordering::SeqCst);

        if self.inner.use_caller {
            let root_tid: Tid = self.inner.root_tid.expect("caller mode records the root tid");
            assert!(
                pal::linux::gettid() == root_tid,
                "stop(): a caller-mode scheduler must be stopped from its owning thread",
            );
        } else {
            assert!(
                Self::current().map_or(true, |current| !current.same(self)),
                "stop(): cannot stop a scheduler from inside one of its workers",
            );
        }

        // Wake every worker so blocked idle hooks re-check the stop predicate.
        for _ in 0..self.inner.thread_count {
            self.inner.hooks.trickle(self);
        }
        if self.inner.use_caller {
            self.inner.hooks.trickle(self);
            if !self.stopping_check() {
                // The constructing thread serves as the last worker and
                // drains the pending list inline.
                self.run_loop(self.inner.root_tid.expect("caller mode records the root tid"));
            }
        }

        let handles: Vec<thread::JoinHandle<()>> = self.inner.threads.lock().drain(..).collect();
        for handle in handles {
            // Keep joining even if a worker died; remaining workers must
            // still be reaped.
            let _ = handle.join();
        }

        if self.inner.use_caller {
            CURRENT_SCHEDULER.with(|cell| {
                let matches: bool = cell.borrow().as_ref().map_or(false, |current| current.same(self));
                if matches {
                    cell.replace(None);
                }
            });
        }
        info!("{}: stopped", self.inner.name);
    }

    fn stopping_check(&self) -> bool {
        self.inner.hooks.stopping(self)
    }

    /// Entry point of a spawned worker thread.
    fn worker_main(self) {
        CURRENT_SCHEDULER.with(|cell| {
            cell.replace(Some(self.clone()));
        });
        crate::hook::set_hook_enable(true);
        self.inner.hooks.on_thread_start(&self);

        let tid: Tid = pal::linux::gettid();
        {
            let mut thread_ids = self.inner.thread_ids.lock();
            thread_ids.push(tid);
            self.inner.registered.notify_all();
        }
        self.run_loop(tid);
    }

    /// The scheduling loop: pick, run, idle.
    fn run_loop(&self, tid: Tid) {
        trace!("{}: worker loop entered (tid={:?})", self.inner.name, tid);
        // Scratch fiber for plain callbacks, reused across tasks.
        let mut scratch: Option<SharedFiber> = None;
        loop {
            let (picked, trickle_me): (Option<Runnable>, bool) = self.take_next(tid);
            if trickle_me {
                // Entries remain that this worker cannot run; someone else
                // must wake for them.
                self.inner.hooks.trickle(self);
            }
            match picked {
                Some(Runnable::Fiber(fiber)) => {
                    if !fiber.is_terminal() {
                        fiber.resume(self);
                    }
                    self.inner.active_count.fetch_sub(1, Ordering::SeqCst);
                },
                Some(Runnable::Callback(callback)) => {
                    self.run_callback(callback, &mut scratch);
                    self.inner.active_count.fetch_sub(1, Ordering::SeqCst);
                },
                None => {
                    if self.stopping_check() {
                        break;
                    }
                    self.inner.idle_count.fetch_add(1, Ordering::SeqCst);
                    self.inner.hooks.idle(self);
                    self.inner.idle_count.fetch_sub(1, Ordering::SeqCst);
                },
            }
        }
        trace!("{}: worker loop exited (tid={:?})", self.inner.name, tid);
    }

    /// Runs a plain callback inside the worker's scratch fiber so failures
    /// are contained the same way as for any fiber.
    fn run_callback(&self, callback: Callback, scratch: &mut Option<SharedFiber>) {
        let fiber: SharedFiber = match scratch.take() {
            Some(fiber) => fiber,
            None => Fiber::new(&format!("{}-callback", self.inner.name), async {}),
        };
        fiber.reset(async move { callback() });
        fiber.resume(self);
        if fiber.is_terminal() {
            // Callbacks are synchronous, so the scratch fiber is normally
            // terminal here and gets reused for the next one.
            *scratch = Some(fiber);
        }
    }

    /// Picks the next pending entry this worker may run. Also reports whether
    /// entries remain that need another worker's attention.
    fn take_next(&self, tid: Tid) -> (Option<Runnable>, bool) {
        let mut trickle_me: bool = false;
        let mut pending = self.inner.pending.lock();
        let mut index: usize = 0;
        while index < pending.len() {
            if let Some(want) = pending[index].thread {
                if want != tid {
                    trickle_me = true;
                    index += 1;
                    continue;
                }
            }
            if let Runnable::Fiber(ref fiber) = pending[index].runnable {
                // Defensive double-schedule guard: leave executing fibers
                // queued until they suspend.
                if fiber.state() == FiberState::Exec {
                    index += 1;
                    continue;
                }
            }
            let entry: ScheduleEntry = pending.remove(index).expect("index is in bounds");
            // Claimed while still holding the lock, so the stop predicate
            // never observes an empty list with the task in limbo.
            self.inner.active_count.fetch_add(1, Ordering::SeqCst);
            trickle_me |= index < pending.len();
            return (Some(entry.runnable), trickle_me);
        }
        (None, trickle_me)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Scheduler;
    use crate::fiber::{
        Fiber,
        FiberState,
        SharedFiber,
    };
    use ::anyhow::Result;
    use ::std::{
        sync::{
            atomic::{
                AtomicUsize,
                Ordering,
            },
            Arc,
        },
        time::Duration,
    };

    #[test]
    fn scheduled_callbacks_run_before_stop_returns() -> Result<()> {
        let scheduler: Scheduler = Scheduler::new(2, false, "sched-test");
        scheduler.start();

        let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter_ref: Arc<AtomicUsize> = counter.clone();
            scheduler.schedule_call(
                move || {
                    counter_ref.fetch_add(1, Ordering::SeqCst);
                },
                None,
            );
        }
        scheduler.stop();
        crate::ensure_eq!(counter.load(Ordering::SeqCst), 16);
        Ok(())
    }

    #[test]
    fn spawned_fiber_runs_to_completion() -> Result<()> {
        let scheduler: Scheduler = Scheduler::new(1, false, "sched-spawn");
        scheduler.start();

        let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let counter_ref: Arc<AtomicUsize> = counter.clone();
        let fiber: SharedFiber = scheduler.spawn("worker-fiber", async move {
            crate::fiber::yield_to_ready().await;
            counter_ref.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.stop();
        crate::ensure_eq!(counter.load(Ordering::SeqCst), 1);
        crate::ensure_eq!(fiber.state(), FiberState::Term);
        Ok(())
    }

    #[test]
    fn panicking_callback_does_not_kill_the_worker() -> Result<()> {
        let scheduler: Scheduler = Scheduler::new(1, false, "sched-panic");
        scheduler.start();

        let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_call(|| panic!("deliberate failure"), None);
        let counter_ref: Arc<AtomicUsize> = counter.clone();
        scheduler.schedule_call(
            move || {
                counter_ref.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );

        scheduler.stop();
        crate::ensure_eq!(counter.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn hold_fiber_is_requeued_by_external_schedule() -> Result<()> {
        let scheduler: Scheduler = Scheduler::new(1, false, "sched-hold");
        scheduler.start();

        let fiber: SharedFiber = scheduler.spawn("holder", async {
            crate::fiber::yield_to_hold().await;
        });
        // Give the worker a chance to park the fiber.
        while fiber.state() != FiberState::Hold {
            std::thread::sleep(Duration::from_millis(1));
        }
        scheduler.schedule_fiber(fiber.clone(), None);
        while fiber.state() != FiberState::Term {
            std::thread::sleep(Duration::from_millis(1));
        }
        scheduler.stop();
        Ok(())
    }

    #[test]
    fn caller_mode_drains_on_stop() -> Result<()> {
        let scheduler: Scheduler = Scheduler::new(1, true, "sched-caller");
        scheduler.start();

        let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let counter_ref: Arc<AtomicUsize> = counter.clone();
        scheduler.schedule_call(
            move || {
                counter_ref.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        // No spawned workers: the callback runs during the inline drain.
        scheduler.stop();
        crate::ensure_eq!(counter.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn picker_honors_thread_affinity() -> Result<()> {
        let scheduler: Scheduler = Scheduler::new(1, false, "sched-affinity");
        let tid: super::Tid = crate::pal::linux::gettid();

        let fiber: SharedFiber = Fiber::new("pinned", async {});
        scheduler.schedule_fiber(fiber, Some(tid + 1));
        let (picked, trickle_me) = scheduler.take_next(tid);
        // Pinned to another thread: left queued, with a wakeup request for it.
        crate::ensure_eq!(picked.is_none(), true);
        crate::ensure_eq!(trickle_me, true);

        let (picked, _) = scheduler.take_next(tid + 1);
        crate::ensure_eq!(picked.is_some(), true);
        Ok(())
    }
}
