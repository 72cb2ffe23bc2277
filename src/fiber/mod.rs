// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fibers: cooperatively-scheduled units of execution.
//!
//! Rust has no safe stack-switching primitive, so a fiber does not own a raw
//! execution stack. Instead it owns a pinned coroutine (a boxed future) and a
//! lifecycle state machine; "switching in" is polling the coroutine and
//! "switching out" is the coroutine returning [Poll::Pending]. The price is
//! that a fiber can only suspend at await points, never at arbitrary call
//! depth; anything that needs to suspend must be async.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod yielder;

pub use self::yielder::{
    yield_to_hold,
    yield_to_ready,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::scheduler::Scheduler;
use ::futures::task::ArcWake;
use ::parking_lot::Mutex;
use ::std::{
    any::Any,
    backtrace::Backtrace,
    cell::RefCell,
    future::Future,
    panic::{
        self,
        AssertUnwindSafe,
    },
    pin::Pin,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            AtomicU8,
            Ordering,
        },
        Arc,
        Weak,
    },
    task::{
        Context,
        Poll,
        Waker,
    },
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Source of fiber identifiers. Id 0 is reserved for "no fiber" (the bare
/// thread), so the first fiber allocated gets id 1.
static FIBER_ID: AtomicU64 = AtomicU64::new(0);

/// Number of live fibers in the process.
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The fiber currently executing on this thread, if any.
    static CURRENT_FIBER: RefCell<Option<SharedFiber>> = RefCell::new(None);
}

//======================================================================================================================
// Types
//======================================================================================================================

/// The unit of execution a fiber owns: a pinned, boxed future.
type Coroutine = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Lifecycle state of a fiber.
///
/// Legal transitions: INIT→EXEC; EXEC→{READY, HOLD, TERM, EXCEPT}; READY→EXEC;
/// HOLD→EXEC; and {INIT, TERM, EXCEPT}→INIT through [Fiber::reset]. Anything
/// else is a contract violation.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FiberState {
    /// Freshly created or reset; has not run yet.
    Init = 0,
    /// Currently being polled by a worker thread.
    Exec = 1,
    /// Suspended; waits for an external actor (I/O event, timer, explicit
    /// schedule) to re-queue it.
    Hold = 2,
    /// Suspended but runnable; sits in a scheduler queue.
    Ready = 3,
    /// Coroutine ran to completion.
    Term = 4,
    /// Coroutine panicked; the failure was contained and logged.
    Except = 5,
}

/// A cooperatively-scheduled unit of execution.
pub struct Fiber {
    /// Monotonically increasing identifier. Never 0.
    id: u64,
    /// Diagnostic name.
    name: String,
    /// Lifecycle state, see [FiberState].
    state: AtomicU8,
    /// Whether this fiber currently sits in a scheduler queue. Used to
    /// de-duplicate wakeups.
    queued: AtomicBool,
    /// Set when a wakeup arrives while the fiber is executing; consumed when
    /// the poll returns to decide READY (re-queue) versus HOLD (park).
    notified: AtomicBool,
    /// Back-reference to the owning [Arc], for handing the fiber to wakers
    /// and schedulers from `&self` methods.
    self_handle: Weak<Fiber>,
    /// The coroutine. None once the fiber reached a terminal state.
    coroutine: Mutex<Option<Coroutine>>,
}

/// Shared handle to a fiber.
pub type SharedFiber = Arc<Fiber>;

/// Waker that re-queues a suspended fiber onto the scheduler it last ran on.
struct FiberWaker {
    fiber: SharedFiber,
    scheduler: Scheduler,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl FiberState {
    fn from_u8(value: u8) -> FiberState {
        match value {
            0 => FiberState::Init,
            1 => FiberState::Exec,
            2 => FiberState::Hold,
            3 => FiberState::Ready,
            4 => FiberState::Term,
            5 => FiberState::Except,
            _ => unreachable!("invalid fiber state: {:?}", value),
        }
    }
}

impl Fiber {
    /// Creates a new fiber running `coroutine`, in state INIT.
    pub fn new<F: Future<Output = ()> + Send + 'static>(name: &str, coroutine: F) -> SharedFiber {
        let id: u64 = FIBER_ID.fetch_add(1, Ordering::SeqCst) + 1;
        FIBER_COUNT.fetch_add(1, Ordering::SeqCst);
        trace!("Fiber::new(): id={:?} name={:?}", id, name);
        Arc::new_cyclic(|self_handle| Self {
            id,
            name: name.to_string(),
            state: AtomicU8::new(FiberState::Init as u8),
            queued: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            self_handle: self_handle.clone(),
            coroutine: Mutex::new(Some(Box::pin(coroutine))),
        })
    }

    /// The owning shared handle of this fiber.
    fn shared(&self) -> SharedFiber {
        self.self_handle.upgrade().expect("fiber is alive while referenced")
    }

    /// Returns the fiber executing on the calling thread, if any.
    pub fn current() -> Option<SharedFiber> {
        CURRENT_FIBER.with(|cell| cell.borrow().clone())
    }

    /// Returns the id of the fiber executing on the calling thread, or 0 when
    /// the thread is not running a fiber.
    pub fn current_id() -> u64 {
        CURRENT_FIBER.with(|cell| cell.borrow().as_ref().map_or(0, |fiber| fiber.id))
    }

    /// Number of live fibers in the process.
    pub fn total_fibers() -> u64 {
        FIBER_COUNT.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the fiber finished, normally or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state(), FiberState::Term | FiberState::Except)
    }

    /// Re-arms a finished (or never-started) fiber with a new coroutine,
    /// returning it to INIT. The fiber object is reused, which is how the
    /// scheduler amortizes per-callback allocations.
    pub fn reset<F: Future<Output = ()> + Send + 'static>(&self, coroutine: F) {
        let state: FiberState = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Term | FiberState::Except),
            "reset(): fiber {:?} is still live (state={:?})",
            self.id,
            state,
        );
        assert!(!self.queued.load(Ordering::Acquire), "reset(): fiber {:?} is still queued", self.id);
        *self.coroutine.lock() = Some(Box::pin(coroutine));
        self.notified.store(false, Ordering::Release);
        self.set_state(FiberState::Init);
    }

    /// Runs the fiber on the calling thread until it suspends or finishes.
    ///
    /// This is the trampoline: a panic inside the coroutine is contained
    /// here (state EXCEPT, logged with id and backtrace) and never unwinds
    /// into the worker loop. On completion the coroutine is dropped
    /// immediately so that captured state is not kept alive by a terminated
    /// fiber.
    pub(crate) fn resume(&self, scheduler: &Scheduler) {
        let state: FiberState = self.state();
        assert!(state != FiberState::Exec, "resume(): fiber {:?} is already executing", self.id);
        if matches!(state, FiberState::Term | FiberState::Except) {
            // Stale queue entry for a finished fiber.
            return;
        }
        self.queued.store(false, Ordering::Release);
        self.set_state(FiberState::Exec);

        let waker: Waker = ::futures::task::waker(Arc::new(FiberWaker {
            fiber: self.shared(),
            scheduler: scheduler.clone(),
        }));
        let mut context: Context = Context::from_waker(&waker);

        let previous: Option<SharedFiber> = CURRENT_FIBER.with(|cell| cell.replace(Some(self.shared())));
        let poll_result: Result<Poll<()>, Box<dyn Any + Send>> = {
            let mut coroutine = self.coroutine.lock();
            match coroutine.as_mut() {
                Some(future) => panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut context))),
                None => Ok(Poll::Ready(())),
            }
        };
        CURRENT_FIBER.with(|cell| {
            cell.replace(previous);
        });

        match poll_result {
            Ok(Poll::Ready(())) => {
                self.coroutine.lock().take();
                self.set_state(FiberState::Term);
            },
            Ok(Poll::Pending) => {
                if self.notified.swap(false, Ordering::AcqRel) {
                    self.requeue_ready(scheduler);
                } else {
                    self.set_state(FiberState::Hold);
                    // A wakeup may have landed between the poll returning and
                    // the state store above; claim it so it is not lost.
                    if self.notified.swap(false, Ordering::AcqRel) {
                        self.requeue_ready(scheduler);
                    }
                }
            },
            Err(cause) => {
                self.coroutine.lock().take();
                self.set_state(FiberState::Except);
                let backtrace: Backtrace = Backtrace::force_capture();
                error!(
                    "fiber {:?} ({:?}) raised: {}\n{}",
                    self.id,
                    self.name,
                    panic_message(cause.as_ref()),
                    backtrace,
                );
            },
        }
    }

    /// Wakes a suspended fiber: re-queues it on `scheduler`, or, if it is
    /// mid-poll, flags it so the trampoline re-queues it as READY.
    pub(crate) fn wake(&self, scheduler: &Scheduler) {
        match self.state() {
            FiberState::Exec => {
                self.notified.store(true, Ordering::Release);
                // The poll may have finished right before the flag landed; if
                // so, claim the flag back and take the queue path instead.
                if self.state() != FiberState::Exec && self.notified.swap(false, Ordering::AcqRel) {
                    self.enqueue(scheduler);
                }
            },
            FiberState::Init | FiberState::Ready | FiberState::Hold => self.enqueue(scheduler),
            // A stale wakeup for a finished fiber.
            FiberState::Term | FiberState::Except => (),
        }
    }

    /// Marks the fiber as sitting in a scheduler queue.
    pub(crate) fn mark_queued(&self) {
        self.queued.store(true, Ordering::Release);
    }

    fn enqueue(&self, scheduler: &Scheduler) {
        if !self.queued.swap(true, Ordering::AcqRel) {
            scheduler.schedule_fiber(self.shared(), None);
        }
    }

    fn requeue_ready(&self, scheduler: &Scheduler) {
        self.set_state(FiberState::Ready);
        if !self.queued.swap(true, Ordering::AcqRel) {
            scheduler.schedule_fiber(self.shared(), None);
        }
    }

    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn panic_message(cause: &(dyn Any + Send)) -> String {
    if let Some(message) = cause.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl ArcWake for FiberWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.fiber.wake(&arc_self.scheduler);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::SeqCst);
        // Dropping a fiber mid-execution is a contract violation.
        debug_assert!(
            FiberState::from_u8(self.state.load(Ordering::Acquire)) != FiberState::Exec,
            "fiber {:?} dropped while executing",
            self.id,
        );
        trace!("Fiber::drop(): id={:?} total={:?}", self.id, FIBER_COUNT.load(Ordering::SeqCst));
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Fiber,
        FiberState,
        SharedFiber,
    };
    use crate::scheduler::Scheduler;
    use ::anyhow::Result;
    use ::std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };

    fn test_scheduler() -> Scheduler {
        Scheduler::new(1, false, "fiber-test")
    }

    #[test]
    fn fiber_completes_and_reaches_term() -> Result<()> {
        let scheduler: Scheduler = test_scheduler();
        let ran: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let ran_ref: Arc<AtomicUsize> = ran.clone();
        let fiber: SharedFiber = Fiber::new("one-shot", async move {
            ran_ref.fetch_add(1, Ordering::SeqCst);
        });

        crate::ensure_eq!(fiber.state(), FiberState::Init);
        fiber.resume(&scheduler);
        crate::ensure_eq!(fiber.state(), FiberState::Term);
        crate::ensure_eq!(ran.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn yield_to_hold_parks_until_resumed() -> Result<()> {
        let scheduler: Scheduler = test_scheduler();
        let fiber: SharedFiber = Fiber::new("holder", async {
            crate::fiber::yield_to_hold().await;
        });

        fiber.resume(&scheduler);
        crate::ensure_eq!(fiber.state(), FiberState::Hold);

        // An external actor re-queues a HOLD fiber; resuming completes it.
        fiber.resume(&scheduler);
        crate::ensure_eq!(fiber.state(), FiberState::Term);
        Ok(())
    }

    #[test]
    fn yield_to_ready_requeues_immediately() -> Result<()> {
        let scheduler: Scheduler = test_scheduler();
        let fiber: SharedFiber = Fiber::new("ready", async {
            crate::fiber::yield_to_ready().await;
        });

        fiber.resume(&scheduler);
        crate::ensure_eq!(fiber.state(), FiberState::Ready);
        Ok(())
    }

    #[test]
    fn panicking_fiber_is_contained_as_except() -> Result<()> {
        let scheduler: Scheduler = test_scheduler();
        let fiber: SharedFiber = Fiber::new("bad", async {
            panic!("deliberate failure");
        });

        fiber.resume(&scheduler);
        crate::ensure_eq!(fiber.state(), FiberState::Except);
        Ok(())
    }

    #[test]
    fn reset_returns_terminated_fiber_to_init() -> Result<()> {
        let scheduler: Scheduler = test_scheduler();
        let fiber: SharedFiber = Fiber::new("reused", async {});
        fiber.resume(&scheduler);
        crate::ensure_eq!(fiber.state(), FiberState::Term);

        let ran: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let ran_ref: Arc<AtomicUsize> = ran.clone();
        fiber.reset(async move {
            ran_ref.fetch_add(1, Ordering::SeqCst);
        });
        crate::ensure_eq!(fiber.state(), FiberState::Init);

        fiber.resume(&scheduler);
        crate::ensure_eq!(fiber.state(), FiberState::Term);
        crate::ensure_eq!(ran.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "already executing")]
    fn resume_while_executing_panics() {
        let scheduler: Scheduler = test_scheduler();
        let fiber: SharedFiber = Fiber::new("exec", async {});
        fiber.set_state(FiberState::Exec);
        fiber.resume(&scheduler);
    }

    #[test]
    #[should_panic(expected = "still live")]
    fn reset_while_suspended_panics() {
        let scheduler: Scheduler = test_scheduler();
        let fiber: SharedFiber = Fiber::new("holder", async {
            crate::fiber::yield_to_hold().await;
        });
        fiber.resume(&scheduler);
        fiber.reset(async {});
    }

    #[test]
    fn fiber_ids_are_unique_and_nonzero() -> Result<()> {
        let first: SharedFiber = Fiber::new("a", async {});
        let second: SharedFiber = Fiber::new("b", async {});
        crate::ensure_neq!(first.id(), 0);
        crate::ensure_neq!(first.id(), second.id());
        Ok(())
    }

    #[test]
    fn current_is_set_only_while_executing() -> Result<()> {
        let scheduler: Scheduler = test_scheduler();
        crate::ensure_eq!(Fiber::current_id(), 0);
        let fiber: SharedFiber = Fiber::new("current", async {
            // A failure here surfaces as state EXCEPT below.
            assert_ne!(Fiber::current_id(), 0);
        });
        fiber.resume(&scheduler);
        crate::ensure_eq!(fiber.state(), FiberState::Term);
        crate::ensure_eq!(Fiber::current_id(), 0);
        Ok(())
    }
}
