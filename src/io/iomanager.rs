// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The I/O manager: a scheduler whose idle workers park in epoll_wait.
//!
//! On top of the scheduler's task queue and the timer set, the I/O manager
//! keeps a growable fd-indexed table of event contexts. Arming an event
//! records a resumption target (the currently running fiber or a callback)
//! for one (fd, direction); epoll readiness, cancellation, or a timeout then
//! re-schedules that target exactly once. The idle loop bounds its epoll_wait
//! by the earliest timer deadline and a fixed ceiling, drains due timers
//! into the scheduler, and translates readiness into triggers.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    clock,
    config,
    fail::Fail,
    fiber::Fiber,
    io::{
        fd_context::{
            EventContext,
            FdContext,
        },
        Event,
    },
    logging,
    pal,
    scheduler::{
        Callback,
        Runnable,
        Scheduler,
        SchedulerHooks,
    },
    timer::TimerManager,
};
use ::once_cell::sync::OnceCell;
use ::parking_lot::RwLock;
use ::std::{
    cell::RefCell,
    cmp,
    future::Future,
    mem,
    os::unix::prelude::RawFd,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
        Weak,
    },
    thread,
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Initial size of the fd-context table.
const INITIAL_FD_CONTEXTS: usize = 32;

/// Interest mask covering both directions.
const INTEREST_MASK: u32 = (libc::EPOLLIN | libc::EPOLLOUT) as u32;

//======================================================================================================================
// Static Variables
//======================================================================================================================

thread_local! {
    /// The I/O manager owning the calling thread, if it is one of its workers
    /// (or the constructing thread in caller mode).
    static CURRENT_IOMANAGER: RefCell<Option<IoManager>> = RefCell::new(None);
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Shared handle to an I/O manager.
#[derive(Clone)]
pub struct IoManager {
    inner: Arc<IoInner>,
}

struct IoInner {
    scheduler: Scheduler,
    timers: TimerManager,
    poller: Poller,
}

/// The epoll instance, the self-pipe used to interrupt a blocked epoll_wait,
/// and the fd-context table.
struct Poller {
    epfd: RawFd,
    trickle_fds: [RawFd; 2],
    /// Number of armed (fd, direction) waiters.
    pending_events: AtomicUsize,
    contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    max_events: usize,
    idle_wait_ms: u64,
}

/// Scheduler hooks wiring idle workers into epoll_wait.
struct EpollHooks {
    io: OnceCell<Weak<IoInner>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Poller {
    fn new(max_events: usize, idle_wait_ms: u64) -> Result<Self, Fail> {
        let epfd: RawFd = match unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) } {
            fd if fd >= 0 => fd,
            _ => {
                let errno: libc::c_int = pal::linux::errno();
                return Err(Fail::new(errno, "epoll_create1 failed"));
            },
        };
        let mut trickle_fds: [RawFd; 2] = [0; 2];
        if unsafe { libc::pipe2(trickle_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            let errno: libc::c_int = pal::linux::errno();
            unsafe { libc::close(epfd) };
            return Err(Fail::new(errno, "pipe2 failed"));
        }
        // The read side of the self-pipe sits in the epoll set forever,
        // edge-triggered; a single byte written to the other end interrupts a
        // blocked epoll_wait.
        let mut event: libc::epoll_event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: trickle_fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, trickle_fds[0], &mut event) } != 0 {
            let errno: libc::c_int = pal::linux::errno();
            unsafe {
                libc::close(epfd);
                libc::close(trickle_fds[0]);
                libc::close(trickle_fds[1]);
            }
            return Err(Fail::new(errno, "cannot register self-pipe"));
        }
        let mut contexts: Vec<Option<Arc<FdContext>>> = Vec::new();
        contexts.resize_with(INITIAL_FD_CONTEXTS, || None);
        Ok(Self {
            epfd,
            trickle_fds,
            pending_events: AtomicUsize::new(0),
            contexts: RwLock::new(contexts),
            max_events,
            idle_wait_ms,
        })
    }

    /// Interrupts a blocked epoll_wait.
    fn wake(&self) {
        let byte: u8 = b'T';
        let n: libc::ssize_t =
            unsafe { libc::write(self.trickle_fds[1], (&byte as *const u8) as *const libc::c_void, 1) };
        if n < 0 {
            let errno: libc::c_int = pal::linux::errno();
            // A full pipe already guarantees a pending wakeup.
            if errno != libc::EAGAIN {
                warn!("wake(): trickle write failed (errno={:?})", errno);
            }
        }
    }

    /// Empties the self-pipe after its readable event fired.
    fn drain_trickle(&self) {
        let mut buffer: [u8; 256] = [0; 256];
        loop {
            let n: libc::ssize_t = unsafe {
                libc::read(
                    self.trickle_fds[0],
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    buffer.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn get_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        self.contexts.read().get(fd as usize).cloned().flatten()
    }

    /// Looks up the context for `fd`, growing the table if needed. Entries
    /// are created lazily and never removed.
    fn get_or_create_context(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "invalid file descriptor: {:?}", fd);
        if let Some(context) = self.get_context(fd) {
            return context;
        }
        let mut contexts = self.contexts.write();
        if contexts.len() <= fd as usize {
            let new_size: usize = cmp::max(fd as usize * 3 / 2, fd as usize + 1);
            contexts.resize_with(new_size, || None);
        }
        contexts[fd as usize]
            .get_or_insert_with(|| Arc::new(FdContext::new(fd)))
            .clone()
    }
}

impl EpollHooks {
    fn upgrade(&self) -> Option<Arc<IoInner>> {
        self.io.get().and_then(Weak::upgrade)
    }
}

impl IoInner {
    /// One idle cycle of a worker: bounded epoll_wait, then due timers, then
    /// readiness triggers. Returning hands the worker back to the run loop so
    /// freshly queued tasks are picked up immediately.
    fn idle(&self, scheduler: &Scheduler) {
        let now_ms: u64 = clock::now_ms();
        let next_timer: u64 = self.timers.next_timer_ms(now_ms);
        let timeout_ms: libc::c_int = cmp::min(next_timer, self.poller.idle_wait_ms) as libc::c_int;

        let mut events: Vec<libc::epoll_event> = vec![libc::epoll_event { events: 0, u64: 0 }; self.poller.max_events];
        let ready: libc::c_int = unsafe {
            libc::epoll_wait(
                self.poller.epfd,
                events.as_mut_ptr(),
                self.poller.max_events as libc::c_int,
                timeout_ms,
            )
        };
        if ready < 0 {
            let errno: libc::c_int = pal::linux::errno();
            if errno != libc::EINTR {
                error!("idle(): epoll_wait failed (errno={:?})", errno);
            }
            return;
        }

        // Expired timers are re-injected before any readiness is delivered.
        let callbacks = self.timers.list_expired(clock::now_ms());
        if !callbacks.is_empty() {
            trace!("idle(): {:?} timer callback(s) due", callbacks.len());
            scheduler.schedule_all(
                callbacks
                    .into_iter()
                    .map(|callback| Runnable::Callback(Box::new(move || callback()))),
            );
        }

        for index in 0..ready as usize {
            let revents: u32 = events[index].events;
            let fd: RawFd = events[index].u64 as RawFd;
            if fd == self.poller.trickle_fds[0] {
                self.poller.drain_trickle();
                continue;
            }
            self.process_event(fd, revents, scheduler);
        }
    }

    /// Translates one epoll event into triggers for the armed directions.
    fn process_event(&self, fd: RawFd, revents: u32, scheduler: &Scheduler) {
        let Some(context) = self.poller.get_context(fd) else {
            return;
        };
        let mut triggered: Vec<EventContext> = Vec::new();
        {
            let mut state = context.state.lock();
            let mut real: u32 = revents;
            if real & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                // A broken fd counts as readable and writable so a waiter on
                // either side unblocks instead of hanging forever.
                real |= INTEREST_MASK & state.events;
            }
            let satisfied: u32 = real & state.events & INTEREST_MASK;
            if satisfied == 0 {
                return;
            }
            let remaining: u32 = state.events & !satisfied;
            let op: libc::c_int = if remaining != 0 { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_DEL };
            let mut event: libc::epoll_event = libc::epoll_event {
                events: libc::EPOLLET as u32 | remaining,
                u64: fd as u64,
            };
            if unsafe { libc::epoll_ctl(self.poller.epfd, op, fd, &mut event) } != 0 {
                let errno: libc::c_int = pal::linux::errno();
                error!("process_event(): epoll_ctl failed (fd={:?}, errno={:?})", fd, errno);
                return;
            }
            if satisfied & Event::Read.mask() != 0 {
                triggered.push(mem::take(state.context_mut(Event::Read)));
            }
            if satisfied & Event::Write.mask() != 0 {
                triggered.push(mem::take(state.context_mut(Event::Write)));
            }
            state.events = remaining;
            self.poller.pending_events.fetch_sub(triggered.len(), Ordering::SeqCst);
        }
        // Re-scheduling happens after the fd lock is released; scheduling
        // while holding it would invert lock order against the scheduler.
        for waiter in triggered {
            self.run_waiter(waiter, scheduler);
        }
    }

    /// The sole bridge from "ready" back to "runs again": hands the stored
    /// fiber or callback to the scheduler that owns it.
    fn run_waiter(&self, waiter: EventContext, fallback: &Scheduler) {
        let scheduler: Scheduler = waiter.scheduler.unwrap_or_else(|| fallback.clone());
        if let Some(fiber) = waiter.fiber {
            scheduler.schedule_fiber(fiber, None);
        } else if let Some(callback) = waiter.callback {
            scheduler.schedule(Runnable::Callback(callback), None);
        }
    }
}

impl IoManager {
    /// Creates an I/O manager and starts its scheduler.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Self, Fail> {
        logging::initialize();
        let poller: Poller = Poller::new(config::epoll_max_events().get(), config::idle_wait_ms().get())?;
        let hooks: Arc<EpollHooks> = Arc::new(EpollHooks { io: OnceCell::new() });
        let scheduler: Scheduler = Scheduler::with_hooks(threads, use_caller, name, hooks.clone());
        let inner: Arc<IoInner> = Arc::new(IoInner {
            scheduler,
            timers: TimerManager::new(),
            poller,
        });
        let _ = hooks.io.set(Arc::downgrade(&inner));
        {
            // A timer landing at the front of the set must interrupt a
            // blocked epoll_wait, but only if someone is actually blocked.
            let weak: Weak<IoInner> = Arc::downgrade(&inner);
            inner.timers.set_front_notify(move || {
                if let Some(io) = weak.upgrade() {
                    if io.scheduler.idle_workers() > 0 {
                        io.poller.wake();
                    }
                }
            });
        }
        let manager: IoManager = Self { inner };
        if use_caller {
            CURRENT_IOMANAGER.with(|cell| {
                cell.replace(Some(manager.clone()));
            });
        }
        manager.inner.scheduler.start();
        Ok(manager)
    }

    /// Returns the I/O manager owning the calling thread, if any.
    pub fn current() -> Option<IoManager> {
        CURRENT_IOMANAGER.with(|cell| cell.borrow().clone())
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn timers(&self) -> &TimerManager {
        &self.inner.timers
    }

    /// Schedules a plain callback on the underlying scheduler.
    pub fn schedule_call<F: FnOnce() + Send + 'static>(&self, callback: F) {
        self.inner.scheduler.schedule_call(callback, None);
    }

    /// Creates a fiber running `coroutine` and schedules it.
    pub fn spawn<F: Future<Output = ()> + Send + 'static>(&self, name: &str, coroutine: F) -> crate::fiber::SharedFiber {
        self.inner.scheduler.spawn(name, coroutine)
    }

    /// Number of armed (fd, direction) waiters.
    pub fn pending_events(&self) -> usize {
        self.inner.poller.pending_events.load(Ordering::SeqCst)
    }

    /// Arms `event` on `fd`. The resumption target is `callback` if given,
    /// otherwise the currently running fiber. Arming an already-armed
    /// direction is a contract violation and panics; at most one waiter may
    /// exist per (fd, direction).
    pub fn add_event(&self, fd: RawFd, event: Event, callback: Option<Callback>) -> Result<(), Fail> {
        let context: Arc<FdContext> = self.inner.poller.get_or_create_context(fd);
        debug_assert_eq!(context.fd, fd);
        let mut state = context.state.lock();
        assert!(
            state.events & event.mask() == 0,
            "add_event(): event already registered (fd={:?}, event={:?})",
            fd,
            event,
        );
        let op: libc::c_int = if state.events != 0 { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_ADD };
        let mut epoll_event: libc::epoll_event = libc::epoll_event {
            events: libc::EPOLLET as u32 | state.events | event.mask(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.inner.poller.epfd, op, fd, &mut epoll_event) } != 0 {
            let errno: libc::c_int = pal::linux::errno();
            let cause: String = format!("epoll_ctl failed (fd={:?}, event={:?}, errno={:?})", fd, event, errno);
            error!("add_event(): {}", cause);
            return Err(Fail::new(errno, &cause));
        }
        self.inner.poller.pending_events.fetch_add(1, Ordering::SeqCst);
        state.events |= event.mask();

        let entry: &mut EventContext = state.context_mut(event);
        debug_assert!(entry.is_empty());
        entry.scheduler = Some(Scheduler::current().unwrap_or_else(|| self.inner.scheduler.clone()));
        match callback {
            Some(callback) => entry.callback = Some(callback),
            None => {
                let fiber = Fiber::current().expect("add_event(): no callback given and no fiber is running");
                entry.fiber = Some(fiber);
            },
        }
        Ok(())
    }

    /// Disarms `event` on `fd` without running the waiter; its result is
    /// silently dropped. Returns false if the direction was not armed.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(context) = self.inner.poller.get_context(fd) else {
            return false;
        };
        let mut state = context.state.lock();
        if state.events & event.mask() == 0 {
            return false;
        }
        let remaining: u32 = state.events & !event.mask();
        if !self.update_registration(fd, remaining) {
            return false;
        }
        let _dropped: EventContext = mem::take(state.context_mut(event));
        state.events = remaining;
        self.inner.poller.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Disarms `event` on `fd` and triggers the waiter immediately, as if the
    /// event had fired. Used to force-wake a waiter on early teardown.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(context) = self.inner.poller.get_context(fd) else {
            return false;
        };
        let waiter: EventContext = {
            let mut state = context.state.lock();
            if state.events & event.mask() == 0 {
                return false;
            }
            let remaining: u32 = state.events & !event.mask();
            if !self.update_registration(fd, remaining) {
                return false;
            }
            let waiter: EventContext = mem::take(state.context_mut(event));
            state.events = remaining;
            self.inner.poller.pending_events.fetch_sub(1, Ordering::SeqCst);
            waiter
        };
        self.inner.run_waiter(waiter, &self.inner.scheduler);
        true
    }

    /// Cancels whatever is armed on both directions of `fd`, triggering each
    /// waiter exactly once. Proceeds only when something is armed.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(context) = self.inner.poller.get_context(fd) else {
            return false;
        };
        let mut triggered: Vec<EventContext> = Vec::new();
        {
            let mut state = context.state.lock();
            if state.events == 0 {
                return false;
            }
            if !self.update_registration(fd, 0) {
                return false;
            }
            if state.events & Event::Read.mask() != 0 {
                triggered.push(mem::take(state.context_mut(Event::Read)));
            }
            if state.events & Event::Write.mask() != 0 {
                triggered.push(mem::take(state.context_mut(Event::Write)));
            }
            state.events = 0;
            self.inner.poller.pending_events.fetch_sub(triggered.len(), Ordering::SeqCst);
        }
        for waiter in triggered {
            self.inner.run_waiter(waiter, &self.inner.scheduler);
        }
        true
    }

    /// Stops the underlying scheduler (draining queued work). The stop
    /// predicate additionally waits out armed events and timers.
    pub fn stop(&self) {
        self.inner.scheduler.stop();
        if IoManager::current().map_or(false, |current| Arc::ptr_eq(&current.inner, &self.inner)) {
            CURRENT_IOMANAGER.with(|cell| {
                cell.replace(None);
            });
        }
    }

    /// Rewrites the epoll registration of `fd` to `remaining`, dropping it
    /// entirely when no direction is left.
    fn update_registration(&self, fd: RawFd, remaining: u32) -> bool {
        let op: libc::c_int = if remaining != 0 { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_DEL };
        let mut event: libc::epoll_event = libc::epoll_event {
            events: libc::EPOLLET as u32 | remaining,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.inner.poller.epfd, op, fd, &mut event) } != 0 {
            let errno: libc::c_int = pal::linux::errno();
            error!("update_registration(): epoll_ctl failed (fd={:?}, errno={:?})", fd, errno);
            return false;
        }
        true
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl SchedulerHooks for EpollHooks {
    fn on_thread_start(&self, _scheduler: &Scheduler) {
        if let Some(io) = self.upgrade() {
            CURRENT_IOMANAGER.with(|cell| {
                cell.replace(Some(IoManager { inner: io }));
            });
        }
    }

    fn trickle(&self, scheduler: &Scheduler) {
        // Nobody is blocked in epoll_wait; no need to interrupt anything.
        if scheduler.idle_workers() == 0 {
            return;
        }
        if let Some(io) = self.upgrade() {
            io.poller.wake();
        }
    }

    fn idle(&self, scheduler: &Scheduler) {
        match self.upgrade() {
            Some(io) => io.idle(scheduler),
            None => thread::sleep(Duration::from_millis(1)),
        }
    }

    fn stopping(&self, scheduler: &Scheduler) -> bool {
        match self.upgrade() {
            Some(io) => {
                scheduler.base_stopping()
                    && io.poller.pending_events.load(Ordering::SeqCst) == 0
                    && !io.timers.has_timer()
            },
            None => scheduler.base_stopping(),
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.trickle_fds[0]);
            libc::close(self.trickle_fds[1]);
        }
    }
}
