// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Deadline-ordered timers.
//!
//! Timers live in a set ordered by (deadline, sequence id); the sequence id
//! breaks ties so duplicate deadlines never coalesce. The manager hands out
//! [Timer] handles for cancel/refresh/reset, collects due callbacks on
//! demand, and detects the host clock rolling backwards so timers cannot
//! stall forever. Deadlines are wall-clock milliseconds and every query takes
//! `now` explicitly, which keeps expiry deterministic under test.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::clock;
use ::parking_lot::{
    Mutex,
    RwLock,
};
use ::std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    mem,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
        Weak,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// How far backwards the clock must move before it is treated as a rollback
/// rather than ordinary jitter.
const CLOCK_ROLLOVER_SLACK_MS: u64 = 60 * 60 * 1000;

/// Sentinel for "no timer armed".
pub const NO_TIMER: u64 = u64::MAX;

//======================================================================================================================
// Types
//======================================================================================================================

/// A timer callback. Shared because recurring timers fire repeatedly.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Ordering key of a timer: deadline first, then the unique sequence id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct TimerKey {
    next_ms: u64,
    seq: u64,
}

struct TimerEntry {
    period_ms: u64,
    recurring: bool,
    callback: TimerCallback,
}

struct TimerSet {
    /// The deadline-ordered set.
    timers: BTreeMap<TimerKey, TimerEntry>,
    /// Sequence id to current deadline, so handles can find their entry after
    /// refresh/reset moved it.
    index: HashMap<u64, u64>,
    /// Front-insert already notified and not yet consumed by
    /// [TimerManager::next_timer_ms].
    tickled: bool,
    /// Last observed time, for rollback detection.
    previous_ms: u64,
}

struct TimerInner {
    set: RwLock<TimerSet>,
    /// Invoked (outside the set lock) when a new timer becomes the earliest
    /// deadline; the I/O manager uses this to interrupt a blocked epoll_wait.
    front_notify: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    next_seq: AtomicU64,
}

/// Deadline-ordered timer set.
#[derive(Clone)]
pub struct TimerManager {
    inner: Arc<TimerInner>,
}

/// Handle to an armed timer.
pub struct Timer {
    seq: u64,
    manager: Weak<TimerInner>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TimerSet {
    /// Reports whether the clock moved backwards far enough to count as a
    /// rollback, and records `now_ms` as the new reference point.
    fn detect_clock_rollover(&mut self, now_ms: u64) -> bool {
        let rollover: bool =
            now_ms < self.previous_ms && now_ms < self.previous_ms.saturating_sub(CLOCK_ROLLOVER_SLACK_MS);
        self.previous_ms = now_ms;
        rollover
    }
}

impl TimerInner {
    /// Inserts an entry and reports whether it became the new front (and the
    /// notification is not already pending). The caller fires the
    /// notification after releasing the lock.
    fn insert_locked(set: &mut TimerSet, key: TimerKey, entry: TimerEntry) -> bool {
        set.index.insert(key.seq, key.next_ms);
        set.timers.insert(key, entry);
        let at_front: bool = set.timers.keys().next() == Some(&key) && !set.tickled;
        if at_front {
            set.tickled = true;
        }
        at_front
    }

    fn notify_front(&self) {
        if let Some(notify) = self.front_notify.lock().as_ref() {
            notify();
        }
    }
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimerInner {
                set: RwLock::new(TimerSet {
                    timers: BTreeMap::new(),
                    index: HashMap::new(),
                    tickled: false,
                    previous_ms: clock::now_ms(),
                }),
                front_notify: Mutex::new(None),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Installs the front-insert notification hook.
    pub fn set_front_notify<F: Fn() + Send + Sync + 'static>(&self, notify: F) {
        *self.inner.front_notify.lock() = Some(Box::new(notify));
    }

    /// Arms a timer that fires `delay_ms` from now. Recurring timers re-arm
    /// themselves on expiry.
    pub fn add_timer<F: Fn() + Send + Sync + 'static>(&self, delay_ms: u64, callback: F, recurring: bool) -> Timer {
        self.add_timer_shared(delay_ms, Arc::new(callback), recurring)
    }

    /// Arms a timer whose callback only runs if `condition` still upgrades at
    /// fire time. Lets a suspended operation's timeout silently no-op when
    /// the operation already completed and tore down its state.
    pub fn add_condition_timer<T, F>(&self, delay_ms: u64, callback: F, condition: Weak<T>, recurring: bool) -> Timer
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        let gated: TimerCallback = Arc::new(move || {
            if condition.upgrade().is_some() {
                callback();
            }
        });
        self.add_timer_shared(delay_ms, gated, recurring)
    }

    fn add_timer_shared(&self, delay_ms: u64, callback: TimerCallback, recurring: bool) -> Timer {
        let seq: u64 = self.inner.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let key: TimerKey = TimerKey {
            next_ms: clock::now_ms() + delay_ms,
            seq,
        };
        let entry: TimerEntry = TimerEntry {
            period_ms: delay_ms,
            recurring,
            callback,
        };
        let at_front: bool = {
            let mut set = self.inner.set.write();
            TimerInner::insert_locked(&mut set, key, entry)
        };
        if at_front {
            self.inner.notify_front();
        }
        Timer {
            seq,
            manager: Arc::downgrade(&self.inner),
        }
    }

    /// Milliseconds until the earliest deadline: 0 when a timer is already
    /// due, [NO_TIMER] when none is armed. Also re-arms the front-insert
    /// notification (read-and-clear, tied to idle-loop polling).
    pub fn next_timer_ms(&self, now_ms: u64) -> u64 {
        let mut set = self.inner.set.write();
        set.tickled = false;
        match set.timers.keys().next() {
            None => NO_TIMER,
            Some(key) if now_ms >= key.next_ms => 0,
            Some(key) => key.next_ms - now_ms,
        }
    }

    /// Whether any timer is armed.
    pub fn has_timer(&self) -> bool {
        !self.inner.set.read().timers.is_empty()
    }

    /// Removes every timer due at or before `now_ms` and returns their
    /// callbacks in deadline order. Recurring timers re-arm at `now_ms` +
    /// period: a recurring timer polled late fires once and reschedules from
    /// now, it does not deliver a backlog. When the clock rolled backwards,
    /// every timer is treated as due rather than left to stall.
    pub fn list_expired(&self, now_ms: u64) -> Vec<TimerCallback> {
        let mut callbacks: Vec<TimerCallback> = Vec::new();
        let mut set = self.inner.set.write();
        if set.timers.is_empty() {
            return callbacks;
        }
        let rollover: bool = set.detect_clock_rollover(now_ms);
        if !rollover && set.timers.keys().next().expect("set is non-empty").next_ms > now_ms {
            return callbacks;
        }

        let remaining: BTreeMap<TimerKey, TimerEntry> = if rollover {
            BTreeMap::new()
        } else {
            // Everything strictly after (now_ms, max seq) stays armed.
            set.timers.split_off(&TimerKey {
                next_ms: now_ms,
                seq: u64::MAX,
            })
        };
        let expired: BTreeMap<TimerKey, TimerEntry> = mem::replace(&mut set.timers, remaining);
        callbacks.reserve(expired.len());
        for (key, entry) in expired {
            set.index.remove(&key.seq);
            if entry.recurring {
                callbacks.push(entry.callback.clone());
                let key: TimerKey = TimerKey {
                    next_ms: now_ms + entry.period_ms,
                    seq: key.seq,
                };
                set.index.insert(key.seq, key.next_ms);
                set.timers.insert(key, entry);
            } else {
                callbacks.push(entry.callback);
            }
        }
        callbacks
    }
}

impl Timer {
    /// Disarms the timer. Returns false if it already fired (one-shot), was
    /// cancelled before, or its manager is gone. Once this returns, the
    /// callback is guaranteed not to run.
    pub fn cancel(&self) -> bool {
        let Some(inner) = self.manager.upgrade() else {
            return false;
        };
        let mut set = inner.set.write();
        let Some(next_ms) = set.index.remove(&self.seq) else {
            return false;
        };
        set.timers.remove(&TimerKey {
            next_ms,
            seq: self.seq,
        });
        true
    }

    /// Re-anchors the timer's deadline at now + period.
    pub fn refresh(&self) -> bool {
        let Some(inner) = self.manager.upgrade() else {
            return false;
        };
        let mut set = inner.set.write();
        let Some(next_ms) = set.index.get(&self.seq).copied() else {
            return false;
        };
        let key: TimerKey = TimerKey {
            next_ms,
            seq: self.seq,
        };
        let entry: TimerEntry = set.timers.remove(&key).expect("index and set agree");
        let key: TimerKey = TimerKey {
            next_ms: clock::now_ms() + entry.period_ms,
            seq: self.seq,
        };
        set.index.insert(self.seq, key.next_ms);
        set.timers.insert(key, entry);
        true
    }

    /// Changes the timer's period. With `from_now` the new deadline counts
    /// from the current instant, otherwise from the original start instant.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        let Some(inner) = self.manager.upgrade() else {
            return false;
        };
        let at_front: bool = {
            let mut set = inner.set.write();
            let Some(next_ms) = set.index.get(&self.seq).copied() else {
                return false;
            };
            let key: TimerKey = TimerKey {
                next_ms,
                seq: self.seq,
            };
            let entry: &TimerEntry = set.timers.get(&key).expect("index and set agree");
            if entry.period_ms == period_ms && !from_now {
                return true;
            }
            let mut entry: TimerEntry = set.timers.remove(&key).expect("index and set agree");
            set.index.remove(&self.seq);
            let start_ms: u64 = if from_now {
                clock::now_ms()
            } else {
                next_ms - entry.period_ms
            };
            entry.period_ms = period_ms;
            let key: TimerKey = TimerKey {
                next_ms: start_ms + period_ms,
                seq: self.seq,
            };
            TimerInner::insert_locked(&mut set, key, entry)
        };
        if at_front {
            inner.notify_front();
        }
        true
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
