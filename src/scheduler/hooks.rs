// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::scheduler::Scheduler;
use ::crossbeam_channel::{
    bounded,
    Receiver,
    Sender,
};
use ::std::time::Duration;

//======================================================================================================================
// Constants
//======================================================================================================================

/// How long an idle worker blocks on the trickle channel before re-checking
/// the stop predicate.
const IDLE_POLL_MS: u64 = 10;

//======================================================================================================================
// Traits
//======================================================================================================================

/// Extension seams of the scheduler's worker loop. The default implementation
/// parks idle workers on a wakeup channel; the I/O manager overrides these to
/// park them in epoll_wait instead and to add its own stop conditions.
pub trait SchedulerHooks: Send + Sync + 'static {
    /// Called once on each worker thread before it enters the run loop.
    fn on_thread_start(&self, scheduler: &Scheduler) {
        let _ = scheduler;
    }

    /// Wakes a blocked worker so it notices new work immediately.
    fn trickle(&self, scheduler: &Scheduler);

    /// Parks the calling worker until work may be available. Returning yields
    /// control back to the run loop, which re-examines the pending list.
    fn idle(&self, scheduler: &Scheduler);

    /// Full stop predicate. Extensions add their own conditions on top of
    /// [Scheduler::base_stopping].
    fn stopping(&self, scheduler: &Scheduler) -> bool {
        scheduler.base_stopping()
    }
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Default hooks: a bounded rendezvous channel serves as the trickle signal.
pub(crate) struct ChannelHooks {
    tx: Sender<()>,
    rx: Receiver<()>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ChannelHooks {
    pub fn new() -> Self {
        // Capacity one: a single pending token is enough, extra trickles
        // coalesce.
        let (tx, rx): (Sender<()>, Receiver<()>) = bounded(1);
        Self { tx, rx }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl SchedulerHooks for ChannelHooks {
    fn trickle(&self, _scheduler: &Scheduler) {
        let _ = self.tx.try_send(());
    }

    fn idle(&self, _scheduler: &Scheduler) {
        let _ = self.rx.recv_timeout(Duration::from_millis(IDLE_POLL_MS));
    }
}
