// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::fiber::SharedFiber;

//======================================================================================================================
// Types
//======================================================================================================================

/// OS-level thread identifier, used for thread-affinity hints.
pub type Tid = libc::pid_t;

/// A plain callback scheduled for one-shot execution.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A schedulable unit: either an existing fiber to resume, or a plain
/// callback that a worker wraps in its scratch fiber.
pub enum Runnable {
    Fiber(SharedFiber),
    Callback(Callback),
}

/// A pending-list entry: the runnable plus its thread-affinity hint
/// (`None` = any worker, `Some(tid)` = that OS thread only).
pub(crate) struct ScheduleEntry {
    pub runnable: Runnable,
    pub thread: Option<Tid>,
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<SharedFiber> for Runnable {
    fn from(fiber: SharedFiber) -> Self {
        Runnable::Fiber(fiber)
    }
}

impl From<Callback> for Runnable {
    fn from(callback: Callback) -> Self {
        Runnable::Callback(callback)
    }
}
