// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fiber::SharedFiber,
    io::Event,
    scheduler::{
        Callback,
        Scheduler,
    },
};
use ::parking_lot::Mutex;
use ::std::os::unix::prelude::RawFd;

//======================================================================================================================
// Structures
//======================================================================================================================

/// The resumption target armed on one direction of a file descriptor: the
/// scheduler that owns the waiter, plus either a suspended fiber or a plain
/// callback (mutually exclusive).
#[derive(Default)]
pub(crate) struct EventContext {
    pub scheduler: Option<Scheduler>,
    pub fiber: Option<SharedFiber>,
    pub callback: Option<Callback>,
}

/// Per-direction waiters and the currently armed event mask of one fd.
pub(crate) struct FdEvents {
    pub read: EventContext,
    pub write: EventContext,
    /// Bitmask of armed directions (EPOLLIN | EPOLLOUT subset).
    pub events: u32,
}

/// Per-fd bookkeeping. Entries in the I/O manager's table are reset but never
/// removed, keeping fd-indexed lookups O(1).
pub(crate) struct FdContext {
    pub fd: RawFd,
    pub state: Mutex<FdEvents>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl EventContext {
    pub fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.callback.is_none()
    }
}

impl FdEvents {
    pub fn context_mut(&mut self, event: Event) -> &mut EventContext {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }
}

impl FdContext {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: Mutex::new(FdEvents {
                read: EventContext::default(),
                write: EventContext::default(),
                events: 0,
            }),
        }
    }
}
