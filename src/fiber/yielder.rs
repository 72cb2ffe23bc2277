// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    future::Future,
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A one-shot suspension point: pending on the first poll, ready on the next.
/// Whether the fiber parks (HOLD) or re-queues (READY) depends on whether the
/// waker fires before the trampoline regains control.
struct YieldPoint {
    /// Has this point suspended already?
    yielded: bool,
    /// Wake the fiber's own waker before suspending, so the scheduler
    /// re-queues it immediately.
    wake_first: bool,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Suspends the current fiber and parks it (state HOLD). Some external actor
/// (an I/O event, a timer, an explicit schedule) must re-queue it; the next
/// resume continues right after this point.
pub async fn yield_to_hold() {
    YieldPoint {
        yielded: false,
        wake_first: false,
    }
    .await
}

/// Suspends the current fiber but leaves it runnable (state READY): it goes
/// back to the scheduler queue and continues when a worker next picks it up.
pub async fn yield_to_ready() {
    YieldPoint {
        yielded: false,
        wake_first: true,
    }
    .await
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Future for YieldPoint {
    type Output = ();

    fn poll(self: Pin<&mut Self>, context: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();
        if self_.yielded {
            return Poll::Ready(());
        }
        self_.yielded = true;
        if self_.wake_first {
            context.waker().wake_by_ref();
        }
        Poll::Pending
    }
}
