// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The syscall-hook layer: blocking POSIX calls as fiber suspension points.
//!
//! The operations here mirror the blocking socket/sleep surface of libc,
//! keeping the same names, parameter order, and errno conventions (carried
//! in [crate::fail::Fail::errno]), but suspend the calling fiber instead of
//! blocking its worker thread. Rust cannot soundly interpose libc symbols for
//! arbitrary callers, so the surface is exposed as free functions; the
//! suspending ones are async and must run inside a fiber of an [IoManager].
//!
//! Interception is gated by a thread-local enable flag. When disabled, or
//! for untracked fds, non-sockets, and fds the application itself made
//! non-blocking, every wrapper degenerates to the raw call.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod fd_manager;
mod ops;

pub use self::{
    fd_manager::{
        FdCtx,
        FdManager,
        TimeoutKind,
        TIMEOUT_NONE,
    },
    ops::{
        accept,
        close,
        connect,
        connect_with_timeout,
        fcntl_getfl,
        fcntl_setfl,
        getsockopt,
        ioctl_fionbio,
        nanosleep,
        read,
        readv,
        recv,
        recvfrom,
        send,
        sendto,
        setsockopt,
        sleep,
        socket,
        usleep,
        write,
        writev,
    },
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::config;
use ::once_cell::sync::Lazy;
use ::std::{
    cell::Cell,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

thread_local! {
    /// Per-thread interception switch. Worker threads enable it on startup.
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Cached copy of the connect-timeout tunable, refreshed by a change
/// listener so hooked connect() calls never take the tunable lock.
static CONNECT_TIMEOUT_MS: Lazy<Arc<AtomicU64>> = Lazy::new(|| {
    let cached: Arc<AtomicU64> = Arc::new(AtomicU64::new(config::tcp_connect_timeout().get()));
    let cached_ref: Arc<AtomicU64> = cached.clone();
    config::tcp_connect_timeout().on_change(move |old_value, new_value| {
        info!("tcp connect timeout changed from {:?} to {:?}", old_value, new_value);
        cached_ref.store(new_value, Ordering::SeqCst);
    });
    cached
});

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Whether hooked calls intercept on the calling thread.
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|flag| flag.get())
}

/// Enables or disables interception on the calling thread.
pub fn set_hook_enable(enable: bool) {
    HOOK_ENABLED.with(|flag| flag.set(enable));
}

/// The live default timeout for hooked connect() calls, in milliseconds.
pub(crate) fn connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT_MS.load(Ordering::SeqCst)
}
