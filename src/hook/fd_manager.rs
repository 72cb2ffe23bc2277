// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::pal;
use ::once_cell::sync::Lazy;
use ::parking_lot::RwLock;
use ::std::{
    os::unix::prelude::RawFd,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Initial size of the fd table.
const INITIAL_FDS: usize = 64;

/// Sentinel for "no timeout configured".
pub const TIMEOUT_NONE: u64 = u64::MAX;

//======================================================================================================================
// Static Variables
//======================================================================================================================

static FD_MANAGER: Lazy<FdManager> = Lazy::new(FdManager::new);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Which configured timeout applies to a hooked operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimeoutKind {
    /// SO_RCVTIMEO: read-direction operations.
    Recv,
    /// SO_SNDTIMEO: write-direction operations.
    Send,
}

/// Hook-layer bookkeeping for one tracked file descriptor. Tracked sockets
/// are always non-blocking at the system level so would-block conditions are
/// observable; `user_nonblock` records what the application asked for.
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

/// Process-wide, fd-indexed table of [FdCtx] entries.
pub struct FdManager {
    fds: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl FdCtx {
    fn new(fd: RawFd) -> Self {
        let is_socket: bool = pal::linux::is_socket(fd);
        let mut sys_nonblock: bool = false;
        if is_socket {
            if pal::linux::set_nonblock(fd) == 0 {
                sys_nonblock = true;
            } else {
                warn!("FdCtx::new(): cannot set O_NONBLOCK (fd={:?}, errno={:?})", fd, pal::linux::errno());
            }
        }
        Self {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(TIMEOUT_NONE),
            send_timeout_ms: AtomicU64::new(TIMEOUT_NONE),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, nonblock: bool) {
        self.user_nonblock.store(nonblock, Ordering::Release);
    }

    /// The configured timeout for `kind`, or [TIMEOUT_NONE].
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, timeout_ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(timeout_ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(timeout_ms, Ordering::Release),
        }
    }
}

impl FdManager {
    fn new() -> Self {
        let mut fds: Vec<Option<Arc<FdCtx>>> = Vec::new();
        fds.resize_with(INITIAL_FDS, || None);
        Self { fds: RwLock::new(fds) }
    }

    /// The process-wide instance.
    pub fn global() -> &'static FdManager {
        &FD_MANAGER
    }

    /// Returns the context tracked for `fd`, if any.
    pub fn get(&self, fd: RawFd) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        self.fds.read().get(fd as usize).cloned().flatten()
    }

    /// Returns the context for `fd`, creating and registering one if needed.
    pub fn open(&self, fd: RawFd) -> Arc<FdCtx> {
        assert!(fd >= 0, "invalid file descriptor: {:?}", fd);
        if let Some(ctx) = self.get(fd) {
            return ctx;
        }
        let mut fds = self.fds.write();
        if fds.len() <= fd as usize {
            let new_size: usize = ::std::cmp::max(fds.len() * 3 / 2, fd as usize + 1);
            fds.resize_with(new_size, || None);
        }
        fds[fd as usize]
            .get_or_insert_with(|| Arc::new(FdCtx::new(fd)))
            .clone()
    }

    /// Drops the context tracked for `fd`.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        if let Some(slot) = self.fds.write().get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.set_closed();
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
