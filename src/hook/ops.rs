// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fail::Fail,
    fiber::{
        self,
        Fiber,
    },
    hook::{
        connect_timeout_ms,
        fd_manager::{
            FdManager,
            TimeoutKind,
            TIMEOUT_NONE,
        },
        is_hook_enabled,
    },
    io::{
        Event,
        IoManager,
    },
    pal,
    scheduler::Scheduler,
    timer::Timer,
};
use ::socket2::{
    Domain,
    Protocol,
    Socket,
    Type,
};
use ::std::{
    io::{
        IoSlice,
        IoSliceMut,
    },
    mem,
    net::SocketAddrV4,
    os::unix::prelude::{
        IntoRawFd,
        RawFd,
    },
    sync::{
        atomic::{
            AtomicI32,
            Ordering,
        },
        Arc,
        Weak,
    },
    thread,
    time::Duration,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Suspends the current fiber for `seconds`. The worker thread is never
/// blocked: a timer re-schedules the fiber when the delay elapses.
pub async fn sleep(seconds: u32) {
    sleep_ms(u64::from(seconds) * 1000).await
}

/// Suspends the current fiber for `microseconds`.
pub async fn usleep(microseconds: u64) {
    sleep_ms(microseconds / 1000).await
}

/// Suspends the current fiber for `duration`.
pub async fn nanosleep(duration: Duration) {
    sleep_ms(duration.as_millis() as u64).await
}

async fn sleep_ms(delay_ms: u64) {
    if !is_hook_enabled() {
        thread::sleep(Duration::from_millis(delay_ms));
        return;
    }
    let (Some(iom), Some(current)) = (IoManager::current(), Fiber::current()) else {
        // Not running inside a fiber; fall back to blocking the thread.
        thread::sleep(Duration::from_millis(delay_ms));
        return;
    };
    let scheduler: Scheduler = Scheduler::current().unwrap_or_else(|| iom.scheduler().clone());
    iom.timers().add_timer(
        delay_ms,
        move || {
            scheduler.schedule_fiber(current.clone(), None);
        },
        false,
    );
    fiber::yield_to_hold().await;
}

/// Creates a socket and registers it with the hook layer's fd table, which
/// also switches the descriptor to system-level non-blocking mode.
pub fn socket(domain: Domain, typ: Type, protocol: Option<Protocol>) -> Result<RawFd, Fail> {
    match Socket::new(domain, typ, protocol) {
        Ok(socket) => {
            let fd: RawFd = socket.into_raw_fd();
            if is_hook_enabled() {
                FdManager::global().open(fd);
            }
            Ok(fd)
        },
        Err(e) => {
            error!("socket(): failed to create socket ({:?})", e);
            Err(Fail::from(e))
        },
    }
}

/// Connects `fd` to `remote` with the process-wide default connect timeout.
pub async fn connect(fd: RawFd, remote: SocketAddrV4) -> Result<(), Fail> {
    connect_with_timeout(fd, remote, connect_timeout_ms()).await
}

/// Connects `fd` to `remote`, suspending the calling fiber while the
/// connection is in progress. A connection that neither completes nor fails
/// within `timeout_ms` fails with ETIMEDOUT.
pub async fn connect_with_timeout(fd: RawFd, remote: SocketAddrV4, timeout_ms: u64) -> Result<(), Fail> {
    let Some(ctx) = (if is_hook_enabled() { FdManager::global().get(fd) } else { None }) else {
        return raw_connect_result(fd, &remote);
    };
    if ctx.is_closed() {
        return Err(Fail::new(libc::EBADF, "connect(): file descriptor is closed"));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return raw_connect_result(fd, &remote);
    }

    match raw_connect(fd, &remote) {
        0 => return Ok(()),
        _ => {
            let errno: libc::c_int = pal::linux::errno();
            if errno != libc::EINPROGRESS {
                return Err(Fail::new(errno, "connect(): operation failed"));
            }
        },
    }

    let iom: IoManager = IoManager::current()
        .ok_or_else(|| Fail::new(libc::ENOTSUP, "connect(): not running on an I/O manager worker"))?;
    let timed_out: Arc<AtomicI32> = Arc::new(AtomicI32::new(0));
    let timer: Option<Timer> = (timeout_ms != TIMEOUT_NONE).then(|| {
        arm_timeout(&iom, fd, Event::Write, timeout_ms, &timed_out)
    });
    match iom.add_event(fd, Event::Write, None) {
        Ok(()) => {
            fiber::yield_to_hold().await;
            if let Some(timer) = &timer {
                timer.cancel();
            }
            if timed_out.load(Ordering::SeqCst) != 0 {
                return Err(Fail::timeout("connect"));
            }
        },
        Err(e) => {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            error!("connect(): cannot arm WRITE event (fd={:?}): {:?}", fd, e);
            return Err(e);
        },
    }

    // The socket's pending error decides whether the connection succeeded.
    let mut error: libc::c_int = 0;
    let mut len: libc::socklen_t = mem::size_of::<libc::c_int>() as libc::socklen_t;
    if unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut error as *mut libc::c_int) as *mut libc::c_void,
            &mut len,
        )
    } == -1
    {
        return Err(Fail::new(pal::linux::errno(), "connect(): getsockopt failed"));
    }
    if error == 0 {
        Ok(())
    } else {
        Err(Fail::new(error, "connect(): operation failed"))
    }
}

/// Accepts a connection on `fd`, suspending until one arrives (bounded by the
/// socket's receive timeout). The accepted descriptor is registered with the
/// hook layer.
pub async fn accept(fd: RawFd) -> Result<(RawFd, SocketAddrV4), Fail> {
    let mut saddr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut addrlen: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let new_fd: usize = do_io(fd, "accept", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::accept(
            fd,
            (&mut saddr as *mut libc::sockaddr_in) as *mut libc::sockaddr,
            &mut addrlen,
        ) as libc::ssize_t
    })
    .await?;
    let new_fd: RawFd = new_fd as RawFd;
    if pal::linux::set_tcp_nodelay(new_fd) != 0 {
        warn!("accept(): cannot set TCP_NODELAY (fd={:?}, errno={:?})", new_fd, pal::linux::errno());
    }
    if is_hook_enabled() {
        FdManager::global().open(new_fd);
    }
    Ok((new_fd, pal::linux::sockaddr_in_to_socketaddrv4(&saddr)))
}

/// Reads from `fd`, suspending on would-block (bounded by SO_RCVTIMEO).
pub async fn read(fd: RawFd, buffer: &mut [u8]) -> Result<usize, Fail> {
    do_io(fd, "read", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len())
    })
    .await
}

/// Scatter-read from `fd`, suspending on would-block.
pub async fn readv(fd: RawFd, buffers: &mut [IoSliceMut<'_>]) -> Result<usize, Fail> {
    do_io(fd, "readv", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, buffers.as_mut_ptr() as *mut libc::iovec, buffers.len() as libc::c_int)
    })
    .await
}

/// Receives from `fd`, suspending on would-block.
pub async fn recv(fd: RawFd, buffer: &mut [u8], flags: libc::c_int) -> Result<usize, Fail> {
    do_io(fd, "recv", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len(), flags)
    })
    .await
}

/// Receives a datagram from `fd` along with its source address.
pub async fn recvfrom(fd: RawFd, buffer: &mut [u8], flags: libc::c_int) -> Result<(usize, SocketAddrV4), Fail> {
    let mut saddr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut addrlen: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let nbytes: usize = do_io(fd, "recvfrom", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(
            fd,
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len(),
            flags,
            (&mut saddr as *mut libc::sockaddr_in) as *mut libc::sockaddr,
            &mut addrlen,
        )
    })
    .await?;
    Ok((nbytes, pal::linux::sockaddr_in_to_socketaddrv4(&saddr)))
}

/// Writes to `fd`, suspending on would-block (bounded by SO_SNDTIMEO).
pub async fn write(fd: RawFd, buffer: &[u8]) -> Result<usize, Fail> {
    do_io(fd, "write", Event::Write, TimeoutKind::Send, || unsafe {
        libc::write(fd, buffer.as_ptr() as *const libc::c_void, buffer.len())
    })
    .await
}

/// Gather-write to `fd`, suspending on would-block.
pub async fn writev(fd: RawFd, buffers: &[IoSlice<'_>]) -> Result<usize, Fail> {
    do_io(fd, "writev", Event::Write, TimeoutKind::Send, || unsafe {
        libc::writev(fd, buffers.as_ptr() as *const libc::iovec, buffers.len() as libc::c_int)
    })
    .await
}

/// Sends on `fd`, suspending on would-block.
pub async fn send(fd: RawFd, buffer: &[u8], flags: libc::c_int) -> Result<usize, Fail> {
    do_io(fd, "send", Event::Write, TimeoutKind::Send, || unsafe {
        libc::send(fd, buffer.as_ptr() as *const libc::c_void, buffer.len(), flags)
    })
    .await
}

/// Sends a datagram on `fd` to `remote`, suspending on would-block.
pub async fn sendto(fd: RawFd, buffer: &[u8], flags: libc::c_int, remote: SocketAddrV4) -> Result<usize, Fail> {
    let saddr: libc::sockaddr_in = pal::linux::socketaddrv4_to_sockaddr_in(&remote);
    do_io(fd, "sendto", Event::Write, TimeoutKind::Send, || unsafe {
        libc::sendto(
            fd,
            buffer.as_ptr() as *const libc::c_void,
            buffer.len(),
            flags,
            (&saddr as *const libc::sockaddr_in) as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })
    .await
}

/// Closes `fd`. Any armed interests are cancelled first so no waiter is left
/// stranded, and the hook layer's tracked state for the descriptor is
/// dropped.
pub fn close(fd: RawFd) -> Result<(), Fail> {
    if is_hook_enabled() && FdManager::global().get(fd).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        FdManager::global().del(fd);
    }
    if unsafe { libc::close(fd) } == 0 {
        Ok(())
    } else {
        Err(Fail::new(pal::linux::errno(), "close(): operation failed"))
    }
}

/// F_SETFL: records the application's requested blocking mode for tracked
/// sockets and keeps the descriptor non-blocking at the system level, which
/// the hook layer needs to observe would-block conditions.
pub fn fcntl_setfl(fd: RawFd, flags: libc::c_int) -> Result<(), Fail> {
    let mut flags: libc::c_int = flags;
    if let Some(ctx) = FdManager::global().get(fd) {
        if !ctx.is_closed() && ctx.is_socket() {
            ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            if ctx.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }
        }
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } == -1 {
        return Err(Fail::new(pal::linux::errno(), "fcntl(): operation failed"));
    }
    Ok(())
}

/// F_GETFL: reports the application's view of the blocking mode for tracked
/// sockets, independent of the system-level non-blocking flag.
pub fn fcntl_getfl(fd: RawFd) -> Result<libc::c_int, Fail> {
    let flags: libc::c_int = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(Fail::new(pal::linux::errno(), "fcntl(): operation failed"));
    }
    if let Some(ctx) = FdManager::global().get(fd) {
        if !ctx.is_closed() && ctx.is_socket() {
            return Ok(if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            });
        }
    }
    Ok(flags)
}

/// FIONBIO: records the application's requested blocking mode for tracked
/// sockets. The descriptor itself stays non-blocking at the system level.
pub fn ioctl_fionbio(fd: RawFd, nonblock: bool) -> Result<(), Fail> {
    let mut arg: libc::c_int = libc::c_int::from(nonblock);
    if let Some(ctx) = FdManager::global().get(fd) {
        if !ctx.is_closed() && ctx.is_socket() {
            ctx.set_user_nonblock(nonblock);
            if ctx.sys_nonblock() {
                arg = 1;
            }
        }
    }
    if unsafe { libc::ioctl(fd, libc::FIONBIO, &mut arg as *mut libc::c_int) } == -1 {
        return Err(Fail::new(pal::linux::errno(), "ioctl(): operation failed"));
    }
    Ok(())
}

/// setsockopt passthrough. SO_RCVTIMEO/SO_SNDTIMEO values are mirrored into
/// the hook layer's per-fd timeouts, where a zero timeval means "no timeout"
/// per the usual socket semantics.
pub fn setsockopt(fd: RawFd, level: libc::c_int, optname: libc::c_int, optval: &[u8]) -> Result<(), Fail> {
    if is_hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && optval.len() >= mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = FdManager::global().get(fd) {
            let tv: libc::timeval = unsafe { ::std::ptr::read_unaligned(optval.as_ptr() as *const libc::timeval) };
            let timeout_ms: u64 = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let kind: TimeoutKind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, if timeout_ms == 0 { TIMEOUT_NONE } else { timeout_ms });
        }
    }
    if unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            optval.as_ptr() as *const libc::c_void,
            optval.len() as libc::socklen_t,
        )
    } == -1
    {
        return Err(Fail::new(pal::linux::errno(), "setsockopt(): operation failed"));
    }
    Ok(())
}

/// getsockopt passthrough. Returns the length of the written option value.
pub fn getsockopt(fd: RawFd, level: libc::c_int, optname: libc::c_int, optval: &mut [u8]) -> Result<usize, Fail> {
    let mut len: libc::socklen_t = optval.len() as libc::socklen_t;
    if unsafe { libc::getsockopt(fd, level, optname, optval.as_mut_ptr() as *mut libc::c_void, &mut len) } == -1 {
        return Err(Fail::new(pal::linux::errno(), "getsockopt(): operation failed"));
    }
    Ok(len as usize)
}

/// The common shape of every hooked I/O call: try the raw call, retry EINTR
/// inline, and on would-block arm the direction's interest plus an optional
/// timeout timer, then suspend the calling fiber. Whichever of readiness and
/// timeout happens first wins; the loser becomes a no-op through the shared
/// cancellation flag and its weak guard.
async fn do_io<F>(fd: RawFd, name: &str, event: Event, timeout_kind: TimeoutKind, mut op: F) -> Result<usize, Fail>
where
    F: FnMut() -> libc::ssize_t + Send,
{
    if !is_hook_enabled() {
        return raw_io(name, op);
    }
    let Some(ctx) = FdManager::global().get(fd) else {
        return raw_io(name, op);
    };
    if ctx.is_closed() {
        return Err(Fail::new(libc::EBADF, &format!("{}(): file descriptor is closed", name)));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return raw_io(name, op);
    }

    let timeout_ms: u64 = ctx.timeout(timeout_kind);
    let timed_out: Arc<AtomicI32> = Arc::new(AtomicI32::new(0));
    loop {
        let mut n: libc::ssize_t = op();
        while n == -1 && pal::linux::errno() == libc::EINTR {
            n = op();
        }
        if n >= 0 {
            return Ok(n as usize);
        }
        let errno: libc::c_int = pal::linux::errno();
        if errno != libc::EAGAIN {
            return Err(Fail::new(errno, &format!("{}(): operation failed", name)));
        }

        trace!("do_io(): {}() would block (fd={:?})", name, fd);
        let iom: IoManager = IoManager::current()
            .ok_or_else(|| Fail::new(libc::ENOTSUP, &format!("{}(): not running on an I/O manager worker", name)))?;
        let timer: Option<Timer> =
            (timeout_ms != TIMEOUT_NONE).then(|| arm_timeout(&iom, fd, event, timeout_ms, &timed_out));
        if let Err(e) = iom.add_event(fd, event, None) {
            error!("do_io(): {}() cannot arm event (fd={:?}, event={:?}): {:?}", name, fd, event, e);
            if let Some(timer) = &timer {
                timer.cancel();
            }
            return Err(e);
        }
        fiber::yield_to_hold().await;
        if let Some(timer) = &timer {
            timer.cancel();
        }
        if timed_out.load(Ordering::SeqCst) != 0 {
            // The timeout side won the race; the event was already cancelled.
            return Err(Fail::timeout(name));
        }
        // Readiness was delivered; retry the raw call from the top.
    }
}

/// Arms the timeout side of an I/O wait: a condition timer that, if it fires
/// while the operation is still outstanding, marks it timed out and
/// force-wakes the waiter by cancelling the armed event.
fn arm_timeout(iom: &IoManager, fd: RawFd, event: Event, timeout_ms: u64, timed_out: &Arc<AtomicI32>) -> Timer {
    let flag: Weak<AtomicI32> = Arc::downgrade(timed_out);
    let iom_ref: IoManager = iom.clone();
    iom.timers().add_condition_timer(
        timeout_ms,
        move || {
            let Some(flag) = flag.upgrade() else {
                return;
            };
            if flag.swap(libc::ETIMEDOUT, Ordering::SeqCst) == 0 {
                iom_ref.cancel_event(fd, event);
            }
        },
        Arc::downgrade(timed_out),
        false,
    )
}

/// Raw passthrough with inline EINTR retry, for disabled hooks and untracked
/// or user-non-blocking descriptors.
fn raw_io<F: FnMut() -> libc::ssize_t>(name: &str, mut op: F) -> Result<usize, Fail> {
    loop {
        let n: libc::ssize_t = op();
        if n >= 0 {
            return Ok(n as usize);
        }
        let errno: libc::c_int = pal::linux::errno();
        if errno == libc::EINTR {
            continue;
        }
        return Err(Fail::new(errno, &format!("{}(): operation failed", name)));
    }
}

fn raw_connect(fd: RawFd, remote: &SocketAddrV4) -> libc::c_int {
    let saddr: libc::sockaddr_in = pal::linux::socketaddrv4_to_sockaddr_in(remote);
    unsafe {
        libc::connect(
            fd,
            (&saddr as *const libc::sockaddr_in) as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    }
}

fn raw_connect_result(fd: RawFd, remote: &SocketAddrV4) -> Result<(), Fail> {
    if raw_connect(fd, remote) == 0 {
        Ok(())
    } else {
        Err(Fail::new(pal::linux::errno(), "connect(): operation failed"))
    }
}
