// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::socket2::{
    Domain,
    Type,
};
use ::std::{
    io::{
        Read,
        Write,
    },
    mem,
    net::{
        SocketAddr,
        SocketAddrV4,
        TcpListener,
        TcpStream,
    },
    os::unix::prelude::RawFd,
    sync::mpsc::{
        channel,
        Receiver,
        Sender,
    },
    time::{
        Duration,
        Instant,
    },
};
use ::weft::{
    hook,
    pal,
    IoManager,
};

//======================================================================================================================
// Helper Functions
//======================================================================================================================

fn local_v4(listener: &TcpListener) -> SocketAddrV4 {
    match listener.local_addr().expect("listener has an address") {
        SocketAddr::V4(addr) => addr,
        _ => unreachable!("bound to IPv4"),
    }
}

fn timeval_bytes(tv: &libc::timeval) -> &[u8] {
    unsafe { std::slice::from_raw_parts((tv as *const libc::timeval) as *const u8, mem::size_of::<libc::timeval>()) }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

/// Scenario: a hooked read on a socket with a 50ms receive timeout and no
/// incoming data fails with ETIMEDOUT in roughly 50ms, and the fd's READ
/// interest is no longer registered afterwards.
#[test]
fn hooked_read_times_out_with_etimedout() -> Result<()> {
    let listener: TcpListener = TcpListener::bind("127.0.0.1:0")?;
    let remote: SocketAddrV4 = local_v4(&listener);
    let iom: IoManager = IoManager::new(2, false, "hook-timeout").map_err(|e| anyhow::anyhow!("{:?}", e))?;

    let (tx, rx): (Sender<Result<(i32, u64), String>>, Receiver<_>) = channel();
    iom.spawn("client", async move {
        let outcome: Result<(i32, u64), String> = async {
            let fd: RawFd = hook::socket(Domain::IPV4, Type::STREAM, None).map_err(|e| e.to_string())?;
            hook::connect(fd, remote).await.map_err(|e| e.to_string())?;

            let tv: libc::timeval = libc::timeval {
                tv_sec: 0,
                tv_usec: 50_000,
            };
            hook::setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, timeval_bytes(&tv)).map_err(|e| e.to_string())?;

            let started: Instant = Instant::now();
            let mut buffer: [u8; 16] = [0; 16];
            let errno: i32 = match hook::read(fd, &mut buffer).await {
                Ok(nbytes) => return Err(format!("read returned {} bytes with no data sent", nbytes)),
                Err(e) => e.errno,
            };
            let elapsed_ms: u64 = started.elapsed().as_millis() as u64;
            hook::close(fd).map_err(|e| e.to_string())?;
            Ok((errno, elapsed_ms))
        }
        .await;
        let _ = tx.send(outcome);
    });

    let (errno, elapsed_ms): (i32, u64) = rx
        .recv_timeout(Duration::from_secs(10))?
        .map_err(|cause| anyhow::anyhow!(cause))?;
    weft::ensure_eq!(errno, libc::ETIMEDOUT);
    // 50ms plus scheduling slack.
    weft::ensure_eq!(elapsed_ms >= 40, true);
    weft::ensure_eq!(elapsed_ms < 2000, true);
    weft::ensure_eq!(iom.pending_events(), 0);

    iom.stop();
    Ok(())
}

/// End to end: a fiber connects, writes a request, suspends in read until
/// the peer answers, and sees the answer.
#[test]
fn hooked_read_wakes_up_when_data_arrives() -> Result<()> {
    let listener: TcpListener = TcpListener::bind("127.0.0.1:0")?;
    let remote: SocketAddrV4 = local_v4(&listener);
    let iom: IoManager = IoManager::new(2, false, "hook-echo").map_err(|e| anyhow::anyhow!("{:?}", e))?;

    let (tx, rx): (Sender<Result<Vec<u8>, String>>, Receiver<_>) = channel();
    iom.spawn("client", async move {
        let outcome: Result<Vec<u8>, String> = async {
            let fd: RawFd = hook::socket(Domain::IPV4, Type::STREAM, None).map_err(|e| e.to_string())?;
            hook::connect(fd, remote).await.map_err(|e| e.to_string())?;
            hook::write(fd, b"ping").await.map_err(|e| e.to_string())?;

            let mut buffer: [u8; 4] = [0; 4];
            let nbytes: usize = hook::read(fd, &mut buffer).await.map_err(|e| e.to_string())?;
            hook::close(fd).map_err(|e| e.to_string())?;
            Ok(buffer[..nbytes].to_vec())
        }
        .await;
        let _ = tx.send(outcome);
    });

    // Serve one connection: read the request, stall briefly so the fiber
    // actually suspends, then answer.
    let (mut stream, _) = listener.accept()?;
    let mut request: [u8; 4] = [0; 4];
    stream.read_exact(&mut request)?;
    assert_eq!(&request, b"ping");
    std::thread::sleep(Duration::from_millis(50));
    stream.write_all(b"pong")?;

    let answer: Vec<u8> = rx
        .recv_timeout(Duration::from_secs(10))?
        .map_err(|cause| anyhow::anyhow!(cause))?;
    weft::ensure_eq!(answer.as_slice(), b"pong".as_slice());
    weft::ensure_eq!(iom.pending_events(), 0);

    iom.stop();
    Ok(())
}

/// A hooked accept suspends until a connection arrives.
#[test]
fn hooked_accept_wakes_up_on_connection() -> Result<()> {
    let iom: IoManager = IoManager::new(2, false, "hook-accept").map_err(|e| anyhow::anyhow!("{:?}", e))?;

    let (port_tx, port_rx): (Sender<u16>, Receiver<u16>) = channel();
    let (tx, rx): (Sender<Result<SocketAddrV4, String>>, Receiver<_>) = channel();
    iom.spawn("server", async move {
        let outcome: Result<SocketAddrV4, String> = async {
            let fd: RawFd = hook::socket(Domain::IPV4, Type::STREAM, None).map_err(|e| e.to_string())?;
            let local: SocketAddrV4 = "127.0.0.1:0".parse().expect("valid address");
            let sin: libc::sockaddr_in = pal::linux::socketaddrv4_to_sockaddr_in(&local);
            if unsafe {
                libc::bind(
                    fd,
                    (&sin as *const libc::sockaddr_in) as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            } != 0
            {
                return Err("bind failed".to_string());
            }
            if unsafe { libc::listen(fd, 16) } != 0 {
                return Err("listen failed".to_string());
            }
            let mut bound: libc::sockaddr_in = unsafe { mem::zeroed() };
            let mut len: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            if unsafe {
                libc::getsockname(fd, (&mut bound as *mut libc::sockaddr_in) as *mut libc::sockaddr, &mut len)
            } != 0
            {
                return Err("getsockname failed".to_string());
            }
            let _ = port_tx.send(u16::from_be(bound.sin_port));

            let (peer_fd, peer_addr): (RawFd, SocketAddrV4) = hook::accept(fd).await.map_err(|e| e.to_string())?;
            hook::close(peer_fd).map_err(|e| e.to_string())?;
            hook::close(fd).map_err(|e| e.to_string())?;
            Ok(peer_addr)
        }
        .await;
        let _ = tx.send(outcome);
    });

    let port: u16 = port_rx.recv_timeout(Duration::from_secs(10))?;
    // Give the fiber time to suspend inside accept before connecting.
    std::thread::sleep(Duration::from_millis(50));
    let _stream: TcpStream = TcpStream::connect(("127.0.0.1", port))?;

    let peer_addr: SocketAddrV4 = rx
        .recv_timeout(Duration::from_secs(10))?
        .map_err(|cause| anyhow::anyhow!(cause))?;
    weft::ensure_eq!(*peer_addr.ip(), "127.0.0.1".parse::<std::net::Ipv4Addr>()?);

    iom.stop();
    Ok(())
}

/// A hooked sleep suspends the fiber without blocking its worker thread:
/// with a single worker, a callback scheduled mid-sleep runs before the
/// sleep finishes.
#[test]
fn hooked_sleep_does_not_block_the_worker() -> Result<()> {
    let iom: IoManager = IoManager::new(1, false, "hook-sleep").map_err(|e| anyhow::anyhow!("{:?}", e))?;

    let (tx, rx): (Sender<&'static str>, Receiver<&'static str>) = channel();
    let sleep_tx: Sender<&'static str> = tx.clone();
    iom.spawn("sleeper", async move {
        hook::usleep(300_000).await;
        let _ = sleep_tx.send("sleep-done");
    });

    // Let the fiber enter its sleep, then push a callback through the same
    // (single) worker.
    std::thread::sleep(Duration::from_millis(50));
    let callback_tx: Sender<&'static str> = tx.clone();
    iom.schedule_call(move || {
        let _ = callback_tx.send("callback");
    });

    let first: &str = rx.recv_timeout(Duration::from_secs(10))?;
    let second: &str = rx.recv_timeout(Duration::from_secs(10))?;
    weft::ensure_eq!(first, "callback");
    weft::ensure_eq!(second, "sleep-done");

    iom.stop();
    Ok(())
}

/// connect to a dead port fails with the raw socket error, not a hang.
#[test]
fn hooked_connect_reports_refused_connections() -> Result<()> {
    // Grab a port that nobody listens on.
    let dead_port: u16 = {
        let listener: TcpListener = TcpListener::bind("127.0.0.1:0")?;
        local_v4(&listener).port()
    };
    let remote: SocketAddrV4 = SocketAddrV4::new("127.0.0.1".parse()?, dead_port);
    let iom: IoManager = IoManager::new(1, false, "hook-refused").map_err(|e| anyhow::anyhow!("{:?}", e))?;

    let (tx, rx): (Sender<Result<i32, String>>, Receiver<_>) = channel();
    iom.spawn("client", async move {
        let outcome: Result<i32, String> = async {
            let fd: RawFd = hook::socket(Domain::IPV4, Type::STREAM, None).map_err(|e| e.to_string())?;
            let errno: i32 = match hook::connect(fd, remote).await {
                Ok(()) => return Err("connect to a dead port succeeded".to_string()),
                Err(e) => e.errno,
            };
            hook::close(fd).map_err(|e| e.to_string())?;
            Ok(errno)
        }
        .await;
        let _ = tx.send(outcome);
    });

    let errno: i32 = rx
        .recv_timeout(Duration::from_secs(10))?
        .map_err(|cause| anyhow::anyhow!(cause))?;
    weft::ensure_eq!(errno, libc::ECONNREFUSED);

    iom.stop();
    Ok(())
}

/// The application's blocking-mode view is kept separate from the
/// system-level non-blocking flag the hook layer forces, and a fd the user
/// made non-blocking bypasses suspension entirely.
#[test]
fn user_nonblock_bypasses_suspension() -> Result<()> {
    let listener: TcpListener = TcpListener::bind("127.0.0.1:0")?;
    let remote: SocketAddrV4 = local_v4(&listener);
    let iom: IoManager = IoManager::new(1, false, "hook-nonblock").map_err(|e| anyhow::anyhow!("{:?}", e))?;

    let (tx, rx): (Sender<Result<(bool, bool, i32, u64), String>>, Receiver<_>) = channel();
    iom.spawn("client", async move {
        let outcome: Result<(bool, bool, i32, u64), String> = async {
            let fd: RawFd = hook::socket(Domain::IPV4, Type::STREAM, None).map_err(|e| e.to_string())?;
            hook::connect(fd, remote).await.map_err(|e| e.to_string())?;

            // Fresh socket: the user never asked for non-blocking, even
            // though the fd is non-blocking at the system level.
            let flags: i32 = hook::fcntl_getfl(fd).map_err(|e| e.to_string())?;
            let user_view_blocking: bool = flags & libc::O_NONBLOCK == 0;
            let raw_flags: i32 = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            let sys_nonblocking: bool = raw_flags & libc::O_NONBLOCK != 0;

            // Once the user asks for non-blocking, a read with no data fails
            // fast with EAGAIN instead of suspending.
            hook::ioctl_fionbio(fd, true).map_err(|e| e.to_string())?;
            let started: Instant = Instant::now();
            let mut buffer: [u8; 8] = [0; 8];
            let errno: i32 = match hook::read(fd, &mut buffer).await {
                Ok(nbytes) => return Err(format!("read returned {} bytes with no data sent", nbytes)),
                Err(e) => e.errno,
            };
            let elapsed_ms: u64 = started.elapsed().as_millis() as u64;
            hook::close(fd).map_err(|e| e.to_string())?;
            Ok((user_view_blocking, sys_nonblocking, errno, elapsed_ms))
        }
        .await;
        let _ = tx.send(outcome);
    });

    let (user_view_blocking, sys_nonblocking, errno, elapsed_ms): (bool, bool, i32, u64) = rx
        .recv_timeout(Duration::from_secs(10))?
        .map_err(|cause| anyhow::anyhow!(cause))?;
    weft::ensure_eq!(user_view_blocking, true);
    weft::ensure_eq!(sys_nonblocking, true);
    weft::ensure_eq!(errno, libc::EAGAIN);
    weft::ensure_eq!(elapsed_ms < 100, true);

    iom.stop();
    Ok(())
}
