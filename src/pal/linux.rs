// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    mem,
    net::SocketAddrV4,
    os::unix::prelude::RawFd,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns the value of `errno` on the calling thread.
pub fn errno() -> libc::c_int {
    unsafe { *libc::__errno_location() }
}

/// Returns the OS-level id of the calling thread.
pub fn gettid() -> libc::pid_t {
    unsafe { libc::gettid() }
}

/// Sets O_NONBLOCK on `fd`. Returns 0 on success, -1 on failure with errno set.
pub fn set_nonblock(fd: RawFd) -> libc::c_int {
    let flags: libc::c_int = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return -1;
    }
    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }
}

/// Sets TCP_NODELAY on `fd`. Returns 0 on success, -1 on failure with errno set.
pub fn set_tcp_nodelay(fd: RawFd) -> libc::c_int {
    let enable: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            (&enable as *const libc::c_int) as *const libc::c_void,
            mem::size_of_val(&enable) as libc::socklen_t,
        )
    }
}

/// Checks whether `fd` refers to a socket.
pub fn is_socket(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// Converts a [std::net::SocketAddrV4] to a [libc::sockaddr_in].
pub fn socketaddrv4_to_sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: u16::to_be(addr.port()),
        #[cfg(target_endian = "big")]
        sin_addr: libc::in_addr {
            s_addr: u32::to_be(u32::from_be_bytes(addr.ip().octets())) as libc::in_addr_t,
        },
        #[cfg(target_endian = "little")]
        sin_addr: libc::in_addr {
            s_addr: u32::from_le_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    }
}

/// Converts a [libc::sockaddr_in] to a [std::net::SocketAddrV4].
pub fn sockaddr_in_to_socketaddrv4(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    let octets: [u8; 4] = {
        #[cfg(target_endian = "big")]
        {
            u32::from_be(sin.sin_addr.s_addr).to_be_bytes()
        }
        #[cfg(target_endian = "little")]
        {
            sin.sin_addr.s_addr.to_le_bytes()
        }
    };
    SocketAddrV4::new(octets.into(), u16::from_be(sin.sin_port))
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
