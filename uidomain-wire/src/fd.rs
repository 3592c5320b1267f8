//! Small helpers for fd flag manipulation, kept separate from socket construction
//! because both the listening socket and accepted/pushed channels need them.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use rustix::fs::OFlags;
use rustix::io::FdFlags;
use rustix::net::SocketAddrUnix;

/// Sets `FD_CLOEXEC` on an already-open fd. Most fds are created CLOEXEC directly
/// via `SOCK_CLOEXEC`/`accept4`; this is for the handful of paths (eventfd, epoll)
/// where the creation call takes its own cloexec flag instead.
pub fn set_cloexec(fd: BorrowedFd) -> std::io::Result<()> {
    rustix::fs::fcntl_setfd(fd, FdFlags::CLOEXEC).map_err(std::io::Error::from)
}

pub fn set_nonblock(fd: BorrowedFd) -> std::io::Result<()> {
    let current = rustix::fs::fcntl_getfl(fd).map_err(std::io::Error::from)?;
    rustix::fs::fcntl_setfl(fd, current | OFlags::NONBLOCK).map_err(std::io::Error::from)
}

/// Enables `SO_PASSCRED` so that subsequent reads on this fd carry `SCM_CREDENTIALS`
/// ancillary data describing the peer's pid/uid/gid.
///
/// rustix's sockopt surface does not cover `SO_PASSCRED`, so this drops to raw libc.
pub fn enable_passcred(fd: impl AsFd) -> std::io::Result<()> {
    let raw = fd.as_fd().as_raw_fd();
    let value: libc::c_int = 1;
    let res = unsafe {
        libc::setsockopt(
            raw,
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

pub fn unix_addr(path: &std::path::Path) -> std::io::Result<SocketAddrUnix> {
    SocketAddrUnix::new(path).map_err(std::io::Error::from)
}
