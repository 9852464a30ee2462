//! Raw, type-erased file descriptor primitives shared by the reactor.
//!
//! Every operation here mirrors a single libc call and translates its
//! result into `io::Result`, exactly like the `accept`/`read`/`write` calls
//! at the bottom of `PollMessageEngine::async_*_impl` in the original
//! implementation this crate is descended from: try the syscall, let errno
//! become an `io::Error`, and let the caller decide what "would block"
//! means.

use std::io;
use std::os::unix::io::RawFd;

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    syscall(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    syscall(n).map(|n| n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    syscall(n).map(|n| n as usize)
}

/// Accepts a pending connection on `fd` and puts the new descriptor in
/// non-blocking mode before handing it back, matching how the original
/// immediately calls `setNonBlocking` on every socket it creates or
/// accepts.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let newfd = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
    let newfd = syscall(newfd as i64)? as RawFd;
    set_nonblocking(newfd)?;
    Ok(newfd)
}

fn syscall(result: i64) -> io::Result<i64> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

pub fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}
