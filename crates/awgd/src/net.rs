//! Socket plumbing shared by the listeners.

use std::time::Duration;

use mio::net::TcpStream;

/// Upper bound on one poll, so every server loop re-checks the stop flag
/// at least this often. This is the accept-interruption strategy: no
/// signal games, just short non-blocking polls.
pub(crate) const POLL_CAP: Duration = Duration::from_millis(100);

/// Receive buffer hint for preload/direct clients.
pub(crate) const SOCK_RCVBUF: usize = 256 * 1024;

/// Sets kernel SO_RCVBUF on an accepted stream. Best effort; the kernel
/// clamps to its own limits.
pub(crate) fn set_rcvbuf(stream: &TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            std::ptr::from_ref(&size).cast::<libc::c_void>(),
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
