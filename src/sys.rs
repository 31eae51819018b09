//! Small wrappers around the libc calls shared by the socket, process and
//! queue modules.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Once;

/// Whether `err` means "try again once readiness is reported".
///
/// Covers plain would-block reads and writes (`EAGAIN`/`EWOULDBLOCK`),
/// interrupted calls (`EINTR`) and the asynchronous connect dance
/// (`EINPROGRESS`/`EALREADY`).
pub(crate) fn is_retry(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(errno) => {
            errno == libc::EAGAIN
                || errno == libc::EWOULDBLOCK
                || errno == libc::EINTR
                || errno == libc::EINPROGRESS
                || errno == libc::EALREADY
        },
        None => false,
    }
}

/// Add and/or remove file-status flags on `fd`, via the read-modify-write
/// cycle POSIX requires.
fn fcntl_mod_fl(fd: RawFd, add: libc::c_int, remove: libc::c_int) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, (flags & !remove) | add) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set or clear the `O_NONBLOCK` file-status flag on `fd`.
///
/// Non-blocking mode is a property of the open file description, not of
/// the descriptor, so this also affects descriptors duplicated from the
/// same open.
pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    if nonblocking {
        fcntl_mod_fl(fd, libc::O_NONBLOCK, 0)
    } else {
        fcntl_mod_fl(fd, 0, libc::O_NONBLOCK)
    }
}

/// Whether `O_NONBLOCK` is set on `fd`.
pub(crate) fn nonblocking(fd: RawFd) -> io::Result<bool> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(flags & libc::O_NONBLOCK != 0)
    }
}

/// Ignore SIGPIPE for the entire process, once.
///
/// The default disposition terminates the process on a write to a socket
/// the peer has closed; with SIGPIPE ignored such writes fail with `EPIPE`
/// instead. Called from every constructor that can hand out a writable
/// descriptor.
pub(crate) fn ignore_sigpipe() {
    static IGNORE: Once = Once::new();
    IGNORE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

#[cfg(test)]
mod tests {
    use super::{is_retry, nonblocking, set_nonblocking};
    use std::io;

    #[test]
    fn retry_errnos() {
        for &errno in &[libc::EAGAIN, libc::EINTR, libc::EINPROGRESS, libc::EALREADY] {
            assert!(is_retry(&io::Error::from_raw_os_error(errno)));
        }
        assert!(!is_retry(&io::Error::from_raw_os_error(libc::EPIPE)));
        assert!(!is_retry(&io::Error::new(io::ErrorKind::Other, "no errno")));
    }

    #[test]
    fn nonblocking_round_trip() {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        assert!(!nonblocking(fds[0]).unwrap());
        set_nonblocking(fds[0], true).unwrap();
        assert!(nonblocking(fds[0]).unwrap());
        set_nonblocking(fds[0], false).unwrap();
        assert!(!nonblocking(fds[0]).unwrap());

        for &fd in &fds {
            unsafe { libc::close(fd) };
        }
    }
}
