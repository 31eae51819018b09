//! Non-blocking sockets and pipes.
//!
//! A [`Socket`] wraps one descriptor: a TCP or UDP socket, one half of a
//! socket pair, or one end of a pipe. All descriptors are non-blocking
//! from the moment they are created, so the `try_*` operations never
//! sleep; when the kernel cannot make progress they report
//! [`Try::Retry`] and the calling task parks itself with [`when_read`] or
//! [`when_write`].
//!
//! [`when_read`]: Socket::when_read
//! [`when_write`]: Socket::when_write

use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;

use log::error;

use crate::addr;
use crate::queue::{self, Task};
use crate::sys;
use crate::Try;

/// The transport of a newly created [`Socket`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Kind {
    /// A TCP (stream) socket.
    Tcp,
    /// A UDP (datagram) socket.
    Udp,
}

/// A non-blocking descriptor: an IPv4 socket, one half of a Unix socket
/// pair, or one end of a pipe.
///
/// A `Socket` owns its descriptor exclusively and closes it when dropped,
/// or earlier via [`close`]. Constructors that start from an existing
/// descriptor ([`fdopen`], [`try_accept`]) duplicate or re-flag it so the
/// invariant holds for them too. The raw descriptor is available through
/// [`AsRawFd`] for diagnostics; it is -1 once the socket is closed.
///
/// [`close`]: Socket::close
/// [`fdopen`]: Socket::fdopen
/// [`try_accept`]: Socket::try_accept
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

/// Pointer and length of `raw` for passing to the socket calls.
#[allow(trivial_casts)]
fn raw_parts(raw: &libc::sockaddr_in) -> (*const libc::sockaddr, libc::socklen_t) {
    (raw as *const _ as *const _, size_of::<libc::sockaddr_in>() as libc::socklen_t)
}

impl Socket {
    /// Create a new IPv4 socket of the given kind.
    pub fn new(kind: Kind) -> io::Result<Socket> {
        sys::ignore_sigpipe();
        let kind = match kind {
            Kind::Tcp => libc::SOCK_STREAM,
            Kind::Udp => libc::SOCK_DGRAM,
        };
        let fd = unsafe { libc::socket(libc::AF_INET, kind, 0) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let socket = Socket { fd };
        sys::set_nonblocking(socket.fd, true)?;
        Ok(socket)
    }

    /// Create a `Socket` from an existing descriptor.
    ///
    /// The descriptor is `dup`ed so the socket owns its own copy: closing
    /// one never invalidates the other. The duplicate is put in
    /// non-blocking mode, which the original shares, as non-blocking is a
    /// property of the underlying open file description.
    pub fn fdopen(fd: RawFd) -> io::Result<Socket> {
        sys::ignore_sigpipe();
        let fd = unsafe { libc::dup(fd) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let socket = Socket { fd };
        sys::set_nonblocking(socket.fd, true)?;
        Ok(socket)
    }

    /// Create a connected pair of Unix stream sockets, both non-blocking.
    pub fn pair() -> io::Result<(Socket, Socket)> {
        Socket::new_pair(false)
    }

    /// Create a pipe, returning (read end, write end), both non-blocking.
    pub fn pipe() -> io::Result<(Socket, Socket)> {
        Socket::new_pair(true)
    }

    fn new_pair(pipe: bool) -> io::Result<(Socket, Socket)> {
        sys::ignore_sigpipe();
        let mut fds: [RawFd; 2] = [-1, -1];
        let res = if pipe {
            unsafe { libc::pipe(fds.as_mut_ptr()) }
        } else {
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) }
        };
        if res == -1 {
            return Err(io::Error::last_os_error());
        }
        let pair = (Socket { fd: fds[0] }, Socket { fd: fds[1] });
        sys::set_nonblocking(fds[0], true)?;
        sys::set_nonblocking(fds[1], true)?;
        Ok(pair)
    }

    /// Bind the socket to `address`, in the string form [`addr::parse`]
    /// accepts.
    ///
    /// [`addr::parse`]: crate::addr::parse
    pub fn bind(&mut self, address: &str) -> io::Result<()> {
        let raw = addr::to_raw(addr::parse(address)?);
        let (raw, len) = raw_parts(&raw);
        if unsafe { libc::bind(self.fd, raw, len) } == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Mark the socket as passive, ready for [`try_accept`]. Callers
    /// without an opinion on `backlog` commonly pass 10.
    ///
    /// [`try_accept`]: Socket::try_accept
    pub fn listen(&mut self, backlog: u32) -> io::Result<()> {
        if unsafe { libc::listen(self.fd, backlog as libc::c_int) } == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Start or continue connecting to `address`.
    ///
    /// A non-blocking connect rarely completes on the first call: the
    /// kernel reports `EINPROGRESS` (or `EALREADY` on later calls) while
    /// the handshake runs, which surfaces here as [`Try::Retry`]; park the
    /// task with [`when_write`] and call again once woken. A call on an
    /// already connected socket (`EISCONN`) reports success.
    ///
    /// [`when_write`]: Socket::when_write
    pub fn try_connect(&mut self, address: &str) -> io::Result<Try<()>> {
        let raw = addr::to_raw(addr::parse(address)?);
        let (raw, len) = raw_parts(&raw);
        if unsafe { libc::connect(self.fd, raw, len) } == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EISCONN) {
                Ok(Try::Ready(()))
            } else if sys::is_retry(&err) {
                Ok(Try::Retry)
            } else {
                Err(err)
            }
        } else {
            Ok(Try::Ready(()))
        }
    }

    /// Accept a pending connection.
    ///
    /// The accepted socket is forced into non-blocking mode; the kernel
    /// does not reliably carry the flag over from the listener.
    pub fn try_accept(&mut self) -> io::Result<Try<Socket>> {
        let fd = unsafe { libc::accept(self.fd, ptr::null_mut(), ptr::null_mut()) };
        if fd == -1 {
            let err = io::Error::last_os_error();
            return if sys::is_retry(&err) { Ok(Try::Retry) } else { Err(err) };
        }
        let socket = Socket { fd };
        sys::set_nonblocking(socket.fd, true)?;
        Ok(Try::Ready(socket))
    }

    /// Read up to `size` bytes.
    ///
    /// `Ready(Some(bytes))` may hold fewer bytes than requested.
    /// `Ready(None)` means the peer shut down its writing half: end of
    /// stream, distinct from both errors and [`Try::Retry`]. A `size` of
    /// zero returns an empty buffer without touching the descriptor, as a
    /// zero-length read is not a portable way to probe a socket.
    pub fn try_read(&mut self, size: usize) -> io::Result<Try<Option<Vec<u8>>>> {
        if size == 0 {
            return Ok(Try::Ready(Some(Vec::new())));
        }
        let mut buf = vec![0; size];
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, size) };
        match n {
            -1 => {
                let err = io::Error::last_os_error();
                if sys::is_retry(&err) { Ok(Try::Retry) } else { Err(err) }
            },
            0 => Ok(Try::Ready(None)),
            n => {
                buf.truncate(n as usize);
                Ok(Try::Ready(Some(buf)))
            },
        }
    }

    /// Write as much of `data` as the kernel will take, returning the
    /// number of bytes written, possibly fewer than `data.len()`.
    ///
    /// A write on a socket whose peer has gone away fails with `EPIPE`
    /// rather than raising SIGPIPE; see the crate documentation.
    pub fn try_write(&mut self, data: &[u8]) -> io::Result<Try<usize>> {
        let n = unsafe { libc::write(self.fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if n == -1 {
            let err = io::Error::last_os_error();
            if sys::is_retry(&err) { Ok(Try::Retry) } else { Err(err) }
        } else {
            Ok(Try::Ready(n as usize))
        }
    }

    /// Half- or full-close the socket.
    ///
    /// `Shutdown::Both` uses the platform's combined flag; it is not the
    /// bitwise or of the two halves.
    pub fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        if unsafe { libc::shutdown(self.fd, how) } == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Close the descriptor now instead of waiting for the drop.
    ///
    /// Closing an already closed socket reports an error.
    pub fn close(&mut self) -> io::Result<()> {
        if self.fd == -1 {
            return Err(io::Error::new(io::ErrorKind::Other, "socket already closed"));
        }
        let fd = mem::replace(&mut self.fd, -1);
        if unsafe { libc::close(fd) } == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// The local address the socket is bound to.
    pub fn getsockname(&self) -> io::Result<SocketAddrV4> {
        self.name(|fd, raw, len| unsafe { libc::getsockname(fd, raw, len) })
    }

    /// The address of the connected peer.
    pub fn getpeername(&self) -> io::Result<SocketAddrV4> {
        self.name(|fd, raw, len| unsafe { libc::getpeername(fd, raw, len) })
    }

    #[allow(trivial_casts)]
    fn name<F>(&self, get: F) -> io::Result<SocketAddrV4>
        where F: FnOnce(RawFd, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
    {
        let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
        if get(self.fd, &mut raw as *mut _ as *mut _, &mut len) == -1 {
            Err(io::Error::last_os_error())
        } else {
            addr::from_raw(&raw)
        }
    }

    /// Read a socket option by name.
    ///
    /// Only a small whitelist is supported: `TCP_NODELAY`, `SO_KEEPALIVE`,
    /// `SO_REUSEADDR` and `O_NONBLOCK` as booleans, `SO_RCVBUF` and
    /// `SO_SNDBUF` as sizes. `O_NONBLOCK` is a file-status flag rather
    /// than a real socket option and goes through fcntl. Any other name
    /// is rejected.
    #[allow(trivial_casts)]
    pub fn getsockopt(&self, name: &str) -> io::Result<OptValue> {
        let opt = find_option(name)?;
        let value = match opt.target {
            OptTarget::Sock { level, name } => {
                let mut value: libc::c_int = 0;
                let mut len = size_of::<libc::c_int>() as libc::socklen_t;
                let res = unsafe {
                    libc::getsockopt(self.fd, level, name,
                        &mut value as *mut _ as *mut libc::c_void, &mut len)
                };
                if res == -1 {
                    return Err(io::Error::last_os_error());
                }
                value
            },
            OptTarget::FileStatus => sys::nonblocking(self.fd)? as libc::c_int,
        };
        Ok(match opt.kind {
            OptKind::Bool => OptValue::Bool(value != 0),
            OptKind::Size => OptValue::Size(value as u32),
        })
    }

    /// Set a socket option by name; see [`getsockopt`] for the whitelist.
    ///
    /// The value variant must match the option: booleans for the flag
    /// options, sizes for the buffer sizes.
    ///
    /// [`getsockopt`]: Socket::getsockopt
    #[allow(trivial_casts)]
    pub fn setsockopt(&mut self, name: &str, value: OptValue) -> io::Result<()> {
        let opt = find_option(name)?;
        let value = match (&opt.kind, value) {
            (OptKind::Bool, OptValue::Bool(on)) => on as libc::c_int,
            (OptKind::Size, OptValue::Size(size)) => size as libc::c_int,
            (OptKind::Bool, _) => return Err(mismatch(name, "a boolean")),
            (OptKind::Size, _) => return Err(mismatch(name, "a size")),
        };
        match opt.target {
            OptTarget::Sock { level, name } => {
                let res = unsafe {
                    libc::setsockopt(self.fd, level, name,
                        &value as *const _ as *const libc::c_void,
                        size_of::<libc::c_int>() as libc::socklen_t)
                };
                if res == -1 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            },
            OptTarget::FileStatus => sys::set_nonblocking(self.fd, value != 0),
        }
    }

    /// Register `task` to be woken by its queue when this socket becomes
    /// readable.
    ///
    /// # Panics
    ///
    /// Panics if `task` is already scheduled, or another task is already
    /// waiting for this descriptor to become readable.
    pub fn when_read(&self, task: &Task) {
        queue::enqueue_read(task, self.fd);
    }

    /// Register `task` to be woken by its queue when this socket becomes
    /// writable.
    ///
    /// # Panics
    ///
    /// Panics if `task` is already scheduled, or another task is already
    /// waiting for this descriptor to become writable.
    pub fn when_write(&self, task: &Task) {
        queue::enqueue_write(task, self.fd);
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.fd != -1 && unsafe { libc::close(self.fd) } == -1 {
            let err = io::Error::last_os_error();
            error!("error closing socket: {}", err);
        }
    }
}

/// Value of a socket option.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OptValue {
    /// An on/off option.
    Bool(bool),
    /// A non-negative size, e.g. a buffer size in bytes.
    Size(u32),
}

enum OptKind {
    Bool,
    Size,
}

enum OptTarget {
    /// A regular option for getsockopt/setsockopt.
    Sock { level: libc::c_int, name: libc::c_int },
    /// The `O_NONBLOCK` file-status flag, manipulated through fcntl.
    FileStatus,
}

struct SockOpt {
    name: &'static str,
    kind: OptKind,
    target: OptTarget,
}

static OPTIONS: [SockOpt; 6] = [
    SockOpt {
        name: "TCP_NODELAY",
        kind: OptKind::Bool,
        target: OptTarget::Sock { level: libc::IPPROTO_TCP, name: libc::TCP_NODELAY },
    },
    SockOpt {
        name: "SO_KEEPALIVE",
        kind: OptKind::Bool,
        target: OptTarget::Sock { level: libc::SOL_SOCKET, name: libc::SO_KEEPALIVE },
    },
    SockOpt {
        name: "SO_REUSEADDR",
        kind: OptKind::Bool,
        target: OptTarget::Sock { level: libc::SOL_SOCKET, name: libc::SO_REUSEADDR },
    },
    SockOpt {
        name: "SO_RCVBUF",
        kind: OptKind::Size,
        target: OptTarget::Sock { level: libc::SOL_SOCKET, name: libc::SO_RCVBUF },
    },
    SockOpt {
        name: "SO_SNDBUF",
        kind: OptKind::Size,
        target: OptTarget::Sock { level: libc::SOL_SOCKET, name: libc::SO_SNDBUF },
    },
    SockOpt {
        name: "O_NONBLOCK",
        kind: OptKind::Bool,
        target: OptTarget::FileStatus,
    },
];

fn find_option(name: &str) -> io::Result<&'static SockOpt> {
    OPTIONS.iter().find(|opt| opt.name == name).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput,
            format!("unknown socket option {:?}", name))
    })
}

fn mismatch(name: &str, expected: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput,
        format!("socket option {} takes {}", name, expected))
}
