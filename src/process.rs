//! Child processes: spawning, exit reaping and process handles.
//!
//! Exit notification works through a process-wide self-pipe. A `SIGCHLD`
//! handler writes one byte to the pipe; the wait queue polls the read end
//! whenever a task waits on a child, and whoever sees it readable drains
//! the pipe and reaps every exited child in one `waitpid` sweep. The
//! handler itself performs nothing but an async-signal-safe `write` on a
//! descriptor opened in advance; all bookkeeping runs in the event loop.
//!
//! Because the handler and `waitpid(-1, ..)` are process-wide, reaping is
//! too: every spawned child is linked into one registry, and a queue that
//! consumes the pipe updates processes that other queues are waiting on.
//! Queues therefore re-check their child waiters on every wait.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, Weak};

use log::{error, trace};

use crate::queue::{self, Task};
use crate::sys;
use crate::Try;

/// What happens to a parent descriptor in a spawned child.
///
/// Actions are applied in order, between fork and exec. Descriptors handed
/// to the child get their non-blocking flag cleared: the child expects
/// ordinary blocking stdio, and non-blocking mode lives on the open file
/// description the parent still shares.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FdAction {
    /// Leave `fd` open for the child as-is, clearing non-blocking mode.
    Inherit(RawFd),
    /// `dup2(from, to)`: the child sees `from`'s open file as descriptor
    /// `to`, with non-blocking mode cleared.
    Dup {
        /// Descriptor number the child will use.
        to: RawFd,
        /// Parent descriptor to duplicate.
        from: RawFd,
    },
    /// Close `fd` in the child.
    Close(RawFd),
}

/// How a reaped child terminated.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitStatus {
    /// Normal exit with the given code.
    Exited(i32),
    /// Terminated by the given signal.
    Signaled(i32),
}

/// Shared record of one spawned child. The `Process` handle, the child
/// waiter tables and the registry all point at the same record.
#[derive(Debug)]
pub(crate) struct ProcessInner {
    /// Key in the child-waiter tables.
    id: u64,
    /// The child's PID while running; 0 once reaped.
    pid: AtomicI32,
    /// Raw wait status, meaningful once `pid` is 0.
    status: AtomicI32,
}

impl ProcessInner {
    pub(crate) fn key(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_exited(&self) -> bool {
        self.pid.load(Ordering::SeqCst) == 0
    }
}

impl Drop for ProcessInner {
    fn drop(&mut self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid > 0 {
            trace!("killing abandoned child: pid={}", pid);
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
        let this: *const ProcessInner = self;
        registry().retain(|process| process.as_ptr() != this);
    }
}

/// Every live child, weakly referenced so a record disappears with its
/// last handle. The reaper matches `waitpid` results against this list.
static REGISTRY: Mutex<Vec<Weak<ProcessInner>>> = Mutex::new(Vec::new());

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// The self-pipe. Atomics, not a lock: the signal handler loads the write
/// end and nothing else.
static PIPE_READ: AtomicI32 = AtomicI32::new(-1);
static PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

fn registry() -> MutexGuard<'static, Vec<Weak<ProcessInner>>> {
    match REGISTRY.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno()
}

/// The `SIGCHLD` handler: one async-signal-safe `write` on the
/// pre-existing pipe, with errno preserved for whatever code it
/// interrupted.
extern "C" fn sigchld_handler(_signal: libc::c_int) {
    let fd = PIPE_WRITE.load(Ordering::Relaxed);
    if fd == -1 {
        return;
    }
    unsafe {
        let saved_errno = *errno_location();
        loop {
            let n = libc::write(fd, b"\x01".as_ptr() as *const libc::c_void, 1);
            if n != -1 || *errno_location() != libc::EINTR {
                break;
            }
        }
        *errno_location() = saved_errno;
    }
}

/// Create the pipe and install the handler, once per process. Runs before
/// the first fork, so an early exit can never race the installation.
fn init_reaper() -> io::Result<()> {
    static INIT: Once = Once::new();
    static INSTALLED: AtomicBool = AtomicBool::new(false);

    INIT.call_once(|| match install_reaper() {
        Ok(()) => INSTALLED.store(true, Ordering::SeqCst),
        Err(err) => error!("failed to set up child-exit notification: {}", err),
    });
    if INSTALLED.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::Other, "child-exit notification unavailable"))
    }
}

fn install_reaper() -> io::Result<()> {
    let mut fds: [RawFd; 2] = [-1, -1];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    sys::set_nonblocking(fds[0], true)?;
    PIPE_READ.store(fds[0], Ordering::SeqCst);
    PIPE_WRITE.store(fds[1], Ordering::SeqCst);

    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = sigchld_handler;
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGCHLD, &action, ptr::null_mut()) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Read end of the self-pipe, for the wait queue's poll set. Only valid
/// once a child has been spawned, which is the only way a child waiter
/// can exist.
pub(crate) fn sig_pipe() -> RawFd {
    PIPE_READ.load(Ordering::SeqCst)
}

/// Drain the self-pipe and reap every exited child of this process.
///
/// Returns the number of process records updated. Zero bytes in the pipe
/// means another queue got here first; nothing is done then, and the
/// caller's own child sweep picks up whatever that queue reaped.
pub(crate) fn reap() -> usize {
    let fd = PIPE_READ.load(Ordering::SeqCst);
    if fd == -1 {
        return 0;
    }

    let mut buf = [0u8; 32];
    let mut received = false;
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            received = true;
        }
        if n != buf.len() as isize {
            break;
        }
    }
    if !received {
        return 0;
    }

    // Snapshot the registry. Updating records must not happen under the
    // lock: a record dropped mid-sweep takes it again to unlink itself.
    let processes: Vec<Weak<ProcessInner>> = registry().clone();

    let mut updated = 0;
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid > 0 {
            trace!("reaped child: pid={}, status={:#x}", pid, status);
            for process in &processes {
                if let Some(process) = process.upgrade() {
                    if process.pid.load(Ordering::SeqCst) == pid {
                        process.status.store(status, Ordering::SeqCst);
                        process.pid.store(0, Ordering::SeqCst);
                        updated += 1;
                        break;
                    }
                }
            }
            continue;
        }
        // POSIX does not clearly rule out EINTR even with WNOHANG.
        if pid == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        break;
    }
    updated
}

fn cstring(s: &str) -> io::Result<CString> {
    CString::new(s).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "string contains a nul byte")
    })
}

fn cstrings(strings: &[&str]) -> io::Result<Vec<CString>> {
    strings.iter().map(|s| cstring(s)).collect()
}

/// Null-terminated pointer array over `strings`; valid while `strings` is.
fn pointer_array(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings.iter().map(|s| s.as_ptr()).chain(Some(ptr::null())).collect()
}

/// Runs in the forked child: only async-signal-safe calls from here on,
/// everything was allocated before the fork.
fn child_after_fork(
    path: &CString,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    actions: &[FdAction],
) -> ! {
    unsafe {
        let mut mask: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut mask);
        if libc::sigprocmask(libc::SIG_SETMASK, &mask, ptr::null_mut()) == -1 {
            libc::_exit(127);
        }

        for action in actions {
            match *action {
                FdAction::Inherit(fd) => {
                    let _ = sys::set_nonblocking(fd, false);
                },
                FdAction::Dup { to, from } => {
                    if from != to {
                        libc::dup2(from, to);
                    }
                    let _ = sys::set_nonblocking(to, false);
                },
                FdAction::Close(fd) => {
                    libc::close(fd);
                },
            }
        }

        libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr());
        libc::_exit(127)
    }
}

/// Spawn `path` with the given argument and environment strings.
///
/// `args` becomes the child's argv (`args[0]` is conventionally the
/// program name), `env` its environment as `NAME=VALUE` strings, both
/// passed verbatim to `execve` (no PATH search). `actions` describe what
/// happens to descriptors in the child, in order; descriptors not covered
/// stay inherited, so callers wanting a tight set close the strays
/// explicitly (see [`next_fd`]).
///
/// The child resets its signal mask to empty, applies the actions and
/// execs. If the exec fails the child exits with code 127.
///
/// [`next_fd`]: crate::next_fd
pub fn spawn(path: &str, args: &[&str], env: &[&str], actions: &[FdAction]) -> io::Result<Process> {
    init_reaper()?;

    let path = cstring(path)?;
    let args = cstrings(args)?;
    let env = cstrings(env)?;
    let argv = pointer_array(&args);
    let envp = pointer_array(&env);

    let pid = unsafe { libc::fork() };
    if pid == -1 {
        return Err(io::Error::last_os_error());
    }
    if pid == 0 {
        child_after_fork(&path, &argv, &envp, actions);
    }

    trace!("spawned child: path={:?}, pid={}", path, pid);

    let inner = Arc::new(ProcessInner {
        id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        pid: AtomicI32::new(pid),
        status: AtomicI32::new(0),
    });
    registry().push(Arc::downgrade(&inner));
    Ok(Process { inner })
}

/// A spawned child process.
///
/// The handle is unique. When the last reference to the child's record
/// drops (the handle, plus any pending child waiter holding it), a still
/// running child is killed with SIGKILL and the record leaves the
/// registry, so an abandoned child cannot linger unnoticed.
#[derive(Debug)]
pub struct Process {
    inner: Arc<ProcessInner>,
}

impl Process {
    /// The OS process id while the child is running, `None` once it has
    /// been reaped.
    pub fn id(&self) -> Option<u32> {
        match self.inner.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid as u32),
        }
    }

    /// Send SIGKILL to the child.
    ///
    /// Fails if the child already exited and was reaped.
    pub fn kill(&self) -> io::Result<()> {
        let pid = self.inner.pid.load(Ordering::SeqCst);
        if pid <= 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "process not running"));
        }
        if unsafe { libc::kill(pid, libc::SIGKILL) } == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// The child's exit disposition, or [`Try::Retry`] while it is still
    /// running or has exited but not yet been reaped.
    pub fn try_wait(&self) -> Try<WaitStatus> {
        if !self.inner.is_exited() {
            return Try::Retry;
        }
        let status = self.inner.status.load(Ordering::SeqCst);
        if libc::WIFEXITED(status) {
            Try::Ready(WaitStatus::Exited(libc::WEXITSTATUS(status)))
        } else if libc::WIFSIGNALED(status) {
            Try::Ready(WaitStatus::Signaled(libc::WTERMSIG(status)))
        } else {
            Try::Retry
        }
    }

    /// Register `task` to be woken by its queue when the child exits.
    ///
    /// # Panics
    ///
    /// Panics if `task` is already scheduled, or another task is already
    /// waiting on this process.
    pub fn when_wait(&self, task: &Task) {
        queue::enqueue_child(task, Arc::clone(&self.inner));
    }
}
