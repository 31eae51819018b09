//! A low-level library for single-threaded cooperative I/O: non-blocking
//! sockets and pipes, child processes, and a poll(2) based wait queue that
//! suspended tasks park themselves in.
//!
//! This crate is the I/O layer of a cooperative scheduler. The scheduler
//! owns its tasks and runs one at a time; whenever a task's `try_*`
//! operation reports [`Try::Retry`] the task registers itself with
//! [`when_read`], [`when_write`] or [`when_wait`] and yields. When nothing
//! is runnable the scheduler calls [`TQueue::wait`], which multiplexes
//! every registered descriptor, and child exits through a signal-safe
//! self-pipe, over one poll(2) call and hands back the batch of tasks to
//! resume.
//!
//! # Goals
//!
//! * Correct retry semantics: would-block, end-of-stream and real errors
//!   are three distinct outcomes at every call site.
//! * One wait primitive: descriptor readiness and child termination fold
//!   into the same queue.
//! * No hidden blocking: `try_*` operations never sleep.
//!
//! # Usage
//!
//! ```
//! # fn main() -> std::io::Result<()> {
//! use std::time::Duration;
//!
//! use pontus::{Socket, TQueue, Task, TaskId, Try};
//!
//! let mut queue = TQueue::new();
//! let (mut receiver, mut sender) = Socket::pipe()?;
//!
//! // Nothing to read yet: the task parks itself in the queue.
//! let reader = Task::new(&queue, TaskId(1));
//! assert_eq!(receiver.try_read(5)?, Try::Retry);
//! receiver.when_read(&reader);
//!
//! assert_eq!(sender.try_write(b"hello")?, Try::Ready(5));
//!
//! // The queue reports the reader task runnable again.
//! let ready = queue.wait(Some(Duration::from_secs(5)))?.unwrap();
//! assert_eq!(ready, vec![reader]);
//! assert_eq!(receiver.try_read(5)?, Try::Ready(Some(b"hello".to_vec())));
//! # Ok(())
//! # }
//! ```
//!
//! # Process-wide effects
//!
//! SIGPIPE is ignored for the whole process the first time a [`Socket`] or
//! [`TQueue`] is created; writes on a dead peer then fail with `EPIPE`
//! instead of killing the process. The first [`spawn`] installs a SIGCHLD
//! handler and assumes exclusive ownership of that signal from then on.
//!
//! # Undefined behaviour
//!
//! The queue, its tasks and sockets are strictly single threaded; none of
//! these types implement [`Sync`] or [`Send`] and sharing them across
//! threads will result in undefined behaviour. Unix only.
//!
//! [`when_read`]: Socket::when_read
//! [`when_write`]: Socket::when_write
//! [`when_wait`]: Process::when_wait

#![warn(anonymous_parameters,
        bare_trait_objects,
        missing_debug_implementations,
        missing_docs,
        trivial_casts,
        trivial_numeric_casts,
        unused_extern_crates,
        unused_import_braces,
        unused_qualifications,
)]

// Disallow warnings when running tests.
#![cfg_attr(test, deny(warnings))]

// Disallow warnings in examples, we want to set a good example after all.
#![doc(test(attr(deny(warnings))))]

use std::cmp;
use std::collections::HashMap;
use std::env;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod addr;
pub mod process;
pub mod queue;
pub mod socket;

mod sys;

#[doc(no_inline)]
pub use crate::process::{spawn, FdAction, Process, WaitStatus};
#[doc(no_inline)]
pub use crate::queue::{TQueue, Task, TaskId};
#[doc(no_inline)]
pub use crate::socket::{Kind, OptValue, Socket};

/// Outcome of a non-blocking operation that may have to wait.
///
/// "Would block" is not an error in a cooperative system, it is the signal
/// to suspend, so the `try_*` operations return a three-way split:
/// `Ok(Try::Ready(..))` for completion, `Ok(Try::Retry)` for "park the
/// task and try again once woken", and `Err(..)` for real failures.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Try<T> {
    /// The operation completed with this result.
    Ready(T),
    /// The operation cannot make progress yet. Park the task with the
    /// matching `when_*` method and try again once the queue reports it.
    Retry,
}

impl<T> Try<T> {
    /// Whether this is [`Try::Retry`].
    pub fn is_retry(&self) -> bool {
        match self {
            Try::Retry => true,
            Try::Ready(_) => false,
        }
    }

    /// The ready value, if there is one.
    pub fn ready(self) -> Option<T> {
        match self {
            Try::Ready(value) => Some(value),
            Try::Retry => None,
        }
    }
}

/// The current wall-clock time, as fractional seconds since the Unix
/// epoch.
pub fn gettime() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_secs_f64(),
        Err(err) => -err.duration().as_secs_f64(),
    }
}

/// A snapshot of the process environment.
///
/// Variables whose name or value is not valid UTF-8 are skipped.
pub fn environment() -> HashMap<String, String> {
    env::vars_os()
        .filter_map(|(name, value)| match (name.into_string(), value.into_string()) {
            (Ok(name), Ok(value)) => Some((name, value)),
            _ => None,
        })
        .collect()
}

/// The next open descriptor after `previous` that is not marked
/// close-on-exec, or `None` when there are no more.
///
/// Starts from descriptor 0 when `previous` is `None`. Schedulers use this
/// to enumerate what a spawned child would inherit, closing the strays
/// with [`FdAction::Close`].
pub fn next_fd(previous: Option<RawFd>) -> io::Result<Option<RawFd>> {
    let mut limit: libc::rlimit = unsafe { mem::zeroed() };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // The soft limit bounds how high descriptor numbers go; RLIM_INFINITY
    // would have us probe forever, so cap the scan.
    let max = cmp::min(limit.rlim_cur, 65_536) as RawFd;

    let mut fd = previous.map_or(0, |fd| fd + 1);
    while fd < max {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags != -1 && flags & libc::FD_CLOEXEC == 0 {
            return Ok(Some(fd));
        }
        fd += 1;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::{environment, gettime, next_fd, Try};

    #[test]
    fn gettime_advances() {
        let earlier = gettime();
        let later = gettime();
        // Sometime after 2017, and not going backwards.
        assert!(earlier > 1_500_000_000.0);
        assert!(later >= earlier);
    }

    #[test]
    fn environment_snapshot() {
        std::env::set_var("PONTUS_TEST_VAR", "set");
        let vars = environment();
        assert_eq!(vars.get("PONTUS_TEST_VAR").map(String::as_str), Some("set"));
    }

    #[test]
    fn next_fd_finds_stdio() {
        // Descriptor 0 is open and inheritable in a test run.
        assert_eq!(next_fd(None).unwrap(), Some(0));
        assert!(next_fd(Some(0)).unwrap().is_some());
    }

    #[test]
    fn try_helpers() {
        assert!(Try::<()>::Retry.is_retry());
        assert!(!Try::Ready(5).is_retry());
        assert_eq!(Try::Ready(5).ready(), Some(5));
        assert_eq!(Try::<i32>::Retry.ready(), None);
    }
}
