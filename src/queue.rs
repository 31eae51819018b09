//! The wait queue: task handles, waiter tables and the poll(2) loop.
//!
//! A [`TQueue`] is the reactor a cooperative scheduler parks its tasks in.
//! Three tables record what each suspended task waits on (a readable
//! descriptor, a writable descriptor, or a child process), and
//! [`TQueue::wait`] folds all of them, plus the child-exit self-pipe, into
//! a single poll(2) call. The batch it returns are tasks whose condition
//! fired, already removed from their tables; the scheduler resumes each of
//! them exactly once.
//!
//! Registration happens from the resource side: [`Socket::when_read`],
//! [`Socket::when_write`] and [`Process::when_wait`] file a task here
//! under the descriptor or process it blocks on. A task waits on at most
//! one condition at a time, and each condition carries at most one task;
//! violating either is a bug in the scheduler and panics.
//!
//! [`Socket::when_read`]: crate::Socket::when_read
//! [`Socket::when_write`]: crate::Socket::when_write
//! [`Process::when_wait`]: crate::Process::when_wait

use std::cell::{Cell, RefCell};
use std::cmp;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::process::{self, ProcessInner};
use crate::sys;

/// Associates a [`Task`] with whatever bookkeeping the host scheduler
/// keeps for it.
///
/// The queue never interprets the id; it only travels with the task so the
/// scheduler can map a woken task back to its own state.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(pub usize);

impl From<usize> for TaskId {
    fn from(id: usize) -> TaskId {
        TaskId(id)
    }
}

impl From<TaskId> for usize {
    fn from(id: TaskId) -> usize {
        id.0
    }
}

/// What a scheduled task is waiting on; doubles as the key under which the
/// task is filed in its queue's tables.
#[derive(Copy, Clone, Debug)]
enum Wait {
    Read(RawFd),
    Write(RawFd),
    Child(u64),
}

#[derive(Debug)]
struct TaskInner {
    id: TaskId,
    queue: Weak<RefCell<Waiters>>,
    waiting: Cell<Option<Wait>>,
}

/// A cooperative unit of work, as seen by its wait queue.
///
/// Tasks are created against the queue they will always wait on, and are
/// cheap handles: clones share the registration state. Two handles compare
/// equal when they come from the same [`Task::new`] call.
#[derive(Clone, Debug)]
pub struct Task {
    inner: Rc<TaskInner>,
}

impl Task {
    /// Create a task that will wait on `queue`.
    pub fn new(queue: &TQueue, id: TaskId) -> Task {
        Task {
            inner: Rc::new(TaskInner {
                id,
                queue: Rc::downgrade(&queue.waiters),
                waiting: Cell::new(None),
            }),
        }
    }

    /// The id this task was created with.
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Whether the task is currently filed in one of its queue's waiter
    /// tables.
    pub fn is_scheduled(&self) -> bool {
        self.inner.waiting.get().is_some()
    }

    /// Remove the task from whichever waiter table holds it.
    ///
    /// This is the cancellation hook: safe to call at any time, a no-op
    /// when the task is not scheduled.
    pub fn dequeue(&self) {
        let wait = match self.inner.waiting.take() {
            Some(wait) => wait,
            None => return,
        };
        let waiters = match self.inner.queue.upgrade() {
            Some(waiters) => waiters,
            None => return,
        };
        trace!("cancelling task: id={:?}", self.inner.id);
        let mut tables = waiters.borrow_mut();
        match wait {
            Wait::Read(fd) => {
                tables.readers.remove(&fd);
            },
            Wait::Write(fd) => {
                tables.writers.remove(&fd);
            },
            Wait::Child(key) => {
                tables.children.remove(&key);
            },
        }
    }

    /// Mark the task as no longer scheduled, after its table entry has
    /// been removed.
    fn clear(&self) {
        self.inner.waiting.set(None);
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Task) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Task {}

#[derive(Default)]
struct Waiters {
    readers: HashMap<RawFd, Task>,
    writers: HashMap<RawFd, Task>,
    children: HashMap<u64, (Arc<ProcessInner>, Task)>,
}

fn waiters_of(task: &Task) -> Rc<RefCell<Waiters>> {
    task.inner.queue.upgrade().expect("task outlived its queue")
}

pub(crate) fn enqueue_read(task: &Task, fd: RawFd) {
    trace!("registering reader: fd={}, task={:?}", fd, task.id());
    assert!(!task.is_scheduled(), "task is already scheduled");
    let waiters = waiters_of(task);
    let mut tables = waiters.borrow_mut();
    assert!(!tables.readers.contains_key(&fd),
        "a task is already waiting for fd {} to become readable", fd);
    tables.readers.insert(fd, task.clone());
    task.inner.waiting.set(Some(Wait::Read(fd)));
}

pub(crate) fn enqueue_write(task: &Task, fd: RawFd) {
    trace!("registering writer: fd={}, task={:?}", fd, task.id());
    assert!(!task.is_scheduled(), "task is already scheduled");
    let waiters = waiters_of(task);
    let mut tables = waiters.borrow_mut();
    assert!(!tables.writers.contains_key(&fd),
        "a task is already waiting for fd {} to become writable", fd);
    tables.writers.insert(fd, task.clone());
    task.inner.waiting.set(Some(Wait::Write(fd)));
}

pub(crate) fn enqueue_child(task: &Task, process: Arc<ProcessInner>) {
    trace!("registering child waiter: task={:?}", task.id());
    assert!(!task.is_scheduled(), "task is already scheduled");
    let key = process.key();
    let waiters = waiters_of(task);
    let mut tables = waiters.borrow_mut();
    assert!(!tables.children.contains_key(&key),
        "a task is already waiting on this process");
    tables.children.insert(key, (process, task.clone()));
    task.inner.waiting.set(Some(Wait::Child(key)));
}

/// The reactor: a wait queue multiplexing descriptor readiness and child
/// exit over a single poll(2) call.
///
/// One queue per scheduler is the expected shape, but several can coexist;
/// child reaping is process-wide and every queue re-checks its own child
/// waiters around it.
pub struct TQueue {
    waiters: Rc<RefCell<Waiters>>,
    /// poll(2) scratch, reused and regrown across calls; its contents are
    /// only meaningful during `wait`.
    pollfds: Vec<libc::pollfd>,
}

impl TQueue {
    /// Create an empty wait queue.
    pub fn new() -> TQueue {
        sys::ignore_sigpipe();
        TQueue {
            waiters: Rc::new(RefCell::new(Waiters::default())),
            pollfds: Vec::new(),
        }
    }

    /// True when no task is waiting on anything.
    pub fn is_empty(&self) -> bool {
        let waiters = self.waiters.borrow();
        waiters.readers.is_empty() && waiters.writers.is_empty() && waiters.children.is_empty()
    }

    /// Wait for registered tasks to become runnable.
    ///
    /// Blocks for at most `timeout` (`None` blocks indefinitely) and
    /// returns the tasks whose condition fired. Returned tasks are no
    /// longer scheduled: their table entries are gone and their
    /// registration state is cleared before `wait` returns. An empty batch
    /// means the timeout expired first. `Ok(None)` is the deadlock guard:
    /// asked to block forever with nothing registered, the queue refuses
    /// instead of sleeping forever.
    ///
    /// Wake-ups are one-shot per registration: a woken task that still
    /// cannot make progress simply registers again. The order of tasks
    /// within a batch is unspecified.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Option<Vec<Task>>> {
        let mut timeout = timeout.map(duration_to_millis).unwrap_or(-1);

        self.pollfds.clear();
        let mut ready = Vec::new();

        let pending_children = {
            let mut waiters = self.waiters.borrow_mut();

            // Readers first, then writers; a descriptor with both shares
            // one slot with both directions requested.
            let mut slots = HashMap::new();
            for &fd in waiters.readers.keys() {
                slots.insert(fd, self.pollfds.len());
                self.pollfds.push(pollfd(fd, libc::POLLIN));
            }
            for &fd in waiters.writers.keys() {
                match slots.get(&fd) {
                    Some(&slot) => self.pollfds[slot].events |= libc::POLLOUT,
                    None => self.pollfds.push(pollfd(fd, libc::POLLOUT)),
                }
            }

            // Tasks whose child was already reaped are runnable right now.
            sweep_children(&mut waiters, &mut ready);
            waiters.children.len()
        };

        let socket_slots = self.pollfds.len();
        if pending_children > 0 {
            self.pollfds.push(pollfd(process::sig_pipe(), libc::POLLIN));
        }

        if !ready.is_empty() {
            timeout = 0;
        }

        if timeout == -1 && self.pollfds.is_empty() {
            // Nothing registered and asked to block forever: let the
            // caller decide instead of deadlocking.
            return Ok(None);
        }

        trace!("polling: descriptors={}, timeout={}ms", self.pollfds.len(), timeout);
        loop {
            let n = unsafe {
                libc::poll(self.pollfds.as_mut_ptr(), self.pollfds.len() as libc::nfds_t, timeout)
            };
            if n != -1 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }

        {
            let mut waiters = self.waiters.borrow_mut();
            for slot in &self.pollfds[..socket_slots] {
                if slot.events & libc::POLLIN != 0 && readable(slot.revents) {
                    if let Some(task) = waiters.readers.remove(&slot.fd) {
                        task.clear();
                        ready.push(task);
                    }
                }
                if slot.events & libc::POLLOUT != 0 && writable(slot.revents) {
                    if let Some(task) = waiters.writers.remove(&slot.fd) {
                        task.clear();
                        ready.push(task);
                    }
                }
            }
        }

        if pending_children > 0 {
            let pipe_slot = self.pollfds[self.pollfds.len() - 1];
            if readable(pipe_slot.revents) && process::reap() > 0 {
                let mut waiters = self.waiters.borrow_mut();
                sweep_children(&mut waiters, &mut ready);
            }
        }

        trace!("wait done: ready={}", ready.len());
        Ok(Some(ready))
    }
}

impl fmt::Debug for TQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let waiters = self.waiters.borrow();
        f.debug_struct("TQueue")
            .field("readers", &waiters.readers.len())
            .field("writers", &waiters.writers.len())
            .field("child_waiters", &waiters.children.len())
            .finish()
    }
}

fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd { fd, events, revents: 0 }
}

/// Readiness mask for a requested direction. Errors and hang-ups wake the
/// waiter too, so it observes the failure from its own `try_*` call.
fn readable(revents: libc::c_short) -> bool {
    revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
}

fn writable(revents: libc::c_short) -> bool {
    revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
}

/// Move every waiter whose child has been reaped into `ready`.
fn sweep_children(waiters: &mut Waiters, ready: &mut Vec<Task>) {
    let exited: Vec<u64> = waiters.children.iter()
        .filter(|(_, (process, _))| process.is_exited())
        .map(|(&key, _)| key)
        .collect();
    for key in exited {
        if let Some((_, task)) = waiters.children.remove(&key) {
            task.clear();
            ready.push(task);
        }
    }
}

/// Convert `duration` to milliseconds for poll(2), clamped to the
/// non-negative `c_int` range.
fn duration_to_millis(duration: Duration) -> libc::c_int {
    let millis = duration.as_secs().saturating_mul(1_000)
        .saturating_add(u64::from(duration.subsec_millis()));
    cmp::min(millis, libc::c_int::max_value() as u64) as libc::c_int
}
