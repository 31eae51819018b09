use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use pontus::{spawn, FdAction, Socket, TQueue, Task, TaskId, Try, WaitStatus};

mod util;

use self::util::{init, wait_ready};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn child_exit_wakes_the_waiter() {
    init();
    let mut queue = TQueue::new();

    let process = spawn("/bin/true", &["true"], &[], &[]).expect("can't spawn /bin/true");
    let waiter = Task::new(&queue, TaskId(0));
    process.when_wait(&waiter);
    assert!(!queue.is_empty());

    let ready = wait_ready(&mut queue, TIMEOUT);
    assert_eq!(ready, vec![waiter]);
    assert!(queue.is_empty());

    assert_eq!(process.try_wait(), Try::Ready(WaitStatus::Exited(0)));
    assert_eq!(process.id(), None);
}

#[test]
fn try_wait_before_exit_is_retry() {
    init();
    let process = spawn("/bin/sleep", &["sleep", "5"], &[], &[]).unwrap();

    assert_eq!(process.try_wait(), Try::Retry);
    assert!(process.id().is_some());
    process.kill().unwrap();
}

#[test]
fn killed_child_reports_the_signal() {
    init();
    let mut queue = TQueue::new();

    let process = spawn("/bin/sleep", &["sleep", "60"], &[], &[]).unwrap();
    let waiter = Task::new(&queue, TaskId(0));
    process.when_wait(&waiter);

    process.kill().unwrap();

    let ready = wait_ready(&mut queue, TIMEOUT);
    assert_eq!(ready, vec![waiter]);
    assert_eq!(process.try_wait(), Try::Ready(WaitStatus::Signaled(libc::SIGKILL)));
    // Killing a reaped child no longer works.
    assert!(process.kill().is_err());
}

#[test]
fn failed_exec_exits_127() {
    init();
    let mut queue = TQueue::new();

    let process = spawn("/nonexistent/program", &["program"], &[], &[]).unwrap();
    let waiter = Task::new(&queue, TaskId(0));
    process.when_wait(&waiter);

    let ready = wait_ready(&mut queue, TIMEOUT);
    assert_eq!(ready, vec![waiter]);
    assert_eq!(process.try_wait(), Try::Ready(WaitStatus::Exited(127)));
}

#[test]
fn environment_reaches_the_child() {
    init();
    let mut queue = TQueue::new();

    // `sh -c 'exit $CODE'` proves the environment made it across exec.
    let process = spawn("/bin/sh", &["sh", "-c", "exit $CODE"], &["CODE=3"], &[]).unwrap();
    let waiter = Task::new(&queue, TaskId(0));
    process.when_wait(&waiter);

    let _ = wait_ready(&mut queue, TIMEOUT);
    assert_eq!(process.try_wait(), Try::Ready(WaitStatus::Exited(3)));
}

#[test]
fn spawn_with_descriptor_actions() {
    init();
    let mut queue = TQueue::new();

    let (mut receiver, sender) = Socket::pipe().unwrap();
    let actions = [
        FdAction::Dup { to: 1, from: sender.as_raw_fd() },
        FdAction::Close(sender.as_raw_fd()),
    ];
    let process = spawn("/bin/echo", &["echo", "-n", "out"], &[], &actions).unwrap();
    // Drop the parent's write end so the child holds the only one.
    drop(sender);

    let waiter = Task::new(&queue, TaskId(0));
    process.when_wait(&waiter);
    let _ = wait_ready(&mut queue, TIMEOUT);
    assert_eq!(process.try_wait(), Try::Ready(WaitStatus::Exited(0)));

    // The child's stdout went into the pipe.
    let reader = Task::new(&queue, TaskId(1));
    let output = loop {
        match receiver.try_read(16).unwrap() {
            Try::Ready(Some(bytes)) => break bytes,
            Try::Ready(None) => panic!("pipe closed without output"),
            Try::Retry => {
                // A timed-out wait leaves the task registered.
                if !reader.is_scheduled() {
                    receiver.when_read(&reader);
                }
                let _ = wait_ready(&mut queue, TIMEOUT);
            },
        }
    };
    assert_eq!(output, b"out".to_vec());
}

#[test]
fn dropping_the_handle_kills_the_child() {
    init();
    let mut queue = TQueue::new();

    let process = spawn("/bin/sleep", &["sleep", "60"], &[], &[]).unwrap();
    let pid = process.id().expect("child should be running") as libc::pid_t;

    drop(process);

    // The SIGKILL lands on drop; the corpse is collected by the next reap
    // that runs for any child waiter.
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if unsafe { libc::kill(pid, 0) } == -1 {
            let err = std::io::Error::last_os_error();
            assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
            break;
        }
        assert!(Instant::now() < deadline, "child survived the dropped handle");

        // Each round trip forces another reap sweep.
        let other = spawn("/bin/true", &["true"], &[], &[]).unwrap();
        let waiter = Task::new(&queue, TaskId(0));
        other.when_wait(&waiter);
        let _ = wait_ready(&mut queue, TIMEOUT);
    }
}
