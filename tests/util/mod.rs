//! Collection of testing utilities.

#![allow(dead_code)]

use std::sync::Once;
use std::time::{Duration, Instant};

use pontus::{TQueue, Task};

/// Initialise the test setup, things like logging etc.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(std_logger::init);
}

/// Keep waiting on `queue` until at least one task is ready, or `total`
/// has elapsed.
///
/// Child reaping is process wide, so a concurrently running test can
/// consume a wake-up meant for this queue; the child sweep on the next
/// wait recovers it, which is why this loops rather than waiting once.
pub fn wait_ready(queue: &mut TQueue, total: Duration) -> Vec<Task> {
    let deadline = Instant::now() + total;
    loop {
        let ready = queue.wait(Some(Duration::from_millis(100)))
            .expect("error waiting on the queue")
            .expect("nothing registered with the queue");
        if !ready.is_empty() || Instant::now() >= deadline {
            return ready;
        }
    }
}
