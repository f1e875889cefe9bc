// src/sync.rs
//
// Counting semaphore over std Mutex + Condvar. The lock and condition
// variable themselves come from std::sync; their construction cannot fail,
// and a poisoned lock is treated as fatal because it means a thread died
// mid-protocol.
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Block until the count is positive, then decrement.
    pub fn acquire(&self) {
        let mut count = self.count.lock().expect("semaphore lock poisoned");
        while *count == 0 {
            count = self
                .available
                .wait(count)
                .expect("semaphore lock poisoned");
        }
        *count -= 1;
    }

    /// Like `acquire` but gives up after `timeout`. Returns whether a
    /// permit was taken.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().expect("semaphore lock poisoned");
        while *count == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .available
                .wait_timeout(count, deadline - now)
                .expect("semaphore lock poisoned");
            count = guard;
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Increment the count and wake one waiter.
    pub fn release(&self) {
        let mut count = self.count.lock().expect("semaphore lock poisoned");
        *count += 1;
        self.available.notify_one();
    }
}
