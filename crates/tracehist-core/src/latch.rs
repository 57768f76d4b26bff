//! One-shot completion latch for build synchronization.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A latch that starts closed and opens exactly once. Waiters block until it
/// opens; waiting on an already-open latch returns immediately.
#[derive(Debug, Default)]
pub struct Latch {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the latch and wake every waiter. Idempotent.
    pub fn open(&self) {
        let mut open = self.open.lock();
        if !*open {
            *open = true;
            self.cv.notify_all();
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Block until the latch opens.
    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cv.wait(&mut open);
        }
    }

    /// Block until the latch opens or `timeout` elapses. Returns whether the
    /// latch is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut open = self.open.lock();
        if *open {
            return true;
        }
        self.cv.wait_for(&mut open, timeout);
        *open
    }
}
