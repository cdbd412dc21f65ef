use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// One-shot countdown latch with a bounded wait.
///
/// Used to hand completion back from the loop thread to a caller that is
/// only willing to block for a limited time (stop, endpoint close, key
/// dumps).
pub struct Latch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Latch {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Release all current and future waiters. Idempotent.
    pub fn count_down(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.cond.notify_all();
    }

    /// Wait until released or until `timeout` elapses.
    ///
    /// Returns `true` if the latch was released within the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock().unwrap();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(done, deadline - now).unwrap();
            done = guard;
        }
        true
    }
}

impl Default for Latch {
    fn default() -> Self {
        Latch::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn released_latch_returns_immediately() {
        let latch = Latch::new();
        latch.count_down();
        assert!(latch.wait_timeout(Duration::from_millis(0)));
    }

    #[test]
    fn wait_times_out() {
        let latch = Latch::new();
        let start = Instant::now();
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn count_down_unblocks_waiter() {
        let latch = Arc::new(Latch::new());
        let other = latch.clone();
        let handle = thread::spawn(move || other.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        latch.count_down();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn count_down_is_idempotent() {
        let latch = Latch::new();
        latch.count_down();
        latch.count_down();
        assert!(latch.wait_timeout(Duration::from_millis(0)));
    }
}
