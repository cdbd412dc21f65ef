use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

/// Cancellable handle to a scheduled task.
///
/// Cancellation is an atomic flag: it is idempotent and racing a
/// concurrent fire is benign (the task observes the flag before running).
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// A handle that is already cancelled. Useful as a placeholder.
    pub fn cancelled() -> Self {
        TimerHandle {
            cancelled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }
}

/// Delayed-task service consumed by the selector for connect timeouts.
///
/// The loop only ever schedules and cancels; the task itself must do no
/// more than hand work back (typically a `submit` to the loop).
pub trait Scheduler: Send + Sync {
    /// Run `task` after `delay`, unless the returned handle is cancelled
    /// first.
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle;
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Box<dyn FnOnce() + Send>,
}

// BinaryHeap is a max-heap; reverse the ordering to pop the earliest
// deadline first. `seq` breaks ties so ordering is total.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// A dedicated timer thread over a deadline min-heap.
///
/// The default `Scheduler` implementation. Dropping the scheduler stops
/// the thread; pending tasks are discarded.
pub struct TimerScheduler {
    inner: Arc<TimerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let worker = inner.clone();
        let thread = thread::Builder::new()
            .name("muxio-timer".to_string())
            .spawn(move || Self::run(&worker))
            .expect("failed to spawn timer thread");

        TimerScheduler {
            inner,
            thread: Mutex::new(Some(thread)),
        }
    }

    fn run(inner: &TimerInner) {
        enum Next {
            Idle,
            Sleep(Duration),
            Fire,
        }

        let mut state = inner.state.lock().unwrap();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            let next = match state.heap.peek() {
                None => Next::Idle,
                Some(entry) if entry.at > now => Next::Sleep(entry.at - now),
                Some(_) => Next::Fire,
            };
            match next {
                Next::Idle => {
                    state = inner.cond.wait(state).unwrap();
                }
                Next::Sleep(wait) => {
                    let (guard, _) = inner.cond.wait_timeout(state, wait).unwrap();
                    state = guard;
                }
                Next::Fire => {
                    let entry = state.heap.pop().expect("peeked entry vanished");
                    drop(state);
                    if !entry.cancelled.load(AtomicOrdering::Acquire)
                        && panic::catch_unwind(AssertUnwindSafe(|| (entry.task)())).is_err()
                    {
                        debug!("scheduled task panicked");
                    }
                    state = inner.state.lock().unwrap();
                }
            }
        }
    }
}

impl Scheduler for TimerScheduler {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.inner.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(TimerEntry {
            at: Instant::now() + delay,
            seq,
            cancelled: cancelled.clone(),
            task,
        });
        drop(state);
        self.inner.cond.notify_one();
        TimerHandle { cancelled }
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        TimerScheduler::new()
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
        }
        self.inner.cond.notify_all();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}
