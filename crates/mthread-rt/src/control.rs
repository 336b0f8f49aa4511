use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};

use crate::id::TaskId;
use crate::worker::Worker;

/// Owns the worker set and coordinates cross-worker wakeups and stealing.
///
/// The "lounge": idle workers park on `parked`/`wake` rather than each spinning on its own
/// condvar, so a single `wake_one()` call reaches exactly one idle worker and thundering-herd
/// wakeups are avoided when many tasks become ready at once.
pub(crate) struct Control {
    workers: Vec<Worker>,
    parked: Mutex<usize>,
    wake: Condvar,
    next_steal: AtomicUsize,
}

static CONTROL: OnceLock<Control> = OnceLock::new();

pub(crate) fn control() -> &'static Control {
    CONTROL.get().expect("runtime not started; call mthread::Runtime::start first")
}

pub(crate) fn try_control() -> Option<&'static Control> {
    CONTROL.get()
}

pub(crate) fn install(workers: Vec<Worker>) -> &'static Control {
    CONTROL.get_or_init(|| Control {
        workers,
        parked: Mutex::new(0),
        wake: Condvar::new(),
        next_steal: AtomicUsize::new(0),
    })
}

impl Control {
    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn worker(&self, id: usize) -> &Worker {
        &self.workers[id]
    }

    pub(crate) fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Picks the worker `tid` should be enqueued on when no worker is "current" (e.g. a wake
    /// from the timer thread). Rotates round-robin across workers.
    pub(crate) fn choose_worker(&self) -> usize {
        self.next_steal.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    /// Wakes exactly one parked worker, if any is parked.
    pub(crate) fn wake_one(&self) {
        let parked = self.parked.lock().unwrap_or_else(|e| e.into_inner());
        if *parked > 0 {
            self.wake.notify_one();
        }
    }

    /// Parks the calling worker thread until woken or a short timeout elapses (the timeout
    /// bounds how stale a missed wakeup can be, matching the lounge's role of a best-effort
    /// rather than a perfectly precise semaphore).
    pub(crate) fn park(&self) {
        let mut parked = self.parked.lock().unwrap_or_else(|e| e.into_inner());
        *parked += 1;
        let (guard, _) = self
            .wake
            .wait_timeout(parked, std::time::Duration::from_millis(10))
            .unwrap_or_else(|e| e.into_inner());
        parked = guard;
        *parked -= 1;
    }

    /// Attempts to steal one ready task from a peer of `from_id`, starting the probe sequence
    /// at `start` (the caller's own, thread-local steal-order generator — `Worker` itself
    /// holds no RNG state since it's shared across threads behind `&'static`).
    pub(crate) fn steal_for(&self, from_id: usize, start: usize) -> Option<TaskId> {
        let n = self.workers.len();
        if n <= 1 {
            return None;
        }
        for i in 0..n {
            let idx = (start + i) % n;
            if idx == from_id {
                continue;
            }
            if let Some(tid) = self.workers[idx].run_queue.pop() {
                return Some(tid);
            }
        }
        None
    }
}
