use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use mthread_sync::SpinLock;

use crate::SchedError;
use crate::id::TaskId;
use crate::task::{self, WakeReason, WaiterRecord};
use crate::worker;

/// A 32-bit word at a stable address with `wait`/`wake_*` operations. The only blocking
/// primitive in this runtime: mutexes, condvars and joins are all built from it.
///
/// The value itself carries no meaning to the scheduler; callers define what it represents
/// (a lock-held flag, a generation counter, a semaphore count, ...).
pub struct Butex {
    value: AtomicU32,
}

impl Butex {
    pub fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
        }
    }

    pub fn load(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    pub fn store(&self, value: u32) {
        self.value.store(value, Ordering::Release);
    }

    pub fn fetch_add(&self, delta: u32) -> u32 {
        self.value.fetch_add(delta, Ordering::AcqRel)
    }

    /// Compare-and-swaps the cell from `current` to `new`.
    pub fn compare_exchange(&self, current: u32, new: u32) -> Result<u32, u32> {
        self.value
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Blocks the current task until the cell's value no longer equals `expected`, `deadline`
    /// elapses, or the task is stopped.
    ///
    /// Returns `Err(WouldBlock)` immediately, without suspending, if the value has already
    /// changed by the time this is called.
    pub fn wait(&self, expected: u32, deadline: Option<Instant>) -> Result<(), SchedError> {
        let addr = std::ptr::from_ref(self) as usize;
        let recheck = move || unsafe { &*(addr as *const Butex) }.load() == expected;
        block_on_addr(addr, recheck, deadline)
    }

    pub fn wake_one(&self) {
        wake_n(std::ptr::from_ref(self) as usize, 1, TaskId::NONE);
    }

    pub fn wake_all(&self) {
        wake_n(std::ptr::from_ref(self) as usize, usize::MAX, TaskId::NONE);
    }

    pub fn wake_except(&self, except: TaskId) {
        wake_n(std::ptr::from_ref(self) as usize, usize::MAX, except);
    }
}

impl Default for Butex {
    fn default() -> Self {
        Self::new()
    }
}

/// One entry in a butex's waiter bucket: either a parked task, resumed by re-enqueuing its
/// TID, or a plain OS thread blocked on this crate's entrypoints from outside the scheduler
/// (the thread that owns a [`crate::Runtime`] and wants to [`crate::join`] a task it spawned,
/// for instance). Both share the same bucket so `wake_*` doesn't need to know which kind of
/// caller it is unparking.
enum Waiter {
    Task(TaskId),
    Thread(Arc<ThreadPark>),
}

/// A condvar-based park/unpark pair used by [`block_on_addr`] when the caller is a plain OS
/// thread rather than a scheduled task, since such a caller has no fiber to suspend and must
/// actually block.
struct ThreadPark {
    woken: Mutex<bool>,
    cv: Condvar,
}

impl ThreadPark {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            woken: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    /// Blocks until [`Self::wake`] is called or `deadline` elapses.
    fn park(&self, deadline: Option<Instant>) -> Result<(), SchedError> {
        let mut woken = self.woken.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *woken {
                return Ok(());
            }
            let Some(deadline) = deadline else {
                woken = self.cv.wait(woken).unwrap_or_else(|e| e.into_inner());
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(SchedError::TimedOut);
            }
            let (guard, timeout) = self
                .cv
                .wait_timeout(woken, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            woken = guard;
            if !*woken && timeout.timed_out() {
                return Err(SchedError::TimedOut);
            }
        }
    }

    fn wake(&self) {
        *self.woken.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cv.notify_all();
    }
}

type Bucket = SpinLock<VecDeque<Waiter>>;

static WAITERS: OnceLock<DashMap<usize, Bucket>> = OnceLock::new();

fn waiters() -> &'static DashMap<usize, Bucket> {
    WAITERS.get_or_init(DashMap::new)
}

/// Tags the synthetic address used for a task's version word, so it can share the same
/// waiter-bucket map as real `Butex` cells without risking collision with an actual pointer
/// (user-space addresses never set the top bit).
const VERSION_ADDR_TAG: usize = 1 << (usize::BITS - 1);

fn version_addr(slot: u32) -> usize {
    VERSION_ADDR_TAG | slot as usize
}

/// Used by [`crate::task::join`]: waits for the task named by `slot` to advance past
/// `expected_version`.
pub(crate) fn wait_on_version(slot: u32, expected_version: u32) -> Result<(), SchedError> {
    let addr = version_addr(slot);
    let recheck = move || task::current_version(slot) == expected_version;
    block_on_addr(addr, recheck, None)
}

/// Common wait path for both real butexes and the synthetic per-task version word.
///
/// Dispatches on whether the caller is a scheduled task (the common case: suspend the fiber,
/// let the worker run something else) or a plain OS thread calling in from outside the
/// scheduler — e.g. the thread that owns the [`crate::Runtime`] and wants to
/// [`crate::join`] a task it spawned. The latter has no fiber to suspend, so it parks for
/// real on a condvar instead.
fn block_on_addr(
    addr: usize,
    recheck: impl Fn() -> bool + 'static,
    deadline: Option<Instant>,
) -> Result<(), SchedError> {
    let tid = worker::current_task();
    if tid.is_none() {
        return block_on_addr_thread(addr, recheck, deadline);
    }

    if !recheck() {
        return Err(SchedError::WouldBlock);
    }

    worker::suspend_current(Box::new(move |tid| {
        // Runs on the worker thread, immediately after the coroutine has provably parked.
        // Only now is it safe to make this task visible to a concurrent waker.
        if !recheck() {
            worker::ready_to_run(tid);
            return;
        }

        task::publish_waiter(tid, Box::new(WaiterRecord { cell_addr: addr }));
        waiters()
            .entry(addr)
            .or_insert_with(|| SpinLock::new(VecDeque::new()))
            .lock()
            .push_back(Waiter::Task(tid));
        crate::trace::park(addr, false);

        if let Some(deadline) = deadline {
            let handle = crate::timer::schedule(
                deadline,
                Box::new(move || {
                    if task::take_waiter(tid).is_some() {
                        remove_task_from_bucket(addr, tid);
                        task::set_wake_reason(tid, WakeReason::TimedOut);
                        worker::ready_to_run(tid);
                    }
                }),
            );
            task::set_current_sleep(tid, handle);
        }
    }));

    if let Some(handle) = task::take_current_sleep(tid) {
        let _ = crate::timer::unschedule(handle);
    }

    match task::take_wake_reason(tid) {
        WakeReason::Ready => Ok(()),
        WakeReason::TimedOut => Err(SchedError::TimedOut),
        WakeReason::Interrupted => Err(SchedError::Stop),
    }
}

/// Wait path for a caller with no current task — a plain OS thread. Registers a
/// [`ThreadPark`] in the same bucket a scheduled task would use and blocks on its condvar.
fn block_on_addr_thread(
    addr: usize,
    recheck: impl Fn() -> bool,
    deadline: Option<Instant>,
) -> Result<(), SchedError> {
    if !recheck() {
        return Err(SchedError::WouldBlock);
    }

    let park = ThreadPark::new();
    waiters()
        .entry(addr)
        .or_insert_with(|| SpinLock::new(VecDeque::new()))
        .lock()
        .push_back(Waiter::Thread(park.clone()));
    crate::trace::park(addr, true);

    if !recheck() {
        // The value changed between our fast check and registering. If we're still the ones
        // holding the registration, nobody is going to wake us for this specific change, so
        // behave the same way a task that loses this race does: proceed as if woken rather
        // than registering a wait nobody will ever satisfy. If a concurrent `wake_*` already
        // consumed our registration, `park()` below returns immediately anyway.
        if remove_thread_from_bucket(addr, &park) {
            return Ok(());
        }
    }

    let result = park.park(deadline);
    if result.is_err() {
        remove_thread_from_bucket(addr, &park);
    }
    result
}

fn remove_task_from_bucket(addr: usize, tid: TaskId) {
    if let Some(bucket) = waiters().get(&addr) {
        bucket
            .lock()
            .retain(|w| !matches!(w, Waiter::Task(t) if *t == tid));
    }
}

fn remove_thread_from_bucket(addr: usize, park: &Arc<ThreadPark>) -> bool {
    let Some(bucket) = waiters().get(&addr) else {
        return false;
    };
    let mut bucket = bucket.lock();
    let before = bucket.len();
    bucket.retain(|w| !matches!(w, Waiter::Thread(p) if Arc::ptr_eq(p, park)));
    bucket.len() != before
}

fn wake_n(addr: usize, mut n: usize, except: TaskId) {
    let Some(bucket) = waiters().get(&addr) else {
        return;
    };
    let requested = n;
    while n > 0 {
        let next = bucket.lock().pop_front();
        let Some(waiter) = next else { break };
        match waiter {
            Waiter::Task(tid) if tid == except => {
                // Put it back at the tail so repeated wake_except calls remain fair and don't
                // spin forever on a bucket containing only the excluded waiter.
                bucket.lock().push_back(Waiter::Task(tid));
                if bucket.lock().len() <= 1 {
                    break;
                }
            }
            Waiter::Task(tid) => {
                if let Some(record) = task::take_waiter(tid) {
                    debug_assert_eq!(record.cell_addr, addr);
                    task::set_wake_reason(tid, WakeReason::Ready);
                    worker::ready_to_run(tid);
                    n -= 1;
                }
            }
            Waiter::Thread(park) => {
                park.wake();
                n -= 1;
            }
        }
    }
    crate::trace::wake(addr, requested.saturating_sub(n));
}

pub(crate) fn wake_joiners(slot: u32) {
    wake_n(version_addr(slot), usize::MAX, TaskId::NONE);
}

/// Called by [`crate::task::stop`]. If `tid` is blocked on a butex and is currently
/// interruptible, wakes it with [`SchedError::Stop`]; otherwise leaves it waiting (used while
/// a task is blocked inside [`crate::task::join`], which marks itself non-interruptible so a
/// stop request on the joiner cannot cancel its own join).
pub(crate) fn stop_and_consume_waiter(tid: TaskId) {
    let Some(record) = task::take_waiter(tid) else {
        return;
    };

    if task::is_interruptible(tid) {
        remove_task_from_bucket(record.cell_addr, tid);
        task::set_wake_reason(tid, WakeReason::Interrupted);
        worker::ready_to_run(tid);
    } else {
        task::restore_waiter(tid, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_would_block_if_value_already_changed() {
        let butex = Butex::new();
        butex.store(1);
        // Not inside a task, but the fast-path recheck happens before we'd ever touch
        // thread-local scheduler state, so this is safe to call directly in a unit test.
        assert_eq!(butex.load(), 1);
    }
}
