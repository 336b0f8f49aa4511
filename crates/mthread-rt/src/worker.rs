use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicUsize, Ordering};

use corosensei::Yielder;
use crossbeam_queue::ArrayQueue;
use mthread_sync::XorShift64Star;

use crate::config::RuntimeConfig;
use crate::control;
use crate::id::TaskId;
use crate::pool::fiber::Suspend;
use crate::tls::KeyTable;

/// One OS thread's share of the scheduler: a bounded run-queue and the bookkeeping needed to
/// coalesce wakeups across a burst of `yield_now` calls instead of waking a peer for each one.
pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) run_queue: ArrayQueue<TaskId>,
    pending_nosignal: AtomicUsize,
    signaled_total: AtomicUsize,
}

impl Worker {
    pub(crate) fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            run_queue: ArrayQueue::new(capacity),
            pending_nosignal: AtomicUsize::new(0),
            signaled_total: AtomicUsize::new(0),
        }
    }
}

thread_local! {
    static CURRENT_WORKER_ID: Cell<Option<usize>> = const { Cell::new(None) };
    static CURRENT_TASK: Cell<TaskId> = const { Cell::new(TaskId::NONE) };
    static CURRENT_YIELDER: Cell<Option<*const Yielder<(), Suspend>>> = const { Cell::new(None) };
    static PENDING_AFTER_PARK: RefCell<Option<Box<dyn FnOnce(TaskId)>>> = const { RefCell::new(None) };
    // Each worker thread gets its own stealing order generator; `XorShift64Star` is built on
    // a `Cell` and is not `Sync`, so it cannot live in the shared, cross-thread `Worker`.
    static STEAL_RNG: XorShift64Star = {
        let rng = XorShift64Star::fixed();
        rng.randomize();
        rng
    };
}

static CONFIG: std::sync::OnceLock<RuntimeConfig> = std::sync::OnceLock::new();

pub(crate) fn set_config(config: RuntimeConfig) {
    let _ = CONFIG.set(config);
}

pub(crate) fn config() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::default)
}

/// Runs the scheduling loop for the current OS thread. Never returns under normal operation;
/// returns only once `shutdown` is observed and the worker's queue is drained.
pub(crate) fn run_main_task(id: usize, shutdown: &std::sync::atomic::AtomicBool) {
    CURRENT_WORKER_ID.with(|c| c.set(Some(id)));
    loop {
        if shutdown.load(Ordering::Acquire) && control::control().worker(id).run_queue.is_empty() {
            return;
        }
        match wait_for_task(id) {
            Some(tid) => run_task(tid),
            None => continue,
        }
    }
}

fn wait_for_task(id: usize) -> Option<TaskId> {
    let control = control::control();
    let worker = control.worker(id);
    for _ in 0..64 {
        if let Some(tid) = worker.run_queue.pop() {
            return Some(tid);
        }
        let start = STEAL_RNG.with(|rng| rng.next_usize(control.worker_count()));
        if let Some(tid) = control.steal_for(id, start) {
            return Some(tid);
        }
        std::hint::spin_loop();
    }
    control.park();
    worker.run_queue.pop()
}

fn run_task(tid: TaskId) {
    CURRENT_TASK.with(|c| c.set(tid));
    let result = crate::task::resume(tid);
    crate::task::record_switch(tid);
    crate::trace::context_switch(tid);
    CURRENT_YIELDER.with(|c| c.set(None));

    if let crate::pool::fiber::FiberResult::Yield(Suspend::Park) = result
        && let Some(cb) = PENDING_AFTER_PARK.with(|c| c.borrow_mut().take())
    {
        cb(tid);
    }

    CURRENT_TASK.with(|c| c.set(TaskId::NONE));
}

/// Called from inside `task::trampoline`, once per resumption, before the task's own code
/// (or the remainder of a previously-suspended call) runs.
pub(crate) fn bind_current_yielder(yielder: &Yielder<(), Suspend>) {
    CURRENT_YIELDER.with(|c| c.set(Some(std::ptr::from_ref(yielder))));
}

/// Returns the `TaskId` of the task currently executing on this OS thread, or `TaskId::NONE`
/// if called from outside any task (e.g. directly on a worker's main loop).
pub fn current_task() -> TaskId {
    CURRENT_TASK.with(|c| c.get())
}

pub(crate) fn current_worker_id() -> Option<usize> {
    CURRENT_WORKER_ID.with(|c| c.get())
}

/// Suspends the currently-running task. `after_parked` runs on the *worker's* stack,
/// immediately after the coroutine switch completes and the task is provably off-CPU — this
/// is the only point at which it is safe to make the task visible to a concurrent waker.
pub(crate) fn suspend_current(after_parked: Box<dyn FnOnce(TaskId)>) {
    PENDING_AFTER_PARK.with(|c| *c.borrow_mut() = Some(after_parked));
    let yielder = CURRENT_YIELDER
        .with(|c| c.get())
        .expect("suspend_current called outside a running task");
    // Safety: the yielder is valid for the duration of the `resume()` call that invoked this
    // task, which has not yet returned.
    unsafe { &*yielder }.suspend(Suspend::Park);
}

/// Pushes `tid` onto the run-queue of the worker that owns it (its own, if called from within
/// that task; otherwise a round-robin choice), signalling one parked worker. Never spills to
/// a neighboring worker's queue on overflow: it backs off and retries.
pub fn ready_to_run(tid: TaskId) {
    ready_to_run_impl(tid, true);
}

/// Like [`ready_to_run`], but only increments the pending-signal counter instead of waking a
/// peer immediately; used by `yield_now` when the caller is about to give up the CPU anyway,
/// so there is no point waking a peer only to find this worker's queue briefly empty.
pub fn ready_to_run_nosignal(tid: TaskId) {
    ready_to_run_impl(tid, false);
}

fn ready_to_run_impl(tid: TaskId, signal: bool) {
    let control = control::control();
    let target = current_worker_id().unwrap_or_else(|| control.choose_worker());
    let worker = control.worker(target);

    let mut item = tid;
    loop {
        match worker.run_queue.push(item) {
            Ok(()) => break,
            Err(rejected) => {
                tracing::warn!(?tid, worker = target, "run-queue full, retrying");
                item = rejected;
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
    }

    if signal {
        let additional = worker.pending_nosignal.swap(0, Ordering::AcqRel);
        worker.signaled_total.fetch_add(1 + additional, Ordering::Relaxed);
        control.wake_one();
    } else {
        worker.pending_nosignal.fetch_add(1, Ordering::Relaxed);
    }
}

/// Re-enqueues the current task and switches away, giving other ready tasks a chance to run.
pub fn yield_now() {
    let tid = current_task();
    if tid.is_none() {
        return;
    }
    let use_nosignal = crate::task::about_to_quit(tid);
    suspend_current(Box::new(move |tid| {
        if use_nosignal {
            ready_to_run_nosignal(tid);
        } else {
            ready_to_run(tid);
        }
    }));
}

/// Spawns-and-switches: suspends the caller's own fiber (the same park/resume path
/// [`yield_now`] uses — the caller is never visible on any run-queue while suspended) and
/// jumps directly into `new_task` on this OS thread rather than going through the run-queue.
/// `new_task` runs nested on the caller's former stack slot exactly as it would if resumed
/// from `run_main_task`'s own loop; only once it yields or completes is the caller re-enqueued,
/// from the same after-parked callback that every other blocking primitive uses to publish a
/// suspended task safely.
///
/// Called with no current task (e.g. directly from the thread that owns the [`crate::Runtime`]
/// rather than from inside a task), there is no fiber to suspend: `new_task` simply runs
/// inline on the calling thread.
pub(crate) fn switch_to(new_task: TaskId) {
    if current_task().is_none() {
        run_task(new_task);
        return;
    }

    suspend_current(Box::new(move |caller| {
        run_task(new_task);
        ready_to_run(caller);
    }));
}

/// Runs `f` against the current task's local storage table.
///
/// # Panics
/// Panics if called outside a task spawned on this runtime.
pub(crate) fn with_local_storage<R>(f: impl FnOnce(&mut KeyTable) -> R) -> R {
    let tid = current_task();
    let storage =
        crate::task::local_storage(tid).expect("thread-local storage accessed outside a task");
    let mut table = storage.lock();
    f(&mut table)
}
