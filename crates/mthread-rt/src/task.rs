use std::panic::AssertUnwindSafe;
use std::ptr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use corosensei::Yielder;
use mthread_sync::SpinLock;

use crate::SchedError;
use crate::id::{TaskId, next_version};
use crate::pool::ResourcePool;
use crate::pool::fiber::{Fiber, FiberResult, Suspend};
use crate::pool::stack::{self, StackClass, StackHandle};
use crate::timer::TimerHandle;
use crate::tls::{KeyTable, KeyTablePool};

/// Attributes a task is spawned with.
#[derive(Debug, Clone, Copy)]
pub struct TaskAttr {
    pub stack_class: StackClass,
}

impl Default for TaskAttr {
    fn default() -> Self {
        Self {
            stack_class: StackClass::Normal,
        }
    }
}

/// Cumulative statistics for one task incarnation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskStat {
    pub cpu_time_ns: u64,
    pub context_switches: u64,
}

/// Why a parked task was made ready again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    Ready,
    TimedOut,
    Interrupted,
}

/// The thing a `current_waiter` pointer actually points to: just enough for [`crate::task::stop`]
/// and the timeout path to find and remove the task's entry from the right waiter bucket. The
/// actual wake reason is stored separately in the task's slot (see `wake_reason`) since the
/// record itself is consumed before the task resumes and reads it.
pub(crate) struct WaiterRecord {
    pub(crate) cell_addr: usize,
}

enum TaskBody {
    Fiber(Fiber),
    /// A task downgraded to `StackClass::Shared`: its entry fn runs inline, to completion, the
    /// first (and only) time it is resumed.
    Inline(Option<Box<dyn FnOnce() + Send>>),
}

pub(crate) struct TaskSlot {
    body: SpinLock<Option<TaskBody>>,
    version: AtomicU32,
    version_lock: SpinLock<()>,
    stop: AtomicBool,
    interruptible: AtomicBool,
    about_to_quit: AtomicBool,
    current_waiter: AtomicPtr<WaiterRecord>,
    current_sleep: SpinLock<Option<TimerHandle>>,
    attr: TaskAttr,
    local_storage: SpinLock<KeyTable>,
    stat: SpinLock<TaskStat>,
    owner_worker: AtomicUsize,
    wake_reason: SpinLock<WakeReason>,
}

static TASKS: OnceLock<ResourcePool<TaskSlot>> = OnceLock::new();
static LIVE_TASKS: AtomicUsize = AtomicUsize::new(0);

fn tasks() -> &'static ResourcePool<TaskSlot> {
    TASKS.get_or_init(ResourcePool::new)
}

/// One [`KeyTablePool`] per stack class, so a task's table is recycled among tasks spawned
/// with the same attribute rather than pooled globally across unrelated shapes.
fn key_table_pools() -> &'static [KeyTablePool; 4] {
    static POOLS: OnceLock<[KeyTablePool; 4]> = OnceLock::new();
    POOLS.get_or_init(|| {
        let cap = crate::worker::config().key_table_pool_size;
        [
            KeyTablePool::new(cap),
            KeyTablePool::new(cap),
            KeyTablePool::new(cap),
            KeyTablePool::new(cap),
        ]
    })
}

fn pool_index(class: StackClass) -> usize {
    match class {
        StackClass::Small => 0,
        StackClass::Normal => 1,
        StackClass::Large => 2,
        StackClass::Shared => 3,
    }
}

/// Number of tasks currently spawned and not yet exited.
pub fn live_task_count() -> usize {
    LIVE_TASKS.load(Ordering::Relaxed)
}

fn trampoline(tid: TaskId, yielder: &Yielder<(), Suspend>, f: Box<dyn FnOnce() + Send>) {
    crate::worker::bind_current_yielder(yielder);

    let result = std::panic::catch_unwind(AssertUnwindSafe(f));

    if let Err(payload) = result {
        tracing::error!(?tid, "task panicked; aborting process");
        drop(payload);
        std::process::abort();
    }

    finish(tid);
}

pub(crate) fn spawn_with(
    attr: TaskAttr,
    f: Box<dyn FnOnce() + Send>,
) -> Result<TaskId, SchedError> {
    let config = crate::worker::config();
    let stack_handle = stack::acquire(attr.stack_class, config);
    let (stack_handle, downgraded) = match stack_handle {
        Some(h) => (h, false),
        None => (StackHandle::Shared, true),
    };
    let _ = downgraded;

    let key = tasks()
        .acquire(|| TaskSlot {
            body: SpinLock::new(None),
            version: AtomicU32::new(1),
            version_lock: SpinLock::new(()),
            stop: AtomicBool::new(false),
            interruptible: AtomicBool::new(true),
            about_to_quit: AtomicBool::new(false),
            current_waiter: AtomicPtr::new(ptr::null_mut()),
            current_sleep: SpinLock::new(None),
            attr,
            local_storage: SpinLock::new(key_table_pools()[pool_index(attr.stack_class)].acquire()),
            stat: SpinLock::new(TaskStat::default()),
            owner_worker: AtomicUsize::new(usize::MAX),
            wake_reason: SpinLock::new(WakeReason::Ready),
        })
        .ok_or(SchedError::NoMem)?;

    let tid = TaskId::new(key, 1);

    let body = match stack_handle {
        StackHandle::Shared => TaskBody::Inline(Some(f)),
        owned @ StackHandle::Owned { .. } => {
            let fiber = Fiber::new(owned, move |yielder| {
                trampoline(tid, yielder, f);
            });
            TaskBody::Fiber(fiber)
        }
    };

    tasks().with(key, |slot| {
        *slot.body.lock() = Some(body);
    });

    LIVE_TASKS.fetch_add(1, Ordering::Relaxed);
    if crate::worker::config().log_task_lifecycle {
        tracing::info!(?tid, "task spawned");
    }
    Ok(tid)
}

/// Resumes the task's fiber (or, for an inline/`Shared` task that hasn't run yet, runs its
/// body to completion synchronously). Called only from the worker thread that owns `tid` for
/// this resumption.
pub(crate) fn resume(tid: TaskId) -> FiberResult {
    let body = tasks().with(tid.slot(), |slot| slot.body.lock().take());
    let Some(Some(body)) = body else {
        return FiberResult::Complete;
    };

    match body {
        TaskBody::Fiber(mut fiber) => {
            // Read the stack class before resuming: if the coroutine runs to completion,
            // `finish()` releases the slot from inside the fiber's own entry fn, so the slot
            // is already gone by the time `resume()` returns below.
            let class = tasks().with(tid.slot(), |slot| slot.attr.stack_class);
            let result = fiber.resume();
            if fiber.done() {
                // The coroutine has fully returned, so it's now safe to reclaim the stack we
                // were just running on and hand it back to the per-class pool instead of
                // unmapping it.
                if let Some(class) = class {
                    stack::release(StackHandle::Owned {
                        class,
                        stack: fiber.into_stack(),
                    });
                }
            } else {
                tasks().with(tid.slot(), |slot| {
                    *slot.body.lock() = Some(TaskBody::Fiber(fiber));
                });
            }
            result
        }
        TaskBody::Inline(entry) => {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                if let Some(f) = entry {
                    f();
                }
            }));
            if let Err(payload) = result {
                tracing::error!(?tid, "task panicked; aborting process");
                drop(payload);
                std::process::abort();
            }
            finish(tid);
            FiberResult::Complete
        }
    }
}

fn finish(tid: TaskId) {
    let table_and_class = tasks().with(tid.slot(), |slot| {
        (
            std::mem::take(&mut *slot.local_storage.lock()),
            slot.attr.stack_class,
        )
    });
    if let Some((table, class)) = table_and_class {
        key_table_pools()[pool_index(class)].release(table);
    }

    tasks().with(tid.slot(), |slot| {
        let _guard = slot.version_lock.lock();
        let current = slot.version.load(Ordering::Relaxed);
        slot.version.store(next_version(current), Ordering::Release);
    });

    crate::butex::wake_joiners(tid.slot());

    LIVE_TASKS.fetch_sub(1, Ordering::Relaxed);
    if crate::worker::config().log_task_lifecycle {
        tracing::info!(?tid, "task exited");
    }

    tasks().release(tid.slot());
}

/// Public entry point: spawns a new task, enqueuing it onto the current worker's run-queue.
pub fn spawn(
    attr: Option<TaskAttr>,
    f: impl FnOnce() + Send + 'static,
) -> Result<TaskId, SchedError> {
    let tid = spawn_with(attr.unwrap_or_default(), Box::new(f))?;
    crate::worker::ready_to_run(tid);
    Ok(tid)
}

/// Spawns a new task and switches to it immediately, deferring the caller's own
/// re-enqueue until the switch has safely completed.
pub fn spawn_urgent(
    attr: Option<TaskAttr>,
    f: impl FnOnce() + Send + 'static,
) -> Result<TaskId, SchedError> {
    let tid = spawn_with(attr.unwrap_or_default(), Box::new(f))?;
    crate::worker::switch_to(tid);
    Ok(tid)
}

/// Cooperatively validates whether `tid` still names a live incarnation.
pub fn exists(tid: TaskId) -> bool {
    if tid.is_none() {
        return false;
    }
    tasks()
        .with(tid.slot(), |slot| {
            let _guard = slot.version_lock.lock();
            slot.version.load(Ordering::Acquire) == tid.version()
        })
        .unwrap_or(false)
}

/// Returns the attributes a task was spawned with.
pub fn get_attr(tid: TaskId) -> Result<TaskAttr, SchedError> {
    tasks()
        .with(tid.slot(), |slot| {
            let _guard = slot.version_lock.lock();
            if slot.version.load(Ordering::Acquire) == tid.version() {
                Some(slot.attr)
            } else {
                None
            }
        })
        .flatten()
        .ok_or(SchedError::Inval)
}

/// Requests that `tid` stop. Interrupts a pending wait unless the task has temporarily
/// marked itself non-interruptible (e.g. while blocked inside [`join`]).
pub fn stop(tid: TaskId) -> Result<(), SchedError> {
    if !exists(tid) {
        return Err(SchedError::Inval);
    }
    tasks().with(tid.slot(), |slot| {
        slot.stop.store(true, Ordering::Release);
    });
    crate::butex::stop_and_consume_waiter(tid);
    stop_sleep(tid);
    Ok(())
}

fn stop_sleep(tid: TaskId) {
    let handle = tasks().with(tid.slot(), |slot| {
        let _guard = slot.version_lock.lock();
        slot.current_sleep.lock().take()
    });
    if let Some(Some(handle)) = handle
        && crate::timer::unschedule(handle).is_ok()
    {
        crate::worker::ready_to_run(tid);
    }
}

/// Blocks the current task until `tid` exits.
pub fn join(tid: TaskId) -> Result<(), SchedError> {
    let current = crate::worker::current_task();
    if tid.is_none() || tid == current {
        return Err(SchedError::Inval);
    }

    let expected = match tasks().with(tid.slot(), |slot| {
        let _guard = slot.version_lock.lock();
        if slot.version.load(Ordering::Acquire) == tid.version() {
            Some(tid.version())
        } else {
            None
        }
    }) {
        Some(Some(v)) => v,
        _ => return Ok(()), // already exited; nothing to join
    };

    // A plain OS thread (not a scheduled task) has no `current_waiter`/`interruptible` state
    // of its own to touch — `current.is_none()` whenever `join` is called from outside the
    // scheduler, e.g. by the thread that owns the `Runtime`.
    if !current.is_none() {
        set_interruptible(current, false);
    }
    let result = crate::butex::wait_on_version(tid.slot(), expected);
    if !current.is_none() {
        set_interruptible(current, true);
    }

    match result {
        Ok(()) | Err(SchedError::WouldBlock) => Ok(()),
        Err(e) => Err(e),
    }
}

pub(crate) fn is_live_version(slot: u32, version: u32) -> bool {
    tasks()
        .with(slot, |s| {
            let _guard = s.version_lock.lock();
            s.version.load(Ordering::Acquire) == version
        })
        .unwrap_or(false)
}

pub(crate) fn current_version(slot: u32) -> u32 {
    tasks()
        .with(slot, |s| s.version.load(Ordering::Acquire))
        .unwrap_or(0)
}

pub(crate) fn set_interruptible(tid: TaskId, value: bool) {
    tasks().with(tid.slot(), |slot| {
        slot.interruptible.store(value, Ordering::Release);
    });
}

pub(crate) fn is_interruptible(tid: TaskId) -> bool {
    tasks()
        .with(tid.slot(), |slot| slot.interruptible.load(Ordering::Acquire))
        .unwrap_or(true)
}

pub(crate) fn set_about_to_quit(tid: TaskId, value: bool) {
    tasks().with(tid.slot(), |slot| {
        slot.about_to_quit.store(value, Ordering::Relaxed);
    });
}

pub(crate) fn about_to_quit(tid: TaskId) -> bool {
    tasks()
        .with(tid.slot(), |slot| slot.about_to_quit.load(Ordering::Relaxed))
        .unwrap_or(false)
}

pub(crate) fn take_stop(tid: TaskId) -> bool {
    tasks()
        .with(tid.slot(), |slot| slot.stop.swap(false, Ordering::AcqRel))
        .unwrap_or(false)
}

pub(crate) fn is_stopped(tid: TaskId) -> bool {
    tasks()
        .with(tid.slot(), |slot| slot.stop.load(Ordering::Acquire))
        .unwrap_or(false)
}

/// Installs `record` as the task's current waiter, publishing it with `Release` ordering.
pub(crate) fn publish_waiter(tid: TaskId, record: Box<WaiterRecord>) {
    tasks().with(tid.slot(), |slot| {
        let prev = slot
            .current_waiter
            .swap(Box::into_raw(record), Ordering::Release);
        debug_assert!(prev.is_null(), "task already had a pending waiter");
    });
}

/// Atomically takes ownership of the task's current waiter, if any, synchronizing with the
/// `Release` in [`publish_waiter`].
pub(crate) fn take_waiter(tid: TaskId) -> Option<Box<WaiterRecord>> {
    tasks()
        .with(tid.slot(), |slot| {
            let ptr = slot
                .current_waiter
                .swap(ptr::null_mut(), Ordering::Acquire);
            if ptr.is_null() {
                None
            } else {
                Some(unsafe { Box::from_raw(ptr) })
            }
        })
        .flatten()
}

/// Puts a waiter record back after a failed `stop` attempt on a non-interruptible task.
pub(crate) fn restore_waiter(tid: TaskId, record: Box<WaiterRecord>) {
    tasks().with(tid.slot(), |slot| {
        let prev = slot
            .current_waiter
            .swap(Box::into_raw(record), Ordering::Release);
        debug_assert!(prev.is_null());
    });
}

pub(crate) fn set_current_sleep(tid: TaskId, handle: TimerHandle) {
    tasks().with(tid.slot(), |slot| {
        *slot.current_sleep.lock() = Some(handle);
    });
}

pub(crate) fn take_current_sleep(tid: TaskId) -> Option<TimerHandle> {
    tasks()
        .with(tid.slot(), |slot| slot.current_sleep.lock().take())
        .flatten()
}

/// Records why a waker is about to re-enqueue `tid`. Read once, by the task itself, when it
/// resumes inside [`crate::butex::Butex::wait`] or [`join`].
pub(crate) fn set_wake_reason(tid: TaskId, reason: WakeReason) {
    tasks().with(tid.slot(), |slot| {
        *slot.wake_reason.lock() = reason;
    });
}

pub(crate) fn take_wake_reason(tid: TaskId) -> WakeReason {
    tasks()
        .with(tid.slot(), |slot| {
            std::mem::replace(&mut *slot.wake_reason.lock(), WakeReason::Ready)
        })
        .unwrap_or(WakeReason::Ready)
}

pub(crate) fn record_switch(tid: TaskId) {
    tasks().with(tid.slot(), |slot| {
        slot.stat.lock().context_switches += 1;
    });
}

pub(crate) fn local_storage(tid: TaskId) -> Option<&'static SpinLock<KeyTable>> {
    // Safety: the slot lives in the static slab for at least as long as the incarnation is
    // live, which is guaranteed while `tid`'s owning task is the caller.
    tasks().with(tid.slot(), |slot| {
        let ptr: *const SpinLock<KeyTable> = &slot.local_storage;
        unsafe { &*ptr }
    })
}
