//! An M:N cooperative task scheduler: many stackful, fiber-backed tasks multiplexed over a
//! small, fixed pool of OS worker threads, plus the synchronization primitive ("butex") that
//! every other blocking operation in this crate — mutexes, condvars, joins, sleeps — is built
//! out of.
//!
//! Tasks never preempt each other: a task runs until it returns or calls one of
//! [`yield_now`], [`sleep_for`], [`join`], [`Butex::wait`] or a [`FiberMutex`]/[`FiberCondvar`]
//! operation. There is no guarantee of fairness beyond eventual execution, and a panic inside
//! a task aborts the process rather than unwinding across the scheduler (see
//! [`task::trampoline`] in the source for why).

mod butex;
mod config;
mod control;
mod error;
mod id;
mod pool;
mod sync;
mod task;
mod timer;
mod tls;
mod trace;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub use butex::Butex;
pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use error::SchedError;
pub use id::TaskId;
pub use pool::stack::StackClass;
pub use sync::{FiberCondvar, FiberMutex, FiberMutexGuard};
pub use task::{TaskAttr, TaskStat, exists, get_attr, join, live_task_count, spawn, spawn_urgent, stop};
pub use tls::{Key, process_atexit, process_atexit_cancel};
pub use worker::{current_task, yield_now};

/// Sleeps the current task for `d`. `d == Duration::ZERO` behaves like [`yield_now`].
///
/// Returns `Err(SchedError::Stop)` if the task was asked to stop while sleeping.
pub fn sleep_for(d: Duration) -> Result<(), SchedError> {
    if d.is_zero() {
        yield_now();
        return Ok(());
    }

    let tid = current_task();
    assert!(!tid.is_none(), "sleep_for called outside a task");

    let deadline = Instant::now() + d;
    worker::suspend_current(Box::new(move |tid| {
        let handle = timer::schedule(
            deadline,
            Box::new(move || {
                task::take_current_sleep(tid);
                worker::ready_to_run(tid);
            }),
        );
        task::set_current_sleep(tid, handle);
    }));

    task::take_current_sleep(tid);
    if task::take_stop(tid) {
        Err(SchedError::Stop)
    } else {
        Ok(())
    }
}

/// A running scheduler: a fixed pool of worker OS threads plus the timer service thread.
///
/// Only one [`Runtime`] is expected to be alive per process — the scheduler's state (task
/// table, worker set, timer service) is process-global by design, a single scheduler per
/// process rather than one per [`Runtime`] value. Constructing a second `Runtime` while one
/// is already running will panic the first time it tries to install the worker set.
pub struct Runtime {
    shutdown: &'static AtomicBool,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl Runtime {
    /// Starts the scheduler with the given configuration: spawns `config.worker_count`
    /// worker threads (named `"{thread_name} ({id})"`) and ensures the timer thread is
    /// running.
    pub fn start(config: RuntimeConfig) -> Self {
        worker::set_config(config.clone());
        timer::ensure_started();

        let workers: Vec<worker::Worker> = (0..config.worker_count)
            .map(|id| worker::Worker::new(id, config.run_queue_capacity))
            .collect();
        control::install(workers);

        let shutdown: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(false)));

        let threads = (0..config.worker_count)
            .map(|id| {
                std::thread::Builder::new()
                    .name(format!("{} ({id})", config.thread_name))
                    .spawn(move || worker::run_main_task(id, shutdown))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        tracing::info!(workers = config.worker_count, "runtime started");

        Self { shutdown, threads }
    }

    /// Starts the scheduler with default configuration (one worker per available core).
    pub fn start_default() -> Self {
        Self::start(RuntimeConfig::default())
    }

    /// Number of currently live (spawned, not yet exited) tasks.
    pub fn live_task_count(&self) -> usize {
        task::live_task_count()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for thread in self.threads.drain(..) {
            // Panicking workers should bring the whole runtime down loudly, same discipline
            // as this codebase's own thread pool join loop, unless we're already unwinding.
            if let Err(payload) = thread.join()
                && !std::thread::panicking()
            {
                std::panic::resume_unwind(payload);
            }
        }
        tls::run_atexit_hooks();
    }
}
