//! Exercises the scheduler's universal invariants and stress scenarios end to end, against a
//! single process-wide `Runtime` shared by every test in this file (the scheduler's state is
//! process-global by design — see `mthread_rt::Runtime`'s own docs — so tests run against one
//! shared instance rather than each starting their own).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use mthread_rt::{Butex, Runtime, RuntimeConfigBuilder, SchedError, TaskId};

fn runtime() -> &'static Runtime {
    static RT: OnceLock<Runtime> = OnceLock::new();
    RT.get_or_init(|| Runtime::start(RuntimeConfigBuilder::new().worker_count(4).build()))
}

/// Spawn N tasks, each bumping a shared counter once, join every one of them from this
/// (non-task) test thread, and check the final count and that no task slots leaked.
#[test]
fn fan_in_ten_thousand_tasks() {
    let rt = runtime();
    let baseline = rt.live_task_count();

    let counter = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::with_capacity(10_000);
    for _ in 0..10_000 {
        let counter = counter.clone();
        let tid = mthread_rt::spawn(None, move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .expect("spawn should not fail under normal load");
        handles.push(tid);
    }

    for tid in handles {
        mthread_rt::join(tid).expect("join should succeed for a task that ran to completion");
    }

    assert_eq!(counter.load(Ordering::Relaxed), 10_000);
    assert_eq!(rt.live_task_count(), baseline, "no task metadata should leak");
}

/// Two tasks hand a `Butex` back and forth a bounded number of times; the final value must
/// match the total step count and no deadlock/drop should occur.
#[test]
fn butex_ping_pong() {
    let rt = runtime();
    const STEPS: u32 = 20_000;

    let ball = Arc::new(Butex::new());

    let ball2 = ball.clone();
    let responder = mthread_rt::spawn(None, move || {
        let mut expected = 0u32;
        loop {
            match ball2.wait(expected, None) {
                Ok(()) | Err(SchedError::WouldBlock) => {}
                Err(_) => return,
            }
            let value = ball2.load();
            if value >= STEPS {
                return;
            }
            expected = value + 1;
            ball2.store(expected);
            ball2.wake_one();
        }
    })
    .expect("spawn responder");

    let mut expected = 1u32;
    ball.store(expected);
    ball.wake_one();
    loop {
        match ball.wait(expected, None) {
            Ok(()) | Err(SchedError::WouldBlock) => {}
            Err(e) => panic!("unexpected error waiting on ball: {e:?}"),
        }
        let value = ball.load();
        if value >= STEPS {
            break;
        }
        expected = value + 1;
        ball.store(expected);
        ball.wake_one();
    }

    mthread_rt::join(responder).expect("responder should exit cleanly");
    assert_eq!(ball.load(), STEPS);
    let _ = rt;
}

/// `wait` on a cell already holding the expected value suspends and is later woken by a
/// `wake_one` from another task; the waiter must observe success, not a timeout.
#[test]
fn wait_then_wake_succeeds() {
    let _rt = runtime();
    let cell = Arc::new(Butex::new());

    let waiter = {
        let cell = cell.clone();
        mthread_rt::spawn(None, move || {
            cell.wait(0, None).expect("should be woken, not time out");
        })
        .expect("spawn waiter")
    };

    // Give the waiter a chance to register before we wake it; a `wake_one` that runs before
    // the waiter has published itself would otherwise be a no-op (there is nothing yet to
    // wake), which is exactly why this call happens from a second task rather than a tight
    // loop on this thread.
    std::thread::sleep(Duration::from_millis(20));
    cell.store(1);
    cell.wake_one();

    mthread_rt::join(waiter).expect("waiter task should have exited after being woken");
}

/// Waiting on a cell whose value has already diverged from `expected` returns `WouldBlock`
/// immediately, without ever suspending.
#[test]
fn wait_on_stale_expectation_would_block() {
    let _rt = runtime();
    let cell = Butex::new();
    cell.store(0);
    assert_eq!(cell.wait(1, None), Err(SchedError::WouldBlock));
}

/// `sleep_for(d)` returning `Ok` must not return before `d` has actually elapsed, and should
/// not take drastically longer on an otherwise idle runtime.
#[test]
fn sleep_respects_its_duration() {
    let _rt = runtime();
    let elapsed = Arc::new(AtomicU64::new(0));
    let elapsed2 = elapsed.clone();

    let tid = mthread_rt::spawn(None, move || {
        let start = Instant::now();
        mthread_rt::sleep_for(Duration::from_millis(50)).expect("sleep should not be stopped");
        elapsed2.store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
    })
    .expect("spawn sleeper");

    mthread_rt::join(tid).expect("sleeper should exit");
    let ms = elapsed.load(Ordering::Relaxed);
    assert!(ms >= 50, "slept for only {ms}ms, expected >= 50ms");
    assert!(ms < 250, "slept for {ms}ms, expected well under 250ms on an idle system");
}

/// Stopping a task parked in a long sleep must make its `sleep_for` return `Stop` promptly,
/// well before the sleep's own deadline.
#[test]
fn stop_wakes_a_sleeping_task_promptly() {
    let _rt = runtime();
    let result: Arc<std::sync::Mutex<Option<Result<(), SchedError>>>> =
        Arc::new(std::sync::Mutex::new(None));
    let result2 = result.clone();

    let tid = mthread_rt::spawn(None, move || {
        let outcome = mthread_rt::sleep_for(Duration::from_secs(10));
        *result2.lock().unwrap() = Some(outcome);
    })
    .expect("spawn sleeper");

    std::thread::sleep(Duration::from_millis(100));
    let stop_issued_at = Instant::now();
    mthread_rt::stop(tid).expect("stop should succeed while the task still exists");

    mthread_rt::join(tid).expect("stopped task should still be joinable");
    assert!(
        stop_issued_at.elapsed() < Duration::from_millis(500),
        "join after stop took {:?}, expected well under the 10s sleep deadline",
        stop_issued_at.elapsed()
    );
    assert_eq!(*result.lock().unwrap(), Some(Err(SchedError::Stop)));
}

/// `stop` on a task blocked in `Butex::wait` with no deadline must interrupt it rather than
/// leaving it parked forever.
#[test]
fn stop_interrupts_a_blocked_wait() {
    let _rt = runtime();
    let cell = Arc::new(Butex::new());
    let cell2 = cell.clone();
    let result: Arc<std::sync::Mutex<Option<Result<(), SchedError>>>> =
        Arc::new(std::sync::Mutex::new(None));
    let result2 = result.clone();

    let tid = mthread_rt::spawn(None, move || {
        let outcome = cell2.wait(0, None);
        *result2.lock().unwrap() = Some(outcome);
    })
    .expect("spawn waiter");

    std::thread::sleep(Duration::from_millis(20));
    mthread_rt::stop(tid).expect("stop should succeed");
    mthread_rt::join(tid).expect("task should exit after being interrupted");

    assert_eq!(*result.lock().unwrap(), Some(Err(SchedError::Stop)));
    let _ = cell;
}

/// After `join` succeeds, the joined `TaskId` must no longer `exist`, and a freshly spawned
/// task that happens to recycle the same slot must not compare equal to the stale id.
#[test]
fn slot_reuse_does_not_leak_identity() {
    let _rt = runtime();
    let first = mthread_rt::spawn(None, || {}).expect("spawn first");
    mthread_rt::join(first).expect("join first");
    assert!(!mthread_rt::exists(first));

    // Spawn enough tasks that a slot is very likely recycled, and confirm none of them ever
    // equals the now-stale `first` id.
    for _ in 0..64 {
        let tid = mthread_rt::spawn(None, || {}).expect("spawn");
        assert_ne!(tid, first);
        mthread_rt::join(tid).expect("join");
    }
    assert!(!mthread_rt::exists(first));
}

/// Nested fan-out: each of M parent tasks spawns K children and joins them all. No task
/// metadata should leak once every parent has returned.
#[test]
fn nested_spawn_join_leaves_no_leaks() {
    let rt = runtime();
    let baseline = rt.live_task_count();
    const PARENTS: usize = 100;
    const CHILDREN: usize = 100;

    let total_children_ran = Arc::new(AtomicUsize::new(0));

    let mut parents = Vec::with_capacity(PARENTS);
    for _ in 0..PARENTS {
        let total = total_children_ran.clone();
        let tid = mthread_rt::spawn(None, move || {
            let mut children = Vec::with_capacity(CHILDREN);
            for _ in 0..CHILDREN {
                let total = total.clone();
                let child = mthread_rt::spawn(None, move || {
                    total.fetch_add(1, Ordering::Relaxed);
                })
                .expect("spawn child");
                children.push(child);
            }
            for child in children {
                mthread_rt::join(child).expect("join child");
            }
        })
        .expect("spawn parent");
        parents.push(tid);
    }

    for parent in parents {
        mthread_rt::join(parent).expect("join parent");
    }

    assert_eq!(total_children_ran.load(Ordering::Relaxed), PARENTS * CHILDREN);
    assert_eq!(rt.live_task_count(), baseline, "no task metadata should leak");
}

/// `get_attr` and `exists` must agree on liveness, and both must reject `TaskId::NONE`.
#[test]
fn attr_and_exists_track_liveness() {
    let _rt = runtime();
    assert!(!mthread_rt::exists(TaskId::NONE));
    assert_eq!(mthread_rt::get_attr(TaskId::NONE), Err(SchedError::Inval));

    let tid = mthread_rt::spawn(None, || {
        mthread_rt::sleep_for(Duration::from_millis(30)).ok();
    })
    .expect("spawn");
    assert!(mthread_rt::exists(tid));
    assert!(mthread_rt::get_attr(tid).is_ok());

    mthread_rt::join(tid).expect("join");
    assert!(!mthread_rt::exists(tid));
    assert_eq!(mthread_rt::get_attr(tid), Err(SchedError::Inval));
}

/// Joining `TaskId::NONE` or the caller's own id is a programming error, not a valid wait.
#[test]
fn join_rejects_invalid_targets() {
    let _rt = runtime();
    assert_eq!(mthread_rt::join(TaskId::NONE), Err(SchedError::Inval));
}
