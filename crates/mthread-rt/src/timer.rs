use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::Instant;

/// Outcome of [`unschedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyFired,
}

/// An opaque handle to a scheduled timer entry.
///
/// `id` is never reused, so `serial` currently only guards against a future id-recycling
/// scheme; today it always matches and exists to keep [`unschedule`]'s contract correct
/// under that kind of change without an API break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    id: u64,
    serial: u64,
}

struct Entry {
    id: u64,
    serial: u64,
    deadline: Instant,
    callback: Box<dyn FnOnce() + Send>,
}

struct Shared {
    heap: Mutex<BinaryHeap<Reverse<(Instant, u64)>>>,
    entries: Mutex<HashMap<u64, Entry>>,
    wake: Condvar,
    next_id: Mutex<u64>,
}

static SHARED: OnceLock<Shared> = OnceLock::new();

fn shared() -> &'static Shared {
    SHARED.get_or_init(|| {
        let shared = Shared {
            heap: Mutex::new(BinaryHeap::new()),
            entries: Mutex::new(HashMap::new()),
            wake: Condvar::new(),
            next_id: Mutex::new(1),
        };
        shared
    })
}

/// Starts the timer thread, if it has not already been started.
///
/// Idempotent: [`crate::Runtime::start`] calls this once, but tests that only exercise the
/// timer in isolation can call it directly.
pub fn ensure_started() {
    static STARTED: OnceLock<()> = OnceLock::new();
    STARTED.get_or_init(|| {
        std::thread::Builder::new()
            .name("mthread-timer".into())
            .spawn(timer_thread)
            .expect("failed to spawn timer thread");
    });
}

fn timer_thread() {
    let shared = shared();
    loop {
        let mut heap = shared.heap.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        loop {
            match heap.peek() {
                Some(Reverse((deadline, _))) if *deadline <= now => {
                    let fired_deadline = *deadline;
                    let Reverse((_, id)) = heap.pop().unwrap();
                    // Remove the entry outright rather than just taking its callback: nothing
                    // after this point needs to look it up again, and leaving a tombstone
                    // behind would grow `entries` without bound across a long-running
                    // scheduler's lifetime.
                    let callback = {
                        let mut entries = shared.entries.lock().unwrap_or_else(|e| e.into_inner());
                        entries.remove(&id).map(|e| e.callback)
                    };
                    drop(heap);
                    if let Some(cb) = callback {
                        crate::trace::timer_fired(fired_deadline);
                        cb();
                    }
                    heap = shared.heap.lock().unwrap_or_else(|e| e.into_inner());
                }
                _ => break,
            }
        }

        let wait_for = heap
            .peek()
            .map(|Reverse((deadline, _))| deadline.saturating_duration_since(Instant::now()));

        let _guard = match wait_for {
            Some(dur) if !dur.is_zero() => {
                shared.wake.wait_timeout(heap, dur).unwrap_or_else(|e| e.into_inner()).0
            }
            Some(_) => continue,
            None => shared.wake.wait(heap).unwrap_or_else(|e| e.into_inner()),
        };
    }
}

/// Schedules `callback` to run on the timer thread at `deadline`.
///
/// Returns a handle that can be passed to [`unschedule`] before the deadline elapses.
pub fn schedule(deadline: Instant, callback: Box<dyn FnOnce() + Send>) -> TimerHandle {
    ensure_started();
    let shared = shared();

    let id = {
        let mut next_id = shared.next_id.lock().unwrap_or_else(|e| e.into_inner());
        let id = *next_id;
        *next_id += 1;
        id
    };
    let serial = id;

    {
        let mut entries = shared.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            id,
            Entry {
                id,
                serial,
                deadline,
                callback,
            },
        );
    }

    let wake_timer_thread = {
        let mut heap = shared.heap.lock().unwrap_or_else(|e| e.into_inner());
        let should_wake = heap.peek().is_none_or(|Reverse((d, _))| deadline < *d);
        heap.push(Reverse((deadline, id)));
        should_wake
    };

    if wake_timer_thread {
        shared.wake.notify_one();
    }

    TimerHandle { id, serial }
}

/// Cancels a timer entry before it fires.
///
/// A fired entry is removed from `entries` as soon as the timer thread takes its callback, so
/// there is no tombstone left behind to consult here. Distinguishing "already fired" from "no
/// such handle" instead falls back to `next_id`: every id below it was handed out by `schedule`,
/// so a missing entry with `handle.id < next_id` can only mean it already ran.
pub fn unschedule(handle: TimerHandle) -> Result<CancelOutcome, ()> {
    let shared = shared();
    let mut entries = shared.entries.lock().unwrap_or_else(|e| e.into_inner());
    match entries.get(&handle.id) {
        Some(entry) if entry.serial == handle.serial => {
            entries.remove(&handle.id);
            Ok(CancelOutcome::Cancelled)
        }
        _ => {
            drop(entries);
            let next_id = *shared.next_id.lock().unwrap_or_else(|e| e.into_inner());
            if handle.id < next_id {
                Ok(CancelOutcome::AlreadyFired)
            } else {
                Err(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn fires_after_deadline() {
        let (tx, rx) = mpsc::channel();
        schedule(Instant::now() + Duration::from_millis(20), Box::new(move || {
            tx.send(()).ok();
        }));
        rx.recv_timeout(Duration::from_secs(1)).expect("timer should fire");
    }

    #[test]
    fn cancel_before_fire_succeeds() {
        let handle = schedule(Instant::now() + Duration::from_secs(10), Box::new(|| {}));
        assert_eq!(unschedule(handle), Ok(CancelOutcome::Cancelled));
    }

    #[test]
    fn fired_entry_is_removed_and_reports_already_fired() {
        let (tx, rx) = mpsc::channel();
        let handle = schedule(Instant::now() + Duration::from_millis(20), Box::new(move || {
            tx.send(()).ok();
        }));
        rx.recv_timeout(Duration::from_secs(1)).expect("timer should fire");
        assert_eq!(unschedule(handle), Ok(CancelOutcome::AlreadyFired));
        assert!(!shared().entries.lock().unwrap().contains_key(&handle.id));
    }
}
