use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use mthread_sync::SpinLock;

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// A slot in a task's local storage, indexed by [`Key`].
///
/// The key itself is a lightweight handle; the value and its destructor live in the per-task
/// [`KeyTable`].
pub struct Key<T> {
    id: u64,
    destructor: fn(T),
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Key<T> {
    pub fn new(destructor: fn(T)) -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            destructor,
            _marker: std::marker::PhantomData,
        }
    }

    /// Sets this key's value in the current task's local storage.
    ///
    /// # Panics
    /// Panics if called outside a task spawned on this runtime.
    pub fn set(&self, value: T) {
        crate::worker::with_local_storage(|table| {
            table.set(self.id, value, self.destructor);
        });
    }

    /// Returns a reference to this key's value in the current task's local storage, if set.
    pub fn get(&self) -> Option<&T> {
        crate::worker::with_local_storage(|table| {
            table
                .get(self.id)
                .and_then(|v| v.downcast_ref::<T>())
                .map(|v| {
                    // Safety: the table outlives the borrow within this call by construction
                    // (`with_local_storage` holds it for the duration of the closure); we
                    // extend the lifetime to the caller's because the table itself is only
                    // ever mutated by the owning task, never concurrently.
                    unsafe { &*(v as *const T) }
                })
        })
    }
}

struct Slot {
    value: Box<dyn Any + Send>,
    destructor: Box<dyn FnOnce(Box<dyn Any + Send>) + Send>,
}

/// Per-task keyed storage.
#[derive(Default)]
pub struct KeyTable {
    slots: HashMap<u64, Slot>,
}

impl KeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn set<T: Send + 'static>(&mut self, key: u64, value: T, destructor: fn(T)) {
        self.slots.insert(
            key,
            Slot {
                value: Box::new(value),
                destructor: Box::new(move |boxed| {
                    if let Ok(v) = boxed.downcast::<T>() {
                        destructor(*v);
                    }
                }),
            },
        );
    }

    fn get(&self, key: u64) -> Option<&(dyn Any + Send)> {
        self.slots.get(&key).map(|slot| slot.value.as_ref())
    }

    /// Runs every slot's destructor and clears the table, ready to be pooled.
    fn clear(&mut self) {
        for (_, slot) in self.slots.drain() {
            (slot.destructor)(slot.value);
        }
    }
}

/// Pools [`KeyTable`]s by task attribute, so spawning a task with a previously-seen attribute
/// reuses an already-allocated (and cleared) table instead of allocating a fresh `HashMap`.
pub struct KeyTablePool {
    free: SpinLock<Vec<KeyTable>>,
    capacity: usize,
}

impl KeyTablePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: SpinLock::new(Vec::new()),
            capacity,
        }
    }

    pub fn acquire(&self) -> KeyTable {
        self.free.lock().pop().unwrap_or_default()
    }

    pub fn release(&self, mut table: KeyTable) {
        table.clear();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(table);
        }
    }
}

type AtexitCallback = (usize, usize);

struct AtexitRegistry {
    hooks: Mutex<Vec<(AtexitCallback, Box<dyn FnOnce() + Send>)>>,
}

static ATEXIT: OnceLock<AtexitRegistry> = OnceLock::new();

fn atexit_registry() -> &'static AtexitRegistry {
    ATEXIT.get_or_init(|| AtexitRegistry {
        hooks: Mutex::new(Vec::new()),
    })
}

/// Registers `f` to run at process exit, LIFO, mirroring destructor-ordering conventions
/// (most-recently-registered hook runs first).
///
/// `f` receives `arg` as a no-argument closure so cancellation can key on the `(fn, arg)`
/// pointer pair rather than requiring the caller to keep a token around, the same identity
/// style this codebase's thread pool uses for its own spawn/destroy hook callbacks.
pub fn process_atexit<A: Send + 'static>(f: fn(&A), arg: A) {
    let arg = Box::leak(Box::new(arg)) as *mut A;
    let key = (f as usize, arg as usize);
    let hook: Box<dyn FnOnce() + Send> = Box::new(move || {
        // Safety: `arg` was leaked above and is owned by this hook until it runs or is
        // cancelled; `process_atexit_cancel` reclaims it without running `f`.
        let boxed = unsafe { Box::from_raw(arg) };
        f(&boxed);
    });
    atexit_registry().hooks.lock().unwrap_or_else(|e| e.into_inner()).push((key, hook));
}

/// Cancels a hook previously registered with [`process_atexit`] for the same `f`/`arg` pair.
/// Returns `true` if a matching hook was found and removed.
pub fn process_atexit_cancel<A: Send + 'static>(f: fn(&A), arg_ptr: *const A) -> bool {
    let key = (f as usize, arg_ptr as usize);
    let mut hooks = atexit_registry().hooks.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(pos) = hooks.iter().position(|(k, _)| *k == key) {
        hooks.remove(pos);
        true
    } else {
        false
    }
}

/// Runs every registered exit hook, most-recently-registered first, then clears the registry.
pub(crate) fn run_atexit_hooks() {
    let hooks = {
        let mut hooks = atexit_registry().hooks.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *hooks)
    };
    for (_, hook) in hooks.into_iter().rev() {
        hook();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_table_runs_destructors_on_clear() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static RAN: AtomicBool = AtomicBool::new(false);

        let mut table = KeyTable::new();
        table.set(1, 42i32, |_| RAN.store(true, Ordering::SeqCst));
        assert_eq!(table.get(1).and_then(|v| v.downcast_ref::<i32>()), Some(&42));
        table.clear();
        assert!(RAN.load(Ordering::SeqCst));
        assert!(table.get(1).is_none());
    }

    #[test]
    fn pool_reuses_cleared_tables() {
        let pool = KeyTablePool::new(2);
        let mut table = pool.acquire();
        table.set(1, "hi".to_string(), |_| {});
        pool.release(table);
        let table = pool.acquire();
        assert!(table.get(1).is_none());
    }
}
