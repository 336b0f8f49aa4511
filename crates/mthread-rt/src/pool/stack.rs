use std::cell::RefCell;
use std::sync::Mutex;

use corosensei::stack::DefaultStack;

const SMALL: usize = 16 * 1024;
const NORMAL: usize = 256 * 1024;
const LARGE: usize = 2 * 1024 * 1024;

/// Stack size classes a task can be spawned with.
///
/// `Shared` is a pseudo-class: it means "don't allocate a private stack, run directly on the
/// worker's native OS stack." It is used for tasks spawned while already out of stack budget
/// (see [`crate::task::trampoline`]) and can be requested explicitly by latency-sensitive,
/// known-shallow task bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackClass {
    Small,
    Normal,
    Large,
    Shared,
}

impl StackClass {
    fn default_size(self, config: &crate::config::RuntimeConfig) -> usize {
        match self {
            StackClass::Small => config.stack_size_small,
            StackClass::Normal => config.stack_size_normal,
            StackClass::Large => config.stack_size_large,
            StackClass::Shared => 0,
        }
    }
}

/// A stack region handed to a task, or the `Shared` sentinel.
pub enum StackHandle {
    Owned {
        class: StackClass,
        stack: DefaultStack,
    },
    Shared,
}

impl StackHandle {
    pub fn class(&self) -> StackClass {
        match self {
            StackHandle::Owned { class, .. } => *class,
            StackHandle::Shared => StackClass::Shared,
        }
    }
}

thread_local! {
    static SMALL_CACHE: RefCell<Vec<DefaultStack>> = const { RefCell::new(Vec::new()) };
    static NORMAL_CACHE: RefCell<Vec<DefaultStack>> = const { RefCell::new(Vec::new()) };
    static LARGE_CACHE: RefCell<Vec<DefaultStack>> = const { RefCell::new(Vec::new()) };
}

/// Depth at which a per-thread cache spills into the global overflow list.
const THREAD_CACHE_DEPTH: usize = 32;

static GLOBAL_SMALL: Mutex<Vec<DefaultStack>> = Mutex::new(Vec::new());
static GLOBAL_NORMAL: Mutex<Vec<DefaultStack>> = Mutex::new(Vec::new());
static GLOBAL_LARGE: Mutex<Vec<DefaultStack>> = Mutex::new(Vec::new());

fn caches_for(
    class: StackClass,
) -> (
    &'static std::thread::LocalKey<RefCell<Vec<DefaultStack>>>,
    &'static Mutex<Vec<DefaultStack>>,
) {
    match class {
        StackClass::Small => (&SMALL_CACHE, &GLOBAL_SMALL),
        StackClass::Normal => (&NORMAL_CACHE, &GLOBAL_NORMAL),
        StackClass::Large => (&LARGE_CACHE, &GLOBAL_LARGE),
        StackClass::Shared => unreachable!("Shared stacks are never pooled"),
    }
}

/// Recycles fixed-size [`DefaultStack`] regions in the three real size classes, with a
/// per-thread free-list cache spilling to a lock-guarded global list beyond
/// [`THREAD_CACHE_DEPTH`] entries.
///
/// `class == StackClass::Shared` is handled by the caller: it never reaches this allocator.
pub fn acquire(class: StackClass, config: &crate::config::RuntimeConfig) -> Option<StackHandle> {
    if class == StackClass::Shared {
        return Some(StackHandle::Shared);
    }

    let (local, global) = caches_for(class);

    if let Some(stack) = local.with(|c| c.borrow_mut().pop()) {
        return Some(StackHandle::Owned { class, stack });
    }

    if let Some(stack) = global.lock().unwrap_or_else(|e| e.into_inner()).pop() {
        return Some(StackHandle::Owned { class, stack });
    }

    let size = class.default_size(config);
    match DefaultStack::new(size) {
        Ok(stack) => Some(StackHandle::Owned { class, stack }),
        Err(_) => None,
    }
}

/// Returns a stack region to its class's pool (no-op for `Shared`).
pub fn release(handle: StackHandle) {
    let StackHandle::Owned { class, stack } = handle else {
        return;
    };

    let (local, global) = caches_for(class);
    let spilled = local.with(|c| {
        let mut c = c.borrow_mut();
        if c.len() < THREAD_CACHE_DEPTH {
            c.push(stack);
            None
        } else {
            Some(stack)
        }
    });

    if let Some(stack) = spilled {
        global.lock().unwrap_or_else(|e| e.into_inner()).push(stack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    #[test]
    fn shared_never_allocates() {
        assert!(matches!(
            acquire(StackClass::Shared, &RuntimeConfig::default()),
            Some(StackHandle::Shared)
        ));
    }

    #[test]
    fn acquire_then_release_recycles() {
        let config = RuntimeConfig::default();
        let handle = acquire(StackClass::Small, &config).expect("stack allocation");
        assert_eq!(handle.class(), StackClass::Small);
        release(handle);

        // Should come back from the thread-local cache rather than a fresh mmap.
        let handle = acquire(StackClass::Small, &config).expect("stack allocation");
        assert_eq!(handle.class(), StackClass::Small);
        release(handle);
    }
}
