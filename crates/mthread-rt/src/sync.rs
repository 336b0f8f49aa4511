use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::time::Instant;

use crate::SchedError;
use crate::butex::Butex;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A mutex built purely out of [`Butex`], without introducing a second blocking primitive.
///
/// Uncontended lock/unlock never touches the waiter machinery at all: only a failed
/// compare-exchange falls through to `Butex::wait`.
pub struct FiberMutex<T> {
    state: Butex,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for FiberMutex<T> {}
unsafe impl<T: Send> Sync for FiberMutex<T> {}

impl<T> FiberMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Butex::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> Result<FiberMutexGuard<'_, T>, SchedError> {
        loop {
            if self.state.compare_exchange(UNLOCKED, LOCKED).is_ok() {
                return Ok(FiberMutexGuard { mutex: self });
            }
            match self.state.wait(LOCKED, None) {
                Ok(()) | Err(SchedError::WouldBlock) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn unlock(&self) {
        self.state.store(UNLOCKED);
        self.state.wake_one();
    }
}

pub struct FiberMutexGuard<'a, T> {
    mutex: &'a FiberMutex<T>,
}

impl<T> Deref for FiberMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for FiberMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for FiberMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// A condition variable built on [`Butex`]: `wait` atomically unlocks the paired
/// [`FiberMutex`] and blocks on a private generation counter, re-acquiring the mutex before
/// returning, same contract as `std::sync::Condvar`.
pub struct FiberCondvar {
    generation: Butex,
}

impl FiberCondvar {
    pub fn new() -> Self {
        Self {
            generation: Butex::new(),
        }
    }

    pub fn wait<'a, T>(
        &self,
        guard: FiberMutexGuard<'a, T>,
    ) -> Result<FiberMutexGuard<'a, T>, SchedError> {
        let mutex = guard.mutex;
        let gen = self.generation.load();
        drop(guard);

        let result = self.generation.wait(gen, None);
        let relocked = mutex.lock()?;
        match result {
            Ok(()) | Err(SchedError::WouldBlock) => Ok(relocked),
            Err(e) => Err(e),
        }
    }

    pub fn wait_timeout<'a, T>(
        &self,
        guard: FiberMutexGuard<'a, T>,
        deadline: Instant,
    ) -> Result<FiberMutexGuard<'a, T>, SchedError> {
        let mutex = guard.mutex;
        let gen = self.generation.load();
        drop(guard);

        let result = self.generation.wait(gen, Some(deadline));
        let relocked = mutex.lock()?;
        match result {
            Ok(()) | Err(SchedError::WouldBlock) | Err(SchedError::TimedOut) => Ok(relocked),
            Err(e) => Err(e),
        }
    }

    pub fn notify_one(&self) {
        self.generation.fetch_add(1);
        self.generation.wake_one();
    }

    pub fn notify_all(&self) {
        self.generation.fetch_add(1);
        self.generation.wake_all();
    }
}

impl Default for FiberCondvar {
    fn default() -> Self {
        Self::new()
    }
}
