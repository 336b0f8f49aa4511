//! Low-level synchronization primitives shared by the rest of the runtime.
//!
//! Nothing in this crate is specific to task scheduling: it is a small foundation layer
//! narrowed down to exactly what a std-hosted, thread-based scheduler needs.

mod xorshift;

pub use xorshift::XorShift64Star;

/// A busy-waiting mutual exclusion primitive.
///
/// Used for the runtime's `version_lock` (see `mthread_rt::task`), which is held for a
/// handful of instructions at a time and is never expected to be contended long enough to
/// justify parking the thread.
pub type SpinLock<T> = spin::Mutex<T>;

/// Exponential backoff helper for spin loops.
pub use crossbeam_utils::Backoff;

/// Pads and aligns a value to the size of a cache line, to prevent false sharing between
/// independently-updated atomics (run-queue head/tail, per-worker counters, ...).
pub use crossbeam_utils::CachePadded;
