//! Tiny wrapper around the `switch-trace` feature gate so call sites don't each repeat
//! `#[cfg(feature = "switch-trace")]` plus the `log_context_switch` runtime check.
//!
//! Kept off the hot path by default: with the feature disabled these calls compile away to
//! nothing, and with it enabled they still no-op unless the runtime was configured with
//! [`crate::RuntimeConfigBuilder::log_context_switch`].

#[cfg(feature = "switch-trace")]
pub(crate) fn context_switch(tid: crate::id::TaskId) {
    if crate::worker::config().log_context_switch {
        tracing::trace!(?tid, "context switch");
    }
}

#[cfg(not(feature = "switch-trace"))]
pub(crate) fn context_switch(_tid: crate::id::TaskId) {}

#[cfg(feature = "switch-trace")]
pub(crate) fn park(addr: usize, thread: bool) {
    if crate::worker::config().log_context_switch {
        tracing::trace!(addr, thread, "park");
    }
}

#[cfg(not(feature = "switch-trace"))]
pub(crate) fn park(_addr: usize, _thread: bool) {}

#[cfg(feature = "switch-trace")]
pub(crate) fn wake(addr: usize, woken: usize) {
    if crate::worker::config().log_context_switch {
        tracing::trace!(addr, woken, "wake");
    }
}

#[cfg(not(feature = "switch-trace"))]
pub(crate) fn wake(_addr: usize, _woken: usize) {}

#[cfg(feature = "switch-trace")]
pub(crate) fn timer_fired(deadline: std::time::Instant) {
    if crate::worker::config().log_context_switch {
        tracing::trace!(?deadline, "timer fired");
    }
}

#[cfg(not(feature = "switch-trace"))]
pub(crate) fn timer_fired(_deadline: std::time::Instant) {}
