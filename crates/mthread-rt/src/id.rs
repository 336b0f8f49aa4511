use std::fmt;

/// Identifies one incarnation of a task.
///
/// Packs a 32-bit slot index and a 32-bit generation (`version`) into a single `u64` so it
/// can be passed around, hashed and compared cheaply. A `TaskId` stays meaningful after the
/// task it names has exited: [`crate::exists`] and [`crate::join`] both recheck the
/// generation against the slot's current occupant before doing anything with it, so a stale
/// id from a recycled slot is rejected rather than silently addressing the wrong task.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// The reserved "no task" value. Never returned by [`crate::spawn`].
    pub const NONE: TaskId = TaskId(0);

    pub(crate) fn new(slot: u32, version: u32) -> Self {
        debug_assert_ne!(version, 0, "generation 0 is reserved for TaskId::NONE");
        Self(((slot as u64) << 32) | version as u64)
    }

    pub(crate) fn slot(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub(crate) fn version(self) -> u32 {
        self.0 as u32
    }

    pub(crate) fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "TaskId(none)")
        } else {
            write!(f, "TaskId({}.{})", self.slot(), self.version())
        }
    }
}

/// Advances a generation counter, skipping the reserved value `0`.
pub(crate) fn next_version(current: u32) -> u32 {
    let next = current.wrapping_add(1);
    if next == 0 { 1 } else { next }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_slot_and_version() {
        let tid = TaskId::new(7, 3);
        assert_eq!(tid.slot(), 7);
        assert_eq!(tid.version(), 3);
        assert!(!tid.is_none());
    }

    #[test]
    fn none_is_distinct_from_slot_zero() {
        assert!(TaskId::NONE.is_none());
        assert_ne!(TaskId::NONE, TaskId::new(0, 1));
    }

    #[test]
    fn next_version_skips_zero_on_wraparound() {
        assert_eq!(next_version(1), 2);
        assert_eq!(next_version(u32::MAX), 1);
    }
}
