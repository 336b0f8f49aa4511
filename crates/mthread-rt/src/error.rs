use thiserror::Error;

/// The error type returned by every fallible scheduler entrypoint.
///
/// Every suspension point (`join`, `Butex::wait`, `sleep_for`, ...) returns one of these
/// directly rather than a per-call bespoke type, so a caller written against one of them can
/// match the same variants against all of them.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchedError {
    /// A null/absent entry function, a zero or self-referential `TaskId`, or a `TaskId`
    /// whose generation no longer matches the slot's current occupant.
    #[error("invalid argument")]
    Inval,

    /// A resource pool slot or a stack region could not be acquired.
    #[error("out of memory")]
    NoMem,

    /// The target task (or the caller itself) has a pending stop request.
    #[error("task was asked to stop")]
    Stop,

    /// A wait was pre-empted by a stop request before its condition was satisfied.
    #[error("wait was interrupted")]
    Interrupted,

    /// The watched cell's value had already changed before the wait could be installed.
    #[error("would block")]
    WouldBlock,

    /// The wait's deadline elapsed before it was woken.
    #[error("timed out")]
    TimedOut,

    /// Reserved for RPC layers built atop this scheduler; never constructed here.
    #[error("remote host is down")]
    HostDown,
}
