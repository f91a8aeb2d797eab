//! Kernel error taxonomy.
//!
//! One enum covers every fallible operation in the crate rather than a
//! family of per-operation error types: the public surface here is small
//! enough that a single flat set of variants stays legible, and call sites
//! still return the specific variant that applies, never a generic
//! catch-all.

use core::fmt;

/// Uniform result shape returned by fallible core operations.
pub type KResult<T> = Result<T, KernelError>;

/// The kinds of failure a core operation can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Null/zero-length argument, or a payload exceeding a fixed capacity.
    InvalidArgument,
    /// Unknown task name/id, queue id, or unused signal slot.
    NotFound,
    /// A fixed-size table (tasks, queues, messages, waiters, signals,
    /// subscribers) has no free slot.
    Capacity,
    /// A non-blocking attempt found the resource busy.
    Busy,
    /// A queue cannot accept another element.
    Full,
    /// A queue has no element to return, or a trigger's counter is already
    /// zero.
    Empty,
    /// A blocking operation exceeded its deadline.
    Timeout,
    /// The caller lacks the privilege bit required for this operation.
    PermissionDenied,
    /// A mutex unlock was attempted by a task that does not own it.
    NotOwner,
    /// The operation is illegal against the task's current state (e.g.
    /// acting on a `Zombie` task).
    StateViolation,
    /// Called from a context that does not allow this operation (e.g. a
    /// blocking call from within a critical section or ISR).
    BadContext,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidArgument => "invalid argument",
            Self::NotFound => "not found",
            Self::Capacity => "table full",
            Self::Busy => "busy",
            Self::Full => "queue full",
            Self::Empty => "queue empty",
            Self::Timeout => "timed out",
            Self::PermissionDenied => "permission denied",
            Self::NotOwner => "not the owner",
            Self::StateViolation => "illegal in current state",
            Self::BadContext => "bad calling context",
        };
        f.write_str(s)
    }
}
