//! Task privilege bitmask.

use bitflags::bitflags;

bitflags! {
    /// Privilege bits held by a task.
    ///
    /// `KERNEL`/`SUPERVISOR`/`USER` describe the task's base privilege
    /// level; the remaining bits are capability flags gating specific
    /// kernel-manipulation operations. ISR context is an ambient capability
    /// and is not represented as a bit here: callers running from an ISR
    /// bypass privilege checks entirely, since interrupt handlers are
    /// trusted kernel code by construction.
    #[derive(Default)]
    pub struct Privilege: u8 {
        /// Full kernel-level access. Held by the idle task, the system
        /// task, and the message/signal daemons.
        const KERNEL          = 0b0000_0001;
        /// Elevated but not kernel-level access.
        const SUPERVISOR      = 0b0000_0010;
        /// Ordinary application task.
        const USER            = 0b0000_0100;
        /// May suspend/resume/delete/unblock/set-priority other tasks.
        const TASK_MANIPULATE = 0b0000_1000;
        /// May invoke a signal from task context.
        const SIGNALING       = 0b0001_0000;
        /// May perform trace I/O.
        const TRACE           = 0b0010_0000;
        /// May administer other services (queue/message/signal tables).
        const SERVICE_ADMIN   = 0b0100_0000;
    }
}

impl Privilege {
    /// Everything a kernel-privileged internal task (idle, system, daemons)
    /// is allowed to do.
    pub const KERNEL_FULL: Self = Self::from_bits_truncate(
        Self::KERNEL.bits
            | Self::TASK_MANIPULATE.bits
            | Self::SIGNALING.bits
            | Self::TRACE.bits
            | Self::SERVICE_ADMIN.bits,
    );

    /// Check whether `self` carries every bit in `required`.
    ///
    /// Callers in ISR context should not use this directly; ISR context
    /// implies all capability bits, handled by the caller before reaching
    /// this check.
    pub fn has(self, required: Self) -> bool {
        self.contains(required)
    }
}
