//! The platform port capability consumed by this core.
//!
//! Everything in this module is an interface, not an implementation. The
//! actual PendSV/SVC/SysTick trap handlers, context save/restore, and
//! stack-pointer switching live in a separate platform crate and are out of
//! scope here (see the crate-level docs). A `Port` implementor must not call
//! back into the kernel while holding a critical section except where
//! explicitly noted.

/// Capability the kernel core requires from the platform layer.
///
/// `enter_critical`/`exit_critical` and `mark_in_isr`/`clear_in_isr` must
/// nest: the `n`th call to `exit_critical` after `n` calls to
/// `enter_critical` is the one that actually re-enables interrupts, and
/// likewise for the ISR-context counter.
pub trait Port {
    /// Disable interrupts (or otherwise prevent preemption). Nestable.
    ///
    /// # Safety
    ///
    /// Must only be called by [`crate::kernel::Kernel`]'s own critical
    /// section guard.
    unsafe fn enter_critical(&self);

    /// Re-enable interrupts if this was the outermost
    /// [`Port::enter_critical`] call.
    ///
    /// # Safety
    ///
    /// Must only be called by [`crate::kernel::Kernel`]'s own critical
    /// section guard, exactly once per matching `enter_critical`.
    unsafe fn exit_critical(&self);

    /// Mark entry into interrupt context. Nestable.
    fn mark_in_isr(&self);

    /// Mark exit from interrupt context.
    fn clear_in_isr(&self);

    /// Whether execution is currently within an interrupt handler.
    fn is_in_isr(&self) -> bool;

    /// Request a reschedule. `privileged` distinguishes a direct PendSV-style
    /// trigger (kernel-privileged caller) from a path that must first go
    /// through a supervisor call (unprivileged caller).
    fn yield_now(&self, privileged: bool);

    /// Persist `sp` as the stack pointer of the task being switched away
    /// from. Only ever invoked from within the context-switch sequence.
    fn save_current_psp(&self, sp: usize);

    /// Retrieve the stack pointer most recently saved by
    /// [`Port::save_current_psp`] for the task about to run.
    fn load_current_psp(&self) -> usize;

    /// Monotonic millisecond tick count since boot.
    fn sys_ticks(&self) -> u64;

    /// Terminate the system (e.g. trigger a watchdog reset or a processor
    /// reset instruction). Never returns.
    fn reset_cpu(&self) -> !;

    /// Install `cb` as the callback the platform's SysTick handler invokes
    /// on every tick. A typical implementation stores a function pointer in
    /// a static the ISR reads; `cb` takes no captured state so it can be a
    /// bare function pointer even on targets without an allocator.
    fn systick_register(&self, cb: fn());
}
