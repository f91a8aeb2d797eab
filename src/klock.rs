//! Kernel state locking mechanism.
//!
//! An RAII guard proves a critical section is active, and a cell type can
//! only be accessed while holding that proof. Since every `Kernel<P>` here
//! is a single owned value rather than a `'static` singleton shared across
//! many generated kernel instantiations, the proof can simply be a borrow of
//! the `Kernel` itself: [`CpuLockGuard`] borrows `&Kernel<P>` for its
//! lifetime, and [`KCell::with`] requires that borrow. A compile-time
//! singleton token would be needed only if this crate had to support more
//! than one live `Kernel` per token type, which it does not.

use core::cell::UnsafeCell;

use crate::port::Port;

/// RAII critical-section guard. Interrupts (or preemption) stay disabled for
/// as long as this value is alive.
pub(crate) struct CpuLockGuard<'a, P: Port> {
    port: &'a P,
}

impl<'a, P: Port> CpuLockGuard<'a, P> {
    /// Enter a critical section on `port`.
    ///
    /// # Safety
    ///
    /// Must be balanced by exactly one corresponding drop; the caller must
    /// not construct overlapping guards outside of what `Port::enter_critical`
    /// nesting supports.
    pub(crate) unsafe fn enter(port: &'a P) -> Self {
        port.enter_critical();
        Self { port }
    }
}

impl<P: Port> Drop for CpuLockGuard<'_, P> {
    fn drop(&mut self) {
        // Safety: this guard is the only caller of `exit_critical` and it
        // always balances the `enter_critical` call made in `enter`.
        unsafe { self.port.exit_critical() };
    }
}

/// A cell that may only be read or mutated while a [`CpuLockGuard`] is held.
///
/// The guard is not required to borrow from the same `Kernel` that owns the
/// cell; any live guard is accepted, since what matters is that *a*
/// critical section is active, not which object's guard proves it.
pub(crate) struct KCell<T>(UnsafeCell<T>);

impl<T> KCell<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    pub(crate) fn with<P: Port, R>(
        &self,
        _guard: &CpuLockGuard<'_, P>,
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        // Safety: `_guard` proves interrupts/preemption are disabled, so no
        // other party can be concurrently accessing this cell.
        f(unsafe { &mut *self.0.get() })
    }

    /// Read-only snapshot without requiring a lock, for introspection APIs
    /// that tolerate a stale read, such as introspection queries that don't
    /// need a perfectly up-to-date value.
    pub(crate) fn snapshot(&self) -> T
    where
        T: Copy,
    {
        unsafe { *self.0.get() }
    }
}

// Safety: all access is mediated by `CpuLockGuard`, which is only
// constructed while interrupts/preemption are disabled.
unsafe impl<T: Send> Sync for KCell<T> {}
