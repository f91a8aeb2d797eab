//! Single-waiter condition-counter primitive.
//!
//! Simpler than a semaphore: at most one task may be parked on a `Trigger`
//! at a time, and the wake condition is checked two different ways on
//! purpose. `increment`/`decrement` wake the parked waiter only when the
//! counter lands on *exactly* the waiter's target value; the waiter, once
//! resumed (by wake or by timing out and rechecking), reports success if
//! the counter is *at or past* the target. The two can disagree only if
//! several increments land between the wake and the waiter actually
//! running, which can't happen on this single-core scheduler, but keeping
//! the check asymmetric costs nothing and survives a future multi-waiter
//! extension without silently flipping to the wrong comparison.

use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::klock::KCell;
use crate::port::Port;
use crate::task::TaskId;

#[derive(Clone, Copy)]
struct TriggerState {
    counter: u32,
    waiter: Option<TaskId>,
    target: u32,
}

impl TriggerState {
    const INIT: Self = Self { counter: 0, waiter: None, target: 0 };
}

pub struct Trigger<P: Port> {
    state: KCell<TriggerState>,
    _port: core::marker::PhantomData<P>,
}

unsafe impl<P: Port> Sync for Trigger<P> {}

impl<P: Port> Trigger<P> {
    pub const fn new() -> Self {
        Self {
            state: KCell::new(TriggerState::INIT),
            _port: core::marker::PhantomData,
        }
    }

    /// Reset the counter to zero and drop any registered waiter. The owning
    /// service reuses one `Trigger` across its lifetime rather than
    /// allocating a fresh one per wait cycle.
    pub fn reset(&self, kernel: &Kernel<P>) {
        let guard = kernel.lock();
        self.state.with(&guard, |s| *s = TriggerState::INIT);
    }

    pub fn count(&self) -> u32 {
        self.state.snapshot().counter
    }

    /// Block `caller` until the counter reaches at least `target`, or
    /// `timeout_ms` elapses. Only one task may wait on a given `Trigger` at
    /// once; a later call always overwrites the registered waiter and
    /// target, matching this crate's single-consumer use (the signal
    /// daemon's own wait loop).
    pub fn wait(&self, kernel: &Kernel<P>, caller: TaskId, target: u32, timeout_ms: u32) -> KResult<()> {
        let guard = kernel.lock();
        let outcome = self.state.with(&guard, |s| {
            if s.counter >= target {
                true
            } else {
                s.waiter = Some(caller);
                s.target = target;
                false
            }
        });
        drop(guard);
        if outcome {
            return Ok(());
        }

        kernel.block(caller, timeout_ms)?;
        let wait_result = kernel.wait_until_ready(caller);

        let guard = kernel.lock();
        self.state.with(&guard, |s| {
            if s.waiter == Some(caller) {
                s.waiter = None;
            }
        });
        let satisfied = self.state.with(&guard, |s| s.counter >= target);
        drop(guard);

        match wait_result {
            Ok(()) => Ok(()),
            Err(KernelError::Timeout) if satisfied => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn increment(&self, kernel: &Kernel<P>) {
        let guard = kernel.lock();
        let wake = self.state.with(&guard, |s| {
            s.counter += 1;
            match s.waiter {
                Some(w) if s.counter == s.target => Some(w),
                _ => None,
            }
        });
        drop(guard);
        if let Some(w) = wake {
            log::trace!("trigger condition met, waking waiter");
            let _ = kernel.unblock(w);
        }
    }

    /// Decrement the counter, waking the waiter if it lands exactly on the
    /// registered target. Returns [`KernelError::Empty`] without touching
    /// the counter if it is already zero.
    pub fn decrement(&self, kernel: &Kernel<P>) -> KResult<()> {
        let guard = kernel.lock();
        let wake = self.state.with(&guard, |s| {
            if s.counter == 0 {
                return Err(KernelError::Empty);
            }
            s.counter -= 1;
            Ok(match s.waiter {
                Some(w) if s.counter == s.target => Some(w),
                _ => None,
            })
        })?;
        drop(guard);
        if let Some(w) = wake {
            log::trace!("trigger condition met, waking waiter");
            let _ = kernel.unblock(w);
        }
        Ok(())
    }
}
