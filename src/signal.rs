//! Named broadcast signals: any task can create one and subscribe a
//! handler, but `invoke` does not run handlers itself. It only records
//! that the signal fired and who fired it, then returns immediately. A
//! dedicated daemon, woken on demand, is the only place that actually
//! calls subscriber handlers, switching to each subscriber's registered
//! privilege level for the duration of its call. Overlapping invocations
//! of the same signal before the daemon's next pass collapse into that
//! one pending bit rather than queuing separately, so N invocations
//! between passes produce exactly one dispatch, not N.

use crate::config::{MAX_SIGNALS, MAX_SIGNAL_SUBSCRIBERS};
use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::klock::KCell;
use crate::port::Port;
use crate::privilege::Privilege;
use crate::task::TaskId;

const INVALID_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId(u16);

impl SignalId {
    pub const INVALID: Self = Self(INVALID_ID);

    fn new(slot: usize, generation: u8) -> Self {
        Self(((generation as u16) << 8) | slot as u16)
    }

    fn slot(self) -> usize {
        (self.0 & 0xFF) as usize
    }

    fn generation(self) -> u8 {
        (self.0 >> 8) as u8
    }
}

/// The task that called [`Kernel::signal_invoke`], passed to every
/// subscribed handler. Kept distinct from [`TaskId`] so a handler can't
/// mistake the originator for a manipulation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalSenderId(TaskId);

impl SignalSenderId {
    pub fn task(self) -> TaskId {
        self.0
    }
}

pub type SignalHandler = fn(SignalSenderId);

#[derive(Clone, Copy)]
struct Subscriber {
    task: Option<TaskId>,
    handler: Option<SignalHandler>,
    privilege: Privilege,
}

impl Subscriber {
    const EMPTY: Self = Self { task: None, handler: None, privilege: Privilege::USER };
}

#[derive(Clone, Copy)]
struct SignalSlot {
    in_use: bool,
    generation: u8,
    subscribers: [Subscriber; MAX_SIGNAL_SUBSCRIBERS],
    subscriber_count: usize,
    pending: bool,
    sender: Option<TaskId>,
}

impl SignalSlot {
    const FREE: Self = Self {
        in_use: false,
        generation: 0,
        subscribers: [Subscriber::EMPTY; MAX_SIGNAL_SUBSCRIBERS],
        subscriber_count: 0,
        pending: false,
        sender: None,
    };
}

pub(crate) struct SignalTable {
    slots: [KCell<SignalSlot>; MAX_SIGNALS],
    next_generation: core::sync::atomic::AtomicU8,
}

impl SignalTable {
    pub(crate) const fn new() -> Self {
        const FREE_CELL: KCell<SignalSlot> = KCell::new(SignalSlot::FREE);
        Self {
            slots: [FREE_CELL; MAX_SIGNALS],
            next_generation: core::sync::atomic::AtomicU8::new(1),
        }
    }

    fn mint_generation(&self) -> u8 {
        loop {
            let g = self.next_generation.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            if g != 0 {
                return g;
            }
        }
    }

    fn resolve(&self, id: SignalId) -> KResult<usize> {
        if id == SignalId::INVALID {
            return Err(KernelError::NotFound);
        }
        let slot = id.slot();
        if slot >= MAX_SIGNALS {
            return Err(KernelError::NotFound);
        }
        let snapshot = self.slots[slot].snapshot();
        if snapshot.in_use && snapshot.generation == id.generation() {
            Ok(slot)
        } else {
            Err(KernelError::NotFound)
        }
    }
}

impl<P: Port> Kernel<P> {
    pub fn signal_create(&self) -> KResult<SignalId> {
        let table = self.signals();
        let guard = self.lock();
        for (slot, cell) in table.slots.iter().enumerate() {
            let free = cell.with(&guard, |s| !s.in_use);
            if !free {
                continue;
            }
            let generation = table.mint_generation();
            cell.with(&guard, |s| {
                *s = SignalSlot { in_use: true, generation, ..SignalSlot::FREE };
            });
            return Ok(SignalId::new(slot, generation));
        }
        Err(KernelError::Capacity)
    }

    /// Subscribe `handler` to `id`, dispatched at `privilege` whenever the
    /// signal fires. Resubscribing the same task replaces its handler.
    pub fn signal_subscribe(
        &self,
        id: SignalId,
        subscriber: TaskId,
        handler: SignalHandler,
        privilege: Privilege,
    ) -> KResult<()> {
        let table = self.signals();
        let slot = table.resolve(id)?;
        let guard = self.lock();
        table.slots[slot].with(&guard, |s| {
            if let Some(existing) = s.subscribers[..s.subscriber_count]
                .iter_mut()
                .find(|sub| sub.task == Some(subscriber))
            {
                existing.handler = Some(handler);
                existing.privilege = privilege;
                return Ok(());
            }
            if s.subscriber_count >= MAX_SIGNAL_SUBSCRIBERS {
                return Err(KernelError::Capacity);
            }
            s.subscribers[s.subscriber_count] = Subscriber {
                task: Some(subscriber),
                handler: Some(handler),
                privilege,
            };
            s.subscriber_count += 1;
            Ok(())
        })
    }

    /// Record that `id` fired, tagging `sender` as the originator. `sender`
    /// must either be running in ISR context or hold [`Privilege::SIGNALING`].
    /// Returns immediately; [`Kernel::run_signal_daemon_once`] performs the
    /// actual dispatch to subscribers.
    pub fn signal_invoke(&self, id: SignalId, sender: TaskId) -> KResult<()> {
        let table = self.signals();
        let slot = table.resolve(id)?;
        if !self.port().is_in_isr() {
            let privilege = self.task_get_data(sender)?.privilege;
            if !privilege.has(Privilege::SIGNALING) {
                log::warn!("signal invoke denied: sender lacks Signaling privilege");
                return Err(KernelError::PermissionDenied);
            }
        }
        let guard = self.lock();
        table.slots[slot].with(&guard, |s| {
            s.pending = true;
            s.sender = Some(sender);
        });
        Ok(())
    }

    /// Dispatch every signal currently pending. Runs at
    /// [`SIGNAL_DAEMON_PRIORITY`] on real hardware; exposed directly since
    /// this kernel never invokes a task's entry point in software.
    ///
    /// [`SIGNAL_DAEMON_PRIORITY`]: crate::config::SIGNAL_DAEMON_PRIORITY
    pub(crate) fn run_signal_daemon_once(&self) {
        let table = self.signals();
        for cell in table.slots.iter() {
            let (due, sender, mut subscribers, count) = {
                let guard = self.lock();
                cell.with(&guard, |s| {
                    if !s.in_use || !s.pending {
                        return (false, None, [Subscriber::EMPTY; MAX_SIGNAL_SUBSCRIBERS], 0);
                    }
                    s.pending = false;
                    (true, s.sender, s.subscribers, s.subscriber_count)
                })
            };
            if !due {
                continue;
            }
            let sender = sender.expect("pending signal always recorded a sender");
            for sub in &mut subscribers[..count] {
                if let Some(handler) = sub.handler {
                    log::trace!("signal dispatch switching to subscriber privilege {:?}", sub.privilege);
                    let prior = {
                        let guard = self.lock();
                        self.tasks().boost_signal_privilege(&guard, sub.privilege)
                    };
                    handler(SignalSenderId(sender));
                    let guard = self.lock();
                    self.tasks().restore_signal_privilege(&guard, prior);
                }
            }
        }
    }

    pub fn signal_subscriber_count(&self, id: SignalId) -> KResult<usize> {
        let table = self.signals();
        let slot = table.resolve(id)?;
        Ok(table.slots[slot].snapshot().subscriber_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskDescriptor;
    use crate::test_support::new_test_kernel;

    fn spawn_with(
        k: &Kernel<crate::test_support::TestPort>,
        name: &'static str,
        privilege: Privilege,
    ) -> TaskId {
        k.register_task(&TaskDescriptor {
            name,
            entry: || {},
            stack_base: 0x1000,
            stack_size: 512,
            priority: 10,
            privilege,
        })
        .unwrap()
    }

    fn spawn(k: &Kernel<crate::test_support::TestPort>, name: &'static str) -> TaskId {
        spawn_with(k, name, Privilege::USER | Privilege::SIGNALING)
    }

    std::thread_local! {
        static HITS: core::cell::Cell<u32> = const { core::cell::Cell::new(0) };
        static LAST_SENDER: core::cell::Cell<Option<TaskId>> = const { core::cell::Cell::new(None) };
    }

    fn counting_handler(sender: SignalSenderId) {
        HITS.with(|h| h.set(h.get() + 1));
        LAST_SENDER.with(|s| s.set(Some(sender.task())));
    }

    fn reset_counters() {
        HITS.with(|h| h.set(0));
        LAST_SENDER.with(|s| s.set(None));
    }

    #[test]
    fn invoke_defers_and_daemon_pass_runs_every_subscriber() {
        reset_counters();
        let k = new_test_kernel();
        let a = spawn(&k, "a");
        let b = spawn(&k, "b");
        let sig = k.signal_create().unwrap();
        k.signal_subscribe(sig, a, counting_handler, Privilege::USER).unwrap();
        k.signal_subscribe(sig, b, counting_handler, Privilege::USER).unwrap();
        k.signal_invoke(sig, a).unwrap();
        assert_eq!(HITS.with(|h| h.get()), 0, "invoke must not dispatch synchronously");
        k.run_signal_daemon_once();
        assert_eq!(HITS.with(|h| h.get()), 2);
    }

    #[test]
    fn unprivileged_sender_is_rejected_unless_in_isr() {
        let k = new_test_kernel();
        let user = spawn_with(&k, "user", Privilege::USER);
        let sig = k.signal_create().unwrap();
        assert_eq!(k.signal_invoke(sig, user).unwrap_err(), KernelError::PermissionDenied);
    }

    #[test]
    fn resubscribing_same_task_replaces_rather_than_duplicates() {
        reset_counters();
        let k = new_test_kernel();
        let a = spawn(&k, "a");
        let sig = k.signal_create().unwrap();
        k.signal_subscribe(sig, a, counting_handler, Privilege::USER).unwrap();
        k.signal_subscribe(sig, a, counting_handler, Privilege::USER).unwrap();
        assert_eq!(k.signal_subscriber_count(sig).unwrap(), 1);
    }

    #[test]
    fn subscriber_capacity_is_enforced() {
        let k = new_test_kernel();
        let sig = k.signal_create().unwrap();
        for i in 0..MAX_SIGNAL_SUBSCRIBERS {
            let t = spawn(&k, Box::leak(format!("t{i}").into_boxed_str()));
            k.signal_subscribe(sig, t, counting_handler, Privilege::USER).unwrap();
        }
        let overflow = spawn(&k, "overflow");
        assert_eq!(
            k.signal_subscribe(sig, overflow, counting_handler, Privilege::USER).unwrap_err(),
            KernelError::Capacity
        );
    }

    #[test]
    fn invoke_on_unknown_signal_is_not_found() {
        let k = new_test_kernel();
        let a = spawn(&k, "a");
        assert_eq!(k.signal_invoke(SignalId::INVALID, a).unwrap_err(), KernelError::NotFound);
    }

    #[test]
    fn overlapping_invokes_before_a_pass_coalesce_into_one_dispatch() {
        reset_counters();
        let k = new_test_kernel();
        let a = spawn(&k, "a");
        let sig = k.signal_create().unwrap();
        k.signal_subscribe(sig, a, counting_handler, Privilege::USER).unwrap();
        k.signal_invoke(sig, a).unwrap();
        k.signal_invoke(sig, a).unwrap();
        k.signal_invoke(sig, a).unwrap();
        k.run_signal_daemon_once();
        assert_eq!(HITS.with(|h| h.get()), 1);
    }

    #[test]
    fn records_the_correct_sender() {
        reset_counters();
        let k = new_test_kernel();
        let a = spawn(&k, "a");
        let b = spawn(&k, "b");
        let sig = k.signal_create().unwrap();
        k.signal_subscribe(sig, b, counting_handler, Privilege::USER).unwrap();
        k.signal_invoke(sig, a).unwrap();
        k.run_signal_daemon_once();
        assert_eq!(LAST_SENDER.with(|s| s.get()), Some(a));
    }

    std::thread_local! {
        static SUSPEND_KERNEL: core::cell::Cell<*const Kernel<crate::test_support::TestPort>> =
            const { core::cell::Cell::new(core::ptr::null()) };
        static SUSPEND_TARGET: core::cell::Cell<Option<TaskId>> = const { core::cell::Cell::new(None) };
        static SUSPEND_RESULT: core::cell::Cell<Option<KResult<()>>> = const { core::cell::Cell::new(None) };
    }

    /// Calls `Kernel::suspend` on a task fixed up ahead of dispatch by the
    /// test, standing in for a real handler that manipulates another task.
    /// Only reachable from a running signal dispatch, so it reads the
    /// kernel back out through a thread-local rather than taking one as an
    /// argument (`SignalHandler` carries no such parameter).
    fn suspend_target_handler(_sender: SignalSenderId) {
        let target = SUSPEND_TARGET.with(|t| t.get()).expect("target set before dispatch");
        let kernel = unsafe { &*SUSPEND_KERNEL.with(|k| k.get()) };
        SUSPEND_RESULT.with(|r| r.set(Some(kernel.suspend(target))));
    }

    #[test]
    fn daemon_switches_its_own_privilege_to_the_subscribers_for_the_handler_call() {
        let k: &'static Kernel<crate::test_support::TestPort> = Box::leak(Box::new(new_test_kernel()));
        SUSPEND_KERNEL.with(|c| c.set(k as *const _));

        let privileged_target = spawn(k, "priv_target");
        let unprivileged_target = spawn(k, "unpriv_target");
        let privileged_subscriber = spawn_with(k, "priv_sub", Privilege::USER | Privilege::SIGNALING);
        let unprivileged_subscriber = spawn_with(k, "unpriv_sub", Privilege::USER | Privilege::SIGNALING);

        let privileged_sig = k.signal_create().unwrap();
        let unprivileged_sig = k.signal_create().unwrap();
        k.signal_subscribe(privileged_sig, privileged_subscriber, suspend_target_handler, Privilege::TASK_MANIPULATE)
            .unwrap();
        k.signal_subscribe(unprivileged_sig, unprivileged_subscriber, suspend_target_handler, Privilege::USER)
            .unwrap();

        SUSPEND_TARGET.with(|t| t.set(Some(privileged_target)));
        k.signal_invoke(privileged_sig, privileged_subscriber).unwrap();
        k.run_signal_daemon_once();
        assert_eq!(SUSPEND_RESULT.with(|r| r.get()), Some(Ok(())));
        assert_eq!(k.task_get_data(privileged_target).unwrap().state, crate::task::TaskState::Suspended);

        SUSPEND_TARGET.with(|t| t.set(Some(unprivileged_target)));
        k.signal_invoke(unprivileged_sig, unprivileged_subscriber).unwrap();
        k.run_signal_daemon_once();
        assert_eq!(SUSPEND_RESULT.with(|r| r.get()), Some(Err(KernelError::PermissionDenied)));
        assert_eq!(k.task_get_data(unprivileged_target).unwrap().state, crate::task::TaskState::Ready);
    }
}
