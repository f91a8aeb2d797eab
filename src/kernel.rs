//! The kernel façade: owns the task table and the object tables for the
//! bundled services, and drives the boot sequence and tick handling.

use crate::config::{CPU_USAGE_PERIOD_MS, MESSAGE_DAEMON_PRIORITY, MIN_STACK_SIZE, SIGNAL_DAEMON_PRIORITY, SYSTEM_TASK_PRIORITY};
use crate::error::{KResult, KernelError};
use crate::klock::CpuLockGuard;
use crate::message::MessageBroker;
use crate::port::Port;
use crate::privilege::Privilege;
use crate::queue::QueueTable;
use crate::signal::SignalTable;
use crate::task::{TaskDescriptor, TaskId, TaskSnapshot, TaskState, TaskTable};

/// Idle task body: this core never calls it, real ports implement a
/// low-power wait instruction here. Kept as a plain function so the idle
/// task occupies a real table slot with a real (if never invoked) entry
/// point, consistent with every other task.
fn idle_body() {}

/// A fixed-size idle-task stack, large enough only to satisfy
/// [`MIN_STACK_SIZE`]; the idle task never actually runs application code.
const IDLE_STACK_SIZE: usize = MIN_STACK_SIZE;

/// Owns every piece of kernel state reachable from task context: the task
/// table/scheduler, and the queue/message/signal object tables. Constructed
/// once by the embedding application and placed in a `static`.
pub struct Kernel<P: Port> {
    port: P,
    tasks: TaskTable,
    queues: QueueTable,
    messages: MessageBroker,
    signals: SignalTable,
    idle_stack: [u8; IDLE_STACK_SIZE],
    sys_stack: [u8; IDLE_STACK_SIZE],
    message_daemon_stack: [u8; IDLE_STACK_SIZE],
    signal_daemon_stack: [u8; IDLE_STACK_SIZE],
}

impl<P: Port> Kernel<P> {
    /// Build a kernel bound to `port`. Does not start scheduling; call
    /// [`Kernel::start`] once the embedding application has registered its
    /// own tasks.
    pub fn new(port: P) -> Self {
        let tasks = TaskTable::new();
        let mut kernel = Self {
            port,
            tasks,
            queues: QueueTable::new(),
            messages: MessageBroker::new(),
            signals: SignalTable::new(),
            idle_stack: [0; IDLE_STACK_SIZE],
            sys_stack: [0; IDLE_STACK_SIZE],
            message_daemon_stack: [0; IDLE_STACK_SIZE],
            signal_daemon_stack: [0; IDLE_STACK_SIZE],
        };
        let guard = kernel.lock();
        let stack_base = kernel.idle_stack.as_ptr() as usize;
        kernel
            .tasks
            .register_idle(&guard, idle_body, stack_base, IDLE_STACK_SIZE);
        drop(guard);
        kernel
    }

    pub(crate) fn lock(&self) -> CpuLockGuard<'_, P> {
        // Safety: balanced by `CpuLockGuard::drop`.
        unsafe { CpuLockGuard::enter(&self.port) }
    }

    pub(crate) fn port(&self) -> &P {
        &self.port
    }

    pub(crate) fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub(crate) fn queues(&self) -> &QueueTable {
        &self.queues
    }

    pub(crate) fn messages(&self) -> &MessageBroker {
        &self.messages
    }

    pub(crate) fn signals(&self) -> &SignalTable {
        &self.signals
    }

    /// Register a new task. May be called before or after [`Kernel::start`].
    pub fn register_task(&self, desc: &TaskDescriptor<'_>) -> KResult<TaskId> {
        let guard = self.lock();
        self.tasks.register(&guard, desc)
    }

    pub fn task_get_data(&self, id: TaskId) -> KResult<TaskSnapshot> {
        let guard = self.lock();
        self.tasks.snapshot_of(&guard, id)
    }

    pub fn task_get_id_by_name(&self, name: &str) -> KResult<TaskId> {
        let _guard = self.lock();
        self.tasks.id_by_name(name)
    }

    pub fn set_priority(&self, id: TaskId, priority: u8) -> KResult<()> {
        let guard = self.lock();
        self.tasks.set_priority(&guard, id, priority)
    }

    pub(crate) fn boost_priority(&self, id: TaskId, new_priority: u8) -> KResult<()> {
        let guard = self.lock();
        self.tasks.boost_priority(&guard, id, new_priority)
    }

    pub(crate) fn restore_priority(&self, id: TaskId) -> KResult<()> {
        let guard = self.lock();
        self.tasks.restore_priority(&guard, id)
    }

    pub fn suspend(&self, id: TaskId) -> KResult<()> {
        let guard = self.lock();
        self.tasks.suspend(&guard, id)
    }

    pub fn resume(&self, id: TaskId) -> KResult<()> {
        let guard = self.lock();
        self.tasks.resume(&guard, id)
    }

    pub fn delete(&self, id: TaskId) -> KResult<()> {
        let guard = self.lock();
        self.tasks.delete(&guard, id)
    }

    /// Put `id` to sleep for `ms` ticks. Not gated on `TASK_MANIPULATE`:
    /// sleeping is something a task legitimately does to itself, and is
    /// driven entirely by the tick handler rather than another task's
    /// intervention.
    pub fn sleep(&self, id: TaskId, ms: u32) -> KResult<()> {
        let guard = self.lock();
        self.tasks.sleep(&guard, id, ms)
    }

    pub(crate) fn block(&self, id: TaskId, timeout_ms: u32) -> KResult<()> {
        let guard = self.lock();
        self.tasks.block(&guard, id, timeout_ms)
    }

    pub(crate) fn unblock(&self, id: TaskId) -> KResult<()> {
        let guard = self.lock();
        self.tasks.unblock(&guard, id)
    }

    pub(crate) fn state_of(&self, id: TaskId) -> KResult<TaskState> {
        let guard = self.lock();
        self.tasks.state_of(&guard, id)
    }

    pub(crate) fn timed_out(&self, id: TaskId) -> KResult<bool> {
        let guard = self.lock();
        self.tasks.timed_out(&guard, id)
    }

    /// Spin until `id` leaves the `Blocked`/`Sleeping` state or its deadline
    /// elapses, yielding to the platform scheduler between checks. Shared by
    /// every blocking operation in the crate (mutex lock, trigger wait,
    /// queue put/get, message receive).
    pub(crate) fn wait_until_ready(&self, id: TaskId) -> KResult<()> {
        loop {
            let state = self.state_of(id)?;
            match state {
                TaskState::Ready => {
                    return if self.timed_out(id)? {
                        Err(KernelError::Timeout)
                    } else {
                        Ok(())
                    };
                }
                TaskState::Blocked | TaskState::Sleeping => {
                    // On real hardware, ticks arrive asynchronously from the
                    // SysTick interrupt, and the message/signal daemons run
                    // as ordinary scheduled tasks, while this loop is
                    // parked. Host-side unit tests have neither a real
                    // interrupt nor real concurrent tasks, so they drive
                    // both the tick and the daemons' periodic passes
                    // themselves once per poll to stay deterministic and
                    // single-threaded.
                    #[cfg(test)]
                    {
                        self.on_tick();
                        self.run_message_daemon_once();
                        self.run_signal_daemon_once();
                    }
                    self.port.yield_now(self.port.is_in_isr());
                }
                TaskState::Suspended | TaskState::Zombie => return Err(KernelError::StateViolation),
            }
        }
    }

    /// The monotonic system tick count, in milliseconds since boot.
    pub fn kernel_get_sys_ticks(&self) -> u64 {
        let guard = self.lock();
        self.tasks.sys_ticks(&guard)
    }

    pub fn kernel_get_cpu_usage_permille(&self, id: TaskId) -> KResult<u16> {
        Ok(self.task_get_data(id)?.cpu_usage_permille)
    }

    /// Recompute every task's `cpu_usage_permille` over the window since the
    /// last reset. `reset` starts a fresh accounting window; a collaborator
    /// that only wants to sample the current figures (e.g. a shell command)
    /// should pass `false`.
    pub fn kernel_calculate_task_cpu_usages(&self, reset: bool) {
        let guard = self.lock();
        self.tasks.recalculate_cpu_usage(&guard, CPU_USAGE_PERIOD_MS as u64, reset);
    }

    /// Tick handler, invoked once per millisecond from the platform's
    /// SysTick interrupt via the callback installed by [`Kernel::start`].
    pub(crate) fn on_tick(&self) {
        let guard = self.lock();
        self.tasks.tick(&guard);
    }

    /// Transition the scheduler to `next`, accounting CPU time against the
    /// outgoing task and saving/loading stack pointers through the port.
    fn dispatch(&self, outgoing: Option<usize>) -> usize {
        let guard = self.lock();
        if let Some(out) = outgoing {
            let sp = self.port.load_current_psp();
            self.tasks.set_psp(&guard, out, sp);
        }
        let next = self.tasks.pick_next(&guard);
        let now = self.tasks.sys_ticks(&guard);
        self.tasks.account_switch(&guard, outgoing, next, now);
        let sp = self.tasks.psp(&guard, next);
        drop(guard);
        self.port.save_current_psp(sp);
        next
    }

    /// System task body: periodically recomputes per-task CPU usage.
    /// Registered and run at [`SYSTEM_TASK_PRIORITY`] by [`Kernel::start`].
    pub(crate) fn run_system_task_once(&self) {
        self.kernel_calculate_task_cpu_usages(true);
    }

    /// Fatal-error handler: logs, waits [`crate::config::RESET_ON_ERROR_DELAY_MS`]
    /// for trace output to flush, then resets. Never returns.
    pub fn fatal(&self, msg: &str) -> ! {
        log::error!("fatal kernel error: {msg}");
        let deadline = self.kernel_get_sys_ticks() + crate::config::RESET_ON_ERROR_DELAY_MS as u64;
        while self.kernel_get_sys_ticks() < deadline {
            self.port.yield_now(true);
        }
        self.port.reset_cpu()
    }

    /// Boot sequence: install the tick callback, register the system task,
    /// run `app_init`, then hand control to the scheduler. Never returns.
    ///
    /// `app_init` runs once, before the first `dispatch`, with interrupts
    /// still globally enabled but before any application task has been
    /// scheduled; it is where the embedding application registers its own
    /// tasks if it didn't already do so via [`Kernel::register_task`].
    pub fn start(&'static self, app_init: impl FnOnce(&'static Self)) -> ! {
        CURRENT_KERNEL
            .0
            .store(self as *const Self as *mut (), core::sync::atomic::Ordering::Release);
        self.port.systick_register(Self::tick_trampoline);

        if self
            .register_task(&TaskDescriptor {
                name: "sys",
                entry: Self::system_task_trampoline,
                stack_base: self.sys_stack.as_ptr() as usize,
                stack_size: IDLE_STACK_SIZE,
                priority: SYSTEM_TASK_PRIORITY,
                privilege: Privilege::KERNEL_FULL,
            })
            .is_err()
        {
            self.fatal("system task registration failed");
        }

        if self
            .register_task(&TaskDescriptor {
                name: "message_daemon",
                entry: Self::message_daemon_trampoline,
                stack_base: self.message_daemon_stack.as_ptr() as usize,
                stack_size: IDLE_STACK_SIZE,
                priority: MESSAGE_DAEMON_PRIORITY,
                privilege: Privilege::KERNEL_FULL,
            })
            .is_err()
        {
            self.fatal("message daemon registration failed");
        }

        if self
            .register_task(&TaskDescriptor {
                name: "signal_daemon",
                entry: Self::signal_daemon_trampoline,
                stack_base: self.signal_daemon_stack.as_ptr() as usize,
                stack_size: IDLE_STACK_SIZE,
                priority: SIGNAL_DAEMON_PRIORITY,
                privilege: Privilege::KERNEL_FULL,
            })
            .is_err()
        {
            self.fatal("signal daemon registration failed");
        }

        app_init(self);

        let mut outgoing = None;
        loop {
            outgoing = Some(self.dispatch(outgoing));
        }
    }

    fn tick_trampoline() {
        CURRENT_KERNEL.with_kernel::<P, _>(|k| k.on_tick());
    }

    fn system_task_trampoline() {
        CURRENT_KERNEL.with_kernel::<P, _>(|k| k.run_system_task_once());
    }

    fn message_daemon_trampoline() {
        CURRENT_KERNEL.with_kernel::<P, _>(|k| k.run_message_daemon_once());
    }

    fn signal_daemon_trampoline() {
        CURRENT_KERNEL.with_kernel::<P, _>(|k| k.run_signal_daemon_once());
    }
}

/// Holds the single `&'static Kernel<P>` that bare `fn()` trampolines
/// (required by [`Port::systick_register`], which cannot carry captured
/// state) dispatch back into. Set once by [`Kernel::start`].
struct KernelCell(core::sync::atomic::AtomicPtr<()>);

static CURRENT_KERNEL: KernelCell = KernelCell(core::sync::atomic::AtomicPtr::new(core::ptr::null_mut()));

impl KernelCell {
    fn with_kernel<P: Port, R>(&self, f: impl FnOnce(&Kernel<P>) -> R) -> Option<R> {
        let ptr = self.0.load(core::sync::atomic::Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // Safety: only ever set by `Kernel::start` to a `&'static Kernel<P>`
        // for the same `P` this trampoline was generated for.
        Some(f(unsafe { &*(ptr as *const Kernel<P>) }))
    }
}

#[cfg(test)]
impl<P: Port> Kernel<P> {
    pub(crate) fn suspend_task(&self, id: TaskId, privileged: bool) -> KResult<()> {
        self.set_test_privilege(privileged);
        let r = self.suspend(id);
        self.clear_test_privilege();
        r
    }

    pub(crate) fn resume_task(&self, id: TaskId, privileged: bool) -> KResult<()> {
        self.set_test_privilege(privileged);
        let r = self.resume(id);
        self.clear_test_privilege();
        r
    }

    pub(crate) fn delete_task(&self, id: TaskId, privileged: bool) -> KResult<()> {
        self.set_test_privilege(privileged);
        let r = self.delete(id);
        self.clear_test_privilege();
        r
    }

    fn set_test_privilege(&self, privileged: bool) {
        let guard = self.lock();
        let p = if privileged { Some(Privilege::KERNEL_FULL) } else { Some(Privilege::USER) };
        self.tasks.set_privilege_override(&guard, p);
    }

    fn clear_test_privilege(&self) {
        let guard = self.lock();
        self.tasks.set_privilege_override(&guard, None);
    }

    pub(crate) fn test_pick_next(&self) -> TaskId {
        let guard = self.lock();
        self.tasks.pick_next(&guard);
        self.tasks.current_id(&guard).expect("pick_next always sets current")
    }

    pub(crate) fn test_advance_ticks(&self, n: u32) {
        for _ in 0..n {
            self.on_tick();
        }
    }
}
