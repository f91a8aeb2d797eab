//! Task table and priority-based preemptive scheduler.
//!
//! Task control blocks and the scheduler's selection routine live together
//! in this module, stored in a single fixed-size array owned by
//! [`crate::kernel::Kernel`]: one static `TaskTable` of `MAX_TASKS` slots,
//! sized once at compile time rather than generated per application.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::config::{IDLE_PRIORITY, MAX_TASKS, MAX_TASK_NAME, MAX_STACK_SIZE, MIN_STACK_SIZE};
use crate::error::{KResult, KernelError};
use crate::klock::{CpuLockGuard, KCell};
use crate::port::Port;
use crate::privilege::Privilege;

/// Sentinel for "no such task"; also the zero value no real id ever takes
/// (generations are minted starting at 1).
const INVALID_ID: u16 = 0;

/// Opaque task identifier encoding `(slot_index, generation)` so a stale id
/// belonging to a since-reused slot never addresses the wrong task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u16);

impl TaskId {
    /// The reserved sentinel meaning "no task".
    pub const INVALID: Self = Self(INVALID_ID);

    fn new(slot: usize, generation: u8) -> Self {
        debug_assert!(slot < 256);
        Self(((generation as u16) << 8) | slot as u16)
    }

    fn slot(self) -> usize {
        (self.0 & 0xFF) as usize
    }

    fn generation(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn is_valid(self) -> bool {
        self.0 != INVALID_ID
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Blocked,
    Sleeping,
    Suspended,
    /// Also doubles as "this slot is free": a never-registered slot and a
    /// deleted task are indistinguishable until `register` reuses the slot
    /// and bumps its generation.
    Zombie,
}

/// A task entry point. Plain function pointers only: no captured state, so
/// this stays usable on targets without an allocator.
pub type TaskEntry = fn();

/// Sentinel meaning "block forever".
pub use crate::config::BLOCK_FOREVER;

/// Registration input for [`crate::kernel::Kernel::register_task`].
pub struct TaskDescriptor<'a> {
    pub name: &'a str,
    pub entry: TaskEntry,
    pub stack_base: usize,
    pub stack_size: usize,
    pub priority: u8,
    pub privilege: Privilege,
}

/// Task control block.
#[derive(Debug, Clone, Copy)]
pub struct Tcb {
    generation: u8,
    name: [u8; MAX_TASK_NAME],
    name_len: u8,
    entry: Option<TaskEntry>,
    stack_base: usize,
    stack_size: usize,
    psp: usize,
    state: TaskState,
    prior_state: TaskState,
    priority: u8,
    base_priority: u8,
    block_ticks: u32,
    sleep_ticks: u32,
    /// Set by the tick handler when a blocked task's deadline elapses,
    /// cleared whenever the task is (re-)blocked. Lets a caller distinguish
    /// "woken by unblock" from "woken by timeout" once `state` is back to
    /// `Ready` (the public API's only two outcomes for a blocking call).
    timed_out: bool,
    privilege: Privilege,
    run_count: u32,
    runtime_ticks: u64,
    cpu_usage_permille: u16,
    slice_start_ticks: u64,
}

impl Tcb {
    const FREE: Self = Self {
        generation: 0,
        name: [0; MAX_TASK_NAME],
        name_len: 0,
        entry: None,
        stack_base: 0,
        stack_size: 0,
        psp: 0,
        state: TaskState::Zombie,
        prior_state: TaskState::Zombie,
        priority: IDLE_PRIORITY,
        base_priority: IDLE_PRIORITY,
        block_ticks: 0,
        sleep_ticks: 0,
        timed_out: false,
        privilege: Privilege::empty(),
        run_count: 0,
        runtime_ticks: 0,
        cpu_usage_permille: 0,
        slice_start_ticks: 0,
    };

    fn name_str(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }
}

/// A read-only snapshot of a task's externally interesting fields, returned
/// by `task_get_data` (a trace/sysmon introspection surface).
#[derive(Debug, Clone, Copy)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name_len: u8,
    pub name: [u8; MAX_TASK_NAME],
    pub state: TaskState,
    pub priority: u8,
    pub base_priority: u8,
    pub privilege: Privilege,
    pub run_count: u32,
    pub runtime_ticks: u64,
    pub cpu_usage_permille: u16,
}

impl TaskSnapshot {
    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }
}

/// The fixed-size task table plus scheduler bookkeeping.
pub(crate) struct TaskTable {
    slots: [KCell<Tcb>; MAX_TASKS],
    /// Slot index of the task considered "current" (running / about to
    /// run). `None` before the scheduler has picked anything.
    current: KCell<Option<usize>>,
    /// Rotating start point for the round-robin tie-break among equal-priority
    /// Ready tasks.
    rr_cursor: KCell<usize>,
    next_generation: AtomicU8,
    sys_ticks: KCell<u64>,
    /// Effective privilege the signal daemon's dispatch loop is currently
    /// running a subscriber handler at, or `None` outside of a handler call.
    /// Checked by `require_privilege` ahead of the ordinary "current task"
    /// lookup.
    signal_privilege: KCell<Option<Privilege>>,
    /// Lets host-side unit tests assert a caller privilege directly instead
    /// of threading a real "currently running task" through a scheduler
    /// that, outside of real hardware, never actually dispatches anything.
    #[cfg(test)]
    privilege_override: KCell<Option<Privilege>>,
}

impl TaskTable {
    pub(crate) const fn new() -> Self {
        const FREE_CELL: KCell<Tcb> = KCell::new(Tcb::FREE);
        Self {
            slots: [FREE_CELL; MAX_TASKS],
            current: KCell::new(None),
            rr_cursor: KCell::new(0),
            next_generation: AtomicU8::new(1),
            sys_ticks: KCell::new(0),
            signal_privilege: KCell::new(None),
            #[cfg(test)]
            privilege_override: KCell::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_privilege_override<P: Port>(&self, guard: &CpuLockGuard<'_, P>, p: Option<Privilege>) {
        self.privilege_override.with(guard, |o| *o = p);
    }

    fn mint_generation(&self) -> u8 {
        loop {
            let g = self.next_generation.fetch_add(1, Ordering::Relaxed);
            if g != 0 {
                return g;
            }
            // 0 is reserved; the wrap lands back on the next loop iteration.
        }
    }

    pub(crate) fn register<P: Port>(
        &self,
        guard: &CpuLockGuard<'_, P>,
        desc: &TaskDescriptor<'_>,
    ) -> KResult<TaskId> {
        if desc.stack_size < MIN_STACK_SIZE
            || desc.stack_size > MAX_STACK_SIZE
            || desc.name.len() > MAX_TASK_NAME
            || desc.priority == IDLE_PRIORITY
        {
            return Err(KernelError::InvalidArgument);
        }

        for (slot, cell) in self.slots.iter().enumerate() {
            let is_free = cell.with(guard, |t| t.state == TaskState::Zombie);
            if !is_free {
                continue;
            }
            let generation = self.mint_generation();
            let mut name = [0u8; MAX_TASK_NAME];
            name[..desc.name.len()].copy_from_slice(desc.name.as_bytes());
            cell.with(guard, |t| {
                *t = Tcb {
                    generation,
                    name,
                    name_len: desc.name.len() as u8,
                    entry: Some(desc.entry),
                    stack_base: desc.stack_base,
                    stack_size: desc.stack_size,
                    psp: 0,
                    state: TaskState::Ready,
                    prior_state: TaskState::Ready,
                    priority: desc.priority,
                    base_priority: desc.priority,
                    block_ticks: 0,
                    sleep_ticks: 0,
                    timed_out: false,
                    privilege: desc.privilege,
                    run_count: 0,
                    runtime_ticks: 0,
                    cpu_usage_permille: 0,
                    slice_start_ticks: 0,
                };
            });
            log::debug!("task {} registered in slot {slot}", desc.name);
            return Ok(TaskId::new(slot, generation));
        }
        Err(KernelError::Capacity)
    }

    /// Register the implicit idle task at [`IDLE_PRIORITY`] into a
    /// reserved slot. Called once by [`crate::kernel::Kernel::new`].
    pub(crate) fn register_idle<P: Port>(
        &self,
        guard: &CpuLockGuard<'_, P>,
        entry: TaskEntry,
        stack_base: usize,
        stack_size: usize,
    ) -> TaskId {
        self.register(
            guard,
            &TaskDescriptor {
                name: "idle",
                entry,
                stack_base,
                stack_size,
                priority: IDLE_PRIORITY,
                privilege: Privilege::KERNEL_FULL,
            },
        )
        .unwrap_or_else(|_| unreachable!("idle task registration cannot fail on an empty table"))
    }

    fn resolve(&self, id: TaskId) -> KResult<usize> {
        if !id.is_valid() {
            return Err(KernelError::NotFound);
        }
        let slot = id.slot();
        if slot >= MAX_TASKS {
            return Err(KernelError::NotFound);
        }
        let matches = self.slots[slot].snapshot().generation == id.generation();
        if matches {
            Ok(slot)
        } else {
            Err(KernelError::NotFound)
        }
    }

    pub(crate) fn id_by_name(&self, name: &str) -> KResult<TaskId> {
        for (slot, cell) in self.slots.iter().enumerate() {
            let tcb = cell.snapshot();
            if tcb.state != TaskState::Zombie && tcb.name_str() == name {
                return Ok(TaskId::new(slot, tcb.generation));
            }
        }
        Err(KernelError::NotFound)
    }

    pub(crate) fn snapshot_of<P: Port>(
        &self,
        guard: &CpuLockGuard<'_, P>,
        id: TaskId,
    ) -> KResult<TaskSnapshot> {
        let slot = self.resolve(id)?;
        Ok(self.slots[slot].with(guard, |t| TaskSnapshot {
            id,
            name_len: t.name_len,
            name: t.name,
            state: t.state,
            priority: t.priority,
            base_priority: t.base_priority,
            privilege: t.privilege,
            run_count: t.run_count,
            runtime_ticks: t.runtime_ticks,
            cpu_usage_permille: t.cpu_usage_permille,
        }))
    }

    pub(crate) fn current_id<P: Port>(&self, guard: &CpuLockGuard<'_, P>) -> Option<TaskId> {
        let idx = self.current.with(guard, |c| *c)?;
        let tcb = self.slots[idx].snapshot();
        Some(TaskId::new(idx, tcb.generation))
    }

    fn current_slot<P: Port>(&self, guard: &CpuLockGuard<'_, P>) -> Option<usize> {
        self.current.with(guard, |c| *c)
    }

    fn privilege_of<P: Port>(&self, guard: &CpuLockGuard<'_, P>, slot: usize) -> Privilege {
        self.slots[slot].with(guard, |t| t.privilege)
    }

    /// Require that the currently running task (or ISR context) carries
    /// `required`. A violation is a non-fatal warning; the call simply
    /// returns `PermissionDenied`.
    pub(crate) fn require_privilege<P: Port>(
        &self,
        guard: &CpuLockGuard<'_, P>,
        in_isr: bool,
        required: Privilege,
    ) -> KResult<()> {
        if in_isr {
            return Ok(());
        }
        if let Some(p) = self.signal_privilege.with(guard, |o| *o) {
            return if p.has(required) {
                Ok(())
            } else {
                Err(KernelError::PermissionDenied)
            };
        }
        #[cfg(test)]
        if let Some(p) = self.privilege_override.with(guard, |o| *o) {
            return if p.has(required) {
                Ok(())
            } else {
                Err(KernelError::PermissionDenied)
            };
        }
        let Some(slot) = self.current_slot(guard) else {
            return Err(KernelError::BadContext);
        };
        if self.privilege_of(guard, slot).has(required) {
            Ok(())
        } else {
            log::warn!("permission denied: task in slot {slot} lacks {required:?}");
            Err(KernelError::PermissionDenied)
        }
    }

    /// Temporarily raise `id`'s effective (scheduling) priority without
    /// touching its nominal `base_priority`, used by the mutex's priority
    /// inheritance path. No privilege check: this is an internal kernel
    /// mechanism, not a user-facing operation.
    pub(crate) fn boost_priority<P: Port>(
        &self,
        guard: &CpuLockGuard<'_, P>,
        id: TaskId,
        new_priority: u8,
    ) -> KResult<()> {
        let slot = self.resolve(id)?;
        self.slots[slot].with(guard, |t| {
            if new_priority < t.priority {
                t.priority = new_priority;
            }
        });
        Ok(())
    }

    /// Undo [`TaskTable::boost_priority`]: restore `id`'s effective priority
    /// to its nominal `base_priority`.
    pub(crate) fn restore_priority<P: Port>(&self, guard: &CpuLockGuard<'_, P>, id: TaskId) -> KResult<()> {
        let slot = self.resolve(id)?;
        self.slots[slot].with(guard, |t| t.priority = t.base_priority);
        Ok(())
    }

    /// Temporarily give the signal daemon's own dispatch context `privilege`,
    /// for the duration of one subscriber handler call, returning whatever
    /// override (if any) was already active so nested restore is exact.
    /// Mirrors [`TaskTable::boost_priority`]'s save-then-overwrite shape, but
    /// against a dedicated cell rather than a TCB field: the signal daemon
    /// is a real scheduled task on hardware, but this crate's `dispatch`
    /// never runs a task's entry point in software (see `kernel.rs`'s boot
    /// sequence doc), so there is no "current task" slot to mutate outside
    /// a real port. No privilege check: an internal kernel mechanism, called
    /// only from the signal daemon's own dispatch loop.
    pub(crate) fn boost_signal_privilege<P: Port>(
        &self,
        guard: &CpuLockGuard<'_, P>,
        privilege: Privilege,
    ) -> Option<Privilege> {
        self.signal_privilege.with(guard, |o| o.replace(privilege))
    }

    /// Undo [`TaskTable::boost_signal_privilege`], restoring whatever
    /// override (if any) was active before.
    pub(crate) fn restore_signal_privilege<P: Port>(&self, guard: &CpuLockGuard<'_, P>, prior: Option<Privilege>) {
        self.signal_privilege.with(guard, |o| *o = prior);
    }

    pub(crate) fn set_priority<P: Port>(
        &self,
        guard: &CpuLockGuard<'_, P>,
        id: TaskId,
        priority: u8,
    ) -> KResult<()> {
        self.require_privilege(guard, false, Privilege::TASK_MANIPULATE)?;
        let slot = self.resolve(id)?;
        self.slots[slot].with(guard, |t| {
            if t.state == TaskState::Zombie {
                return Err(KernelError::StateViolation);
            }
            t.priority = priority;
            t.base_priority = priority;
            Ok(())
        })
    }

    pub(crate) fn suspend<P: Port>(&self, guard: &CpuLockGuard<'_, P>, id: TaskId) -> KResult<()> {
        self.require_privilege(guard, false, Privilege::TASK_MANIPULATE)?;
        let slot = self.resolve(id)?;
        self.slots[slot].with(guard, |t| {
            if t.state == TaskState::Zombie || t.state == TaskState::Suspended {
                return Err(KernelError::StateViolation);
            }
            t.prior_state = t.state;
            t.state = TaskState::Suspended;
            Ok(())
        })?;
        log::debug!("task slot {slot} suspended");
        Ok(())
    }

    pub(crate) fn resume<P: Port>(&self, guard: &CpuLockGuard<'_, P>, id: TaskId) -> KResult<()> {
        self.require_privilege(guard, false, Privilege::TASK_MANIPULATE)?;
        let slot = self.resolve(id)?;
        self.slots[slot].with(guard, |t| {
            if t.state != TaskState::Suspended {
                return Err(KernelError::StateViolation);
            }
            t.state = t.prior_state;
            Ok(())
        })?;
        log::debug!("task slot {slot} resumed");
        Ok(())
    }

    pub(crate) fn delete<P: Port>(&self, guard: &CpuLockGuard<'_, P>, id: TaskId) -> KResult<()> {
        self.require_privilege(guard, false, Privilege::TASK_MANIPULATE)?;
        let slot = self.resolve(id)?;
        self.slots[slot].with(guard, |t| {
            if t.state == TaskState::Zombie {
                return Err(KernelError::StateViolation);
            }
            t.state = TaskState::Zombie;
            Ok(())
        })?;
        log::debug!("task slot {slot} deleted");
        Ok(())
    }

    /// Put `id` (ordinarily the caller itself) to sleep for `ms` ticks.
    pub(crate) fn sleep<P: Port>(&self, guard: &CpuLockGuard<'_, P>, id: TaskId, ms: u32) -> KResult<()> {
        let slot = self.resolve(id)?;
        self.slots[slot].with(guard, |t| {
            if t.state == TaskState::Zombie {
                return Err(KernelError::StateViolation);
            }
            t.state = TaskState::Sleeping;
            t.sleep_ticks = ms;
            Ok(())
        })
    }

    /// `block(tid, timeout_ms)`: the target task (usually, but not
    /// necessarily, the caller itself) becomes Blocked.
    pub(crate) fn block<P: Port>(
        &self,
        guard: &CpuLockGuard<'_, P>,
        id: TaskId,
        timeout_ms: u32,
    ) -> KResult<()> {
        let slot = self.resolve(id)?;
        self.slots[slot].with(guard, |t| {
            if t.state == TaskState::Zombie {
                return Err(KernelError::StateViolation);
            }
            t.state = TaskState::Blocked;
            t.block_ticks = timeout_ms;
            t.timed_out = false;
            Ok(())
        })
    }

    /// `unblock(tid)`: explicit wake, distinct from a timeout wake.
    pub(crate) fn unblock<P: Port>(&self, guard: &CpuLockGuard<'_, P>, id: TaskId) -> KResult<()> {
        let slot = self.resolve(id)?;
        self.slots[slot].with(guard, |t| {
            if t.state != TaskState::Blocked {
                return Err(KernelError::StateViolation);
            }
            t.state = TaskState::Ready;
            t.timed_out = false;
            Ok(())
        })
    }

    /// Whether the most recent Blocked -> Ready transition for `id` was a
    /// timeout rather than an explicit unblock.
    pub(crate) fn timed_out<P: Port>(&self, guard: &CpuLockGuard<'_, P>, id: TaskId) -> KResult<bool> {
        let slot = self.resolve(id)?;
        Ok(self.slots[slot].with(guard, |t| t.timed_out))
    }

    pub(crate) fn state_of<P: Port>(&self, guard: &CpuLockGuard<'_, P>, id: TaskId) -> KResult<TaskState> {
        let slot = self.resolve(id)?;
        Ok(self.slots[slot].with(guard, |t| t.state))
    }

    /// Tick handler: run once per millisecond from interrupt
    /// context. Advances sleep/block countdowns and the system tick
    /// counter; does not itself request a reschedule (the caller, i.e.
    /// [`crate::kernel::Kernel::on_tick`], does that after releasing the
    /// lock).
    pub(crate) fn tick<P: Port>(&self, guard: &CpuLockGuard<'_, P>) {
        self.sys_ticks.with(guard, |t| *t += 1);
        for cell in self.slots.iter() {
            cell.with(guard, |t| match t.state {
                TaskState::Sleeping => {
                    t.sleep_ticks = t.sleep_ticks.saturating_sub(1);
                    if t.sleep_ticks == 0 {
                        t.state = TaskState::Ready;
                    }
                }
                TaskState::Blocked if t.block_ticks != BLOCK_FOREVER => {
                    t.block_ticks = t.block_ticks.saturating_sub(1);
                    if t.block_ticks == 0 {
                        t.state = TaskState::Ready;
                        t.timed_out = true;
                    }
                }
                _ => {}
            });
        }
    }

    pub(crate) fn sys_ticks<P: Port>(&self, guard: &CpuLockGuard<'_, P>) -> u64 {
        self.sys_ticks.with(guard, |t| *t)
    }

    /// Scheduler selection: O(N) scan, numerically-lowest-priority
    /// wins, round-robin among ties via a rotating start index.
    pub(crate) fn pick_next<P: Port>(&self, guard: &CpuLockGuard<'_, P>) -> usize {
        let start = self.rr_cursor.with(guard, |c| *c);
        let mut best_slot = None;
        let mut best_priority = u8::MAX;
        for i in 0..MAX_TASKS {
            let idx = (start + i) % MAX_TASKS;
            let (state, priority) = self.slots[idx].with(guard, |t| (t.state, t.priority));
            if state == TaskState::Ready && priority < best_priority {
                best_priority = priority;
                best_slot = Some(idx);
            }
        }
        let chosen = best_slot.expect("idle task is always Ready and is a valid fallback");
        self.rr_cursor.with(guard, |c| *c = (chosen + 1) % MAX_TASKS);
        self.slots[chosen].with(guard, |t| {
            t.run_count += 1;
        });
        self.current.with(guard, |c| *c = Some(chosen));
        log::trace!("scheduler selected slot {chosen}");
        chosen
    }

    /// Account CPU time consumed by the outgoing task since its slice
    /// began, and mark the slice start for the incoming one.
    pub(crate) fn account_switch<P: Port>(
        &self,
        guard: &CpuLockGuard<'_, P>,
        outgoing: Option<usize>,
        incoming: usize,
        now_ms: u64,
    ) {
        if let Some(out) = outgoing {
            self.slots[out].with(guard, |t| {
                t.runtime_ticks += now_ms.saturating_sub(t.slice_start_ticks);
            });
        }
        self.slots[incoming].with(guard, |t| t.slice_start_ticks = now_ms);
    }

    /// Recompute each task's CPU-usage permille over the window since the
    /// last reset. `reset` zeroes the running tally afterwards, starting a
    /// fresh accounting window; without it this is a non-destructive peek
    /// at the current window's figures so far.
    pub(crate) fn recalculate_cpu_usage<P: Port>(&self, guard: &CpuLockGuard<'_, P>, window_ms: u64, reset: bool) {
        if window_ms == 0 {
            return;
        }
        for cell in self.slots.iter() {
            cell.with(guard, |t| {
                if t.state == TaskState::Zombie {
                    return;
                }
                let permille = (t.runtime_ticks.saturating_mul(1000) / window_ms).min(1000) as u16;
                t.cpu_usage_permille = permille;
                if reset {
                    t.runtime_ticks = 0;
                }
            });
        }
    }

    pub(crate) fn psp<P: Port>(&self, guard: &CpuLockGuard<'_, P>, slot: usize) -> usize {
        self.slots[slot].with(guard, |t| t.psp)
    }

    pub(crate) fn set_psp<P: Port>(&self, guard: &CpuLockGuard<'_, P>, slot: usize, sp: usize) {
        self.slots[slot].with(guard, |t| t.psp = sp);
    }

    pub(crate) fn entry_of<P: Port>(&self, guard: &CpuLockGuard<'_, P>, slot: usize) -> Option<TaskEntry> {
        self.slots[slot].with(guard, |t| t.entry)
    }
}
