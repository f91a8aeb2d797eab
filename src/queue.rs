//! Bounded, named queues shared by multiple producer tasks and drained by
//! a single consumer. Elements may vary in length up to [`MAX_QUEUE_LENGTH`]
//! bytes; each slot remembers the length it was written with so `get`/`peek`
//! copy back exactly that many bytes regardless of what any other slot in
//! the same queue holds.
//!
//! Each queue is a ring buffer that deliberately never fills its backing
//! array completely: one slot is always left empty so `write == read`
//! unambiguously means "empty" (it can never also mean "full"). The
//! trade-off is one wasted element slot per queue in exchange for a branch
//! -free full/empty test, a bargain worth taking at these table sizes.

use crate::config::{
    BLOCK_FOREVER, MAX_QUEUES, MAX_QUEUE_ELEMENTS, MAX_QUEUE_LENGTH, MAX_QUEUE_NAME_LENGTH,
    MUTEX_RETRY_MS,
};
use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::klock::KCell;
use crate::port::Port;
use crate::task::TaskId;

const INVALID_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(u16);

impl QueueId {
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

/// Invoked (outside any lock) the instant a `put` leaves the queue full, or
/// a `get` leaves it empty. Bare function pointers, consistent with every
/// other callback in this crate, so queues stay usable without an
/// allocator.
pub type QueueHook = fn(QueueId);

#[derive(Clone, Copy)]
struct QueueSlot {
    in_use: bool,
    generation: u8,
    name: [u8; MAX_QUEUE_NAME_LENGTH],
    name_len: u8,
    /// Usable capacity (<= `MAX_QUEUE_ELEMENTS - 1`; one slot is reserved).
    capacity: usize,
    data: [[u8; MAX_QUEUE_LENGTH]; MAX_QUEUE_ELEMENTS],
    /// Length the element at the matching index in `data` was written with.
    lengths: [usize; MAX_QUEUE_ELEMENTS],
    write: usize,
    read: usize,
    on_full: Option<QueueHook>,
    on_empty: Option<QueueHook>,
}

impl QueueSlot {
    const FREE: Self = Self {
        in_use: false,
        generation: 0,
        name: [0; MAX_QUEUE_NAME_LENGTH],
        name_len: 0,
        capacity: 0,
        data: [[0; MAX_QUEUE_LENGTH]; MAX_QUEUE_ELEMENTS],
        lengths: [0; MAX_QUEUE_ELEMENTS],
        write: 0,
        read: 0,
        on_full: None,
        on_empty: None,
    };

    fn is_empty(&self) -> bool {
        self.write == self.read
    }

    fn is_full(&self) -> bool {
        (self.write + 1) % MAX_QUEUE_ELEMENTS == self.read
    }

    fn len(&self) -> usize {
        if self.write >= self.read {
            self.write - self.read
        } else {
            MAX_QUEUE_ELEMENTS - self.read + self.write
        }
    }
}

pub(crate) struct QueueTable {
    slots: [KCell<QueueSlot>; MAX_QUEUES],
    next_generation: core::sync::atomic::AtomicU8,
}

impl QueueTable {
    pub(crate) const fn new() -> Self {
        const FREE_CELL: KCell<QueueSlot> = KCell::new(QueueSlot::FREE);
        Self {
            slots: [FREE_CELL; MAX_QUEUES],
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

    fn resolve(&self, id: QueueId) -> KResult<usize> {
        if id == QueueId::INVALID {
            return Err(KernelError::NotFound);
        }
        let slot = id.slot();
        if slot >= MAX_QUEUES {
            return Err(KernelError::NotFound);
        }
        let matches = self.slots[slot].snapshot();
        if matches.in_use && matches.generation == id.generation() {
            Ok(slot)
        } else {
            Err(KernelError::NotFound)
        }
    }

    fn id_by_name(&self, name: &str) -> KResult<QueueId> {
        for (slot, cell) in self.slots.iter().enumerate() {
            let snap = cell.snapshot();
            if snap.in_use && &snap.name[..snap.name_len as usize] == name.as_bytes() {
                return Ok(QueueId::new(slot, snap.generation));
            }
        }
        Err(KernelError::NotFound)
    }
}

impl<P: Port> Kernel<P> {
    pub fn queue_create(
        &self,
        name: &str,
        capacity: usize,
        on_full: Option<QueueHook>,
        on_empty: Option<QueueHook>,
    ) -> KResult<QueueId> {
        if capacity == 0 || capacity > MAX_QUEUE_ELEMENTS - 1 || name.len() > MAX_QUEUE_NAME_LENGTH {
            return Err(KernelError::InvalidArgument);
        }
        let table = self.queues();
        let guard = self.lock();
        for (slot, cell) in table.slots.iter().enumerate() {
            let free = cell.with(&guard, |q| !q.in_use);
            if !free {
                continue;
            }
            let generation = table.mint_generation();
            let mut stored_name = [0u8; MAX_QUEUE_NAME_LENGTH];
            stored_name[..name.len()].copy_from_slice(name.as_bytes());
            cell.with(&guard, |q| {
                *q = QueueSlot {
                    in_use: true,
                    generation,
                    name: stored_name,
                    name_len: name.len() as u8,
                    capacity,
                    data: QueueSlot::FREE.data,
                    lengths: QueueSlot::FREE.lengths,
                    write: 0,
                    read: 0,
                    on_full,
                    on_empty,
                };
            });
            log::debug!("queue {name} created in slot {slot}");
            return Ok(QueueId::new(slot, generation));
        }
        Err(KernelError::Capacity)
    }

    /// Non-blocking attempt to push `payload` onto the queue. Refuses a
    /// payload longer than [`MAX_QUEUE_LENGTH`]; anything up to that bound
    /// is accepted and its length recorded per-slot, so elements in the
    /// same queue may differ in length.
    pub fn queue_try_put(&self, id: QueueId, payload: &[u8]) -> KResult<()> {
        let table = self.queues();
        let slot = table.resolve(id)?;
        let guard = self.lock();
        let cell = &table.slots[slot];
        let outcome = cell.with(&guard, |q| {
            if payload.len() > MAX_QUEUE_LENGTH {
                return Err(KernelError::InvalidArgument);
            }
            if q.is_full() || q.len() >= q.capacity {
                return Err(KernelError::Full);
            }
            q.data[q.write][..payload.len()].copy_from_slice(payload);
            q.lengths[q.write] = payload.len();
            q.write = (q.write + 1) % MAX_QUEUE_ELEMENTS;
            Ok(q.is_full())
        });
        let became_full = outcome?;
        if became_full {
            if let Some(hook) = cell.snapshot().on_full {
                hook(id);
            }
        }
        Ok(())
    }

    /// Blocking push: retries at [`MUTEX_RETRY_MS`] granularity while full.
    pub fn queue_put(&self, id: QueueId, caller: TaskId, payload: &[u8], timeout_ms: u32) -> KResult<()> {
        let start = self.kernel_get_sys_ticks();
        loop {
            match self.queue_try_put(id, payload) {
                Ok(()) => return Ok(()),
                Err(KernelError::Full) => {}
                Err(e) => return Err(e),
            }
            if timeout_ms != BLOCK_FOREVER {
                let elapsed = self.kernel_get_sys_ticks().saturating_sub(start);
                if elapsed >= timeout_ms as u64 {
                    return Err(KernelError::Timeout);
                }
            }
            self.sleep(caller, MUTEX_RETRY_MS)?;
            self.wait_until_ready(caller)?;
        }
    }

    /// Non-blocking attempt to pop the oldest element into `out`, returning
    /// the number of bytes written. Fails if `out` is smaller than the
    /// length that particular element was written with.
    pub fn queue_try_get(&self, id: QueueId, out: &mut [u8]) -> KResult<usize> {
        let table = self.queues();
        let slot = table.resolve(id)?;
        let guard = self.lock();
        let cell = &table.slots[slot];
        let outcome = cell.with(&guard, |q| {
            if q.is_empty() {
                return Err(KernelError::Empty);
            }
            let elem_len = q.lengths[q.read];
            if out.len() < elem_len {
                return Err(KernelError::InvalidArgument);
            }
            out[..elem_len].copy_from_slice(&q.data[q.read][..elem_len]);
            q.read = (q.read + 1) % MAX_QUEUE_ELEMENTS;
            Ok((elem_len, q.is_empty()))
        });
        let (n, became_empty) = outcome?;
        if became_empty {
            if let Some(hook) = cell.snapshot().on_empty {
                hook(id);
            }
        }
        Ok(n)
    }

    pub fn queue_get(&self, id: QueueId, caller: TaskId, out: &mut [u8], timeout_ms: u32) -> KResult<usize> {
        let start = self.kernel_get_sys_ticks();
        loop {
            match self.queue_try_get(id, out) {
                Ok(n) => return Ok(n),
                Err(KernelError::Empty) => {}
                Err(e) => return Err(e),
            }
            if timeout_ms != BLOCK_FOREVER {
                let elapsed = self.kernel_get_sys_ticks().saturating_sub(start);
                if elapsed >= timeout_ms as u64 {
                    return Err(KernelError::Timeout);
                }
            }
            self.sleep(caller, MUTEX_RETRY_MS)?;
            self.wait_until_ready(caller)?;
        }
    }

    /// Non-consuming read of the oldest element.
    pub fn queue_peek(&self, id: QueueId, out: &mut [u8]) -> KResult<usize> {
        let table = self.queues();
        let slot = table.resolve(id)?;
        let guard = self.lock();
        table.slots[slot].with(&guard, |q| {
            if q.is_empty() {
                return Err(KernelError::Empty);
            }
            let elem_len = q.lengths[q.read];
            if out.len() < elem_len {
                return Err(KernelError::InvalidArgument);
            }
            out[..elem_len].copy_from_slice(&q.data[q.read][..elem_len]);
            Ok(elem_len)
        })
    }

    pub fn queue_reset(&self, id: QueueId) -> KResult<()> {
        let table = self.queues();
        let slot = table.resolve(id)?;
        let guard = self.lock();
        table.slots[slot].with(&guard, |q| {
            q.write = 0;
            q.read = 0;
        });
        Ok(())
    }

    pub fn queue_len(&self, id: QueueId) -> KResult<usize> {
        let table = self.queues();
        let slot = table.resolve(id)?;
        Ok(table.slots[slot].snapshot().len())
    }

    pub fn queue_by_name(&self, name: &str) -> KResult<QueueId> {
        self.queues().id_by_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::Privilege;
    use crate::task::TaskDescriptor;
    use crate::test_support::new_test_kernel;

    #[test]
    fn create_rejects_oversized_capacity() {
        let k = new_test_kernel();
        assert_eq!(
            k.queue_create("q", MAX_QUEUE_ELEMENTS, None, None).unwrap_err(),
            KernelError::InvalidArgument
        );
    }

    #[test]
    fn put_rejects_payload_over_the_global_length_cap() {
        let k = new_test_kernel();
        let q = k.queue_create("q", 4, None, None).unwrap();
        let oversized = [0u8; MAX_QUEUE_LENGTH + 1];
        assert_eq!(k.queue_try_put(q, &oversized).unwrap_err(), KernelError::InvalidArgument);
    }

    #[test]
    fn put_get_round_trip_preserves_fifo_order() {
        let k = new_test_kernel();
        let q = k.queue_create("q", 4, None, None).unwrap();
        k.queue_try_put(q, b"aaaa").unwrap();
        k.queue_try_put(q, b"bbbb").unwrap();
        let mut buf = [0u8; 4];
        k.queue_try_get(q, &mut buf).unwrap();
        assert_eq!(&buf, b"aaaa");
        k.queue_try_get(q, &mut buf).unwrap();
        assert_eq!(&buf, b"bbbb");
    }

    #[test]
    fn elements_may_vary_in_length_within_one_queue() {
        let k = new_test_kernel();
        let q = k.queue_create("q", 4, None, None).unwrap();
        k.queue_try_put(q, b"a").unwrap();
        k.queue_try_put(q, b"bbbb").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(k.queue_try_get(q, &mut buf).unwrap(), 1);
        assert_eq!(&buf[..1], b"a");
        assert_eq!(k.queue_try_get(q, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"bbbb");
    }

    #[test]
    fn get_rejects_a_buffer_smaller_than_the_stored_elements_length() {
        let k = new_test_kernel();
        let q = k.queue_create("q", 4, None, None).unwrap();
        k.queue_try_put(q, b"bbbb").unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(k.queue_try_get(q, &mut buf).unwrap_err(), KernelError::InvalidArgument);
    }

    #[test]
    fn full_queue_rejects_try_put_and_invokes_hook() {
        static HIT: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);
        fn on_full(_id: QueueId) {
            HIT.store(true, core::sync::atomic::Ordering::SeqCst);
        }
        let k = new_test_kernel();
        let q = k.queue_create("q", 2, Some(on_full), None).unwrap();
        k.queue_try_put(q, b"a").unwrap();
        k.queue_try_put(q, b"b").unwrap();
        assert!(HIT.load(core::sync::atomic::Ordering::SeqCst));
        assert_eq!(k.queue_try_put(q, b"c").unwrap_err(), KernelError::Full);
    }

    #[test]
    fn empty_queue_rejects_try_get_and_invokes_hook() {
        static HIT: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);
        fn on_empty(_id: QueueId) {
            HIT.store(true, core::sync::atomic::Ordering::SeqCst);
        }
        let k = new_test_kernel();
        let q = k.queue_create("q", 2, None, Some(on_empty)).unwrap();
        k.queue_try_put(q, b"a").unwrap();
        let mut buf = [0u8; 1];
        k.queue_try_get(q, &mut buf).unwrap();
        assert!(HIT.load(core::sync::atomic::Ordering::SeqCst));
        assert_eq!(k.queue_try_get(q, &mut buf).unwrap_err(), KernelError::Empty);
    }

    #[test]
    fn blocking_put_times_out_while_full() {
        let k = new_test_kernel();
        let a = k
            .register_task(&TaskDescriptor {
                name: "a",
                entry: || {},
                stack_base: 0x1000,
                stack_size: 512,
                priority: 10,
                privilege: Privilege::USER,
            })
            .unwrap();
        let q = k.queue_create("q", 1, None, None).unwrap();
        k.queue_try_put(q, b"a").unwrap();
        assert_eq!(k.queue_put(q, a, b"b", 5).unwrap_err(), KernelError::Timeout);
    }

    #[test]
    fn reset_empties_the_queue() {
        let k = new_test_kernel();
        let q = k.queue_create("q", 2, None, None).unwrap();
        k.queue_try_put(q, b"a").unwrap();
        k.queue_reset(q).unwrap();
        assert_eq!(k.queue_len(q).unwrap(), 0);
    }

    #[test]
    fn by_name_finds_a_created_queue() {
        let k = new_test_kernel();
        let q = k.queue_create("widgets", 2, None, None).unwrap();
        assert_eq!(k.queue_by_name("widgets").unwrap(), q);
        assert_eq!(k.queue_by_name("missing").unwrap_err(), KernelError::NotFound);
    }

    #[test]
    fn peek_does_not_consume() {
        let k = new_test_kernel();
        let q = k.queue_create("q", 2, None, None).unwrap();
        k.queue_try_put(q, b"a").unwrap();
        let mut buf = [0u8; 1];
        k.queue_peek(q, &mut buf).unwrap();
        assert_eq!(k.queue_len(q).unwrap(), 1);
    }
}
