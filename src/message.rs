//! Inter-task message broker: publishers `tx` payloads tagged with a
//! numeric id, receivers `rx` with a filter of ids they accept. Delivery
//! is not immediate — a dedicated broker task, woken every
//! [`MESSAGE_POLL_MS`], matches waiting receivers against in-flight
//! messages and performs the actual copy and wakeup. `rx` itself just
//! installs a waiter record and blocks; it never touches a message
//! directly.
//!
//! Message id `0` is reserved and is never delivered, matching the pool's
//! use of `0` as "this message id is unset" in diagnostics.

use crate::config::{MAX_MESSAGES, MAX_MESSAGE_LENGTH, MAX_WAITERS, MAX_WAITER_IDS, MESSAGE_POLL_MS};
use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::klock::KCell;
use crate::port::Port;
use crate::task::TaskId;

const RESERVED_ID: u16 = 0;

#[derive(Clone, Copy)]
struct MessageSlot {
    active: bool,
    id: u16,
    len: usize,
    payload: [u8; MAX_MESSAGE_LENGTH],
}

impl MessageSlot {
    const FREE: Self = Self { active: false, id: RESERVED_ID, len: 0, payload: [0; MAX_MESSAGE_LENGTH] };
}

#[derive(Clone, Copy)]
struct WaiterSlot {
    active: bool,
    task: Option<TaskId>,
    /// Zero-terminated list of ids this receiver accepts.
    id_filter: [u16; MAX_WAITER_IDS],
    timeout_ms: u32,
    elapsed_ms: u32,
    served: bool,
    done: bool,
    matched_id: u16,
    payload: [u8; MAX_MESSAGE_LENGTH],
    payload_len: usize,
}

impl WaiterSlot {
    const FREE: Self = Self {
        active: false,
        task: None,
        id_filter: [RESERVED_ID; MAX_WAITER_IDS],
        timeout_ms: 0,
        elapsed_ms: 0,
        served: false,
        done: false,
        matched_id: RESERVED_ID,
        payload: [0; MAX_MESSAGE_LENGTH],
        payload_len: 0,
    };
}

pub(crate) struct MessageBroker {
    messages: [KCell<MessageSlot>; MAX_MESSAGES],
    waiters: [KCell<WaiterSlot>; MAX_WAITERS],
    next_message_index: KCell<usize>,
    next_waiter_index: KCell<usize>,
    /// Tick of the last completed daemon pass, so a daemon driven from a
    /// tight poll loop still only matches/accounts once per
    /// [`MESSAGE_POLL_MS`] of simulated time, same as the real interrupt
    /// cadence would.
    last_run_ticks: KCell<u64>,
}

impl MessageBroker {
    pub(crate) const fn new() -> Self {
        const FREE_MSG: KCell<MessageSlot> = KCell::new(MessageSlot::FREE);
        const FREE_WAITER: KCell<WaiterSlot> = KCell::new(WaiterSlot::FREE);
        Self {
            messages: [FREE_MSG; MAX_MESSAGES],
            waiters: [FREE_WAITER; MAX_WAITERS],
            next_message_index: KCell::new(0),
            next_waiter_index: KCell::new(0),
            last_run_ticks: KCell::new(0),
        }
    }

    pub(crate) fn in_flight_count<P: Port>(&self, kernel: &Kernel<P>) -> usize {
        let guard = kernel.lock();
        self.messages.iter().filter(|c| c.with(&guard, |m| m.active)).count()
    }
}

impl<P: Port> Kernel<P> {
    /// Publish `payload` under `id`. `id` 0 is reserved and rejected.
    pub fn message_tx(&self, id: u16, payload: &[u8]) -> KResult<()> {
        if id == RESERVED_ID || payload.len() > MAX_MESSAGE_LENGTH {
            return Err(KernelError::InvalidArgument);
        }
        let broker = self.messages();
        let guard = self.lock();
        let start = broker.next_message_index.with(&guard, |i| *i);
        for offset in 0..MAX_MESSAGES {
            let slot = (start + offset) % MAX_MESSAGES;
            let cell = &broker.messages[slot];
            let took = cell.with(&guard, |m| {
                if m.active {
                    return false;
                }
                let mut stored = [0u8; MAX_MESSAGE_LENGTH];
                stored[..payload.len()].copy_from_slice(payload);
                *m = MessageSlot { active: true, id, len: payload.len(), payload: stored };
                true
            });
            if took {
                broker
                    .next_message_index
                    .with(&guard, |i| *i = (slot + 1) % MAX_MESSAGES);
                log::debug!("message id {id} published");
                return Ok(());
            }
        }
        Err(KernelError::Full)
    }

    /// Block `caller` until a message matching one of `id_filter` arrives,
    /// or `timeout_ms` elapses. The actual match/copy/wake happens on the
    /// broker's own schedule (see [`Kernel::run_message_daemon_once`]); this
    /// call only installs the waiter and parks.
    pub fn message_rx(&self, caller: TaskId, id_filter: &[u16], out: &mut [u8], timeout_ms: u32) -> KResult<(u16, usize)> {
        if id_filter.is_empty() || id_filter.len() > MAX_WAITER_IDS - 1 || id_filter.contains(&RESERVED_ID) {
            return Err(KernelError::InvalidArgument);
        }
        let broker = self.messages();
        let slot = {
            let guard = self.lock();
            let start = broker.next_waiter_index.with(&guard, |i| *i);
            let mut found = None;
            for offset in 0..MAX_WAITERS {
                let candidate = (start + offset) % MAX_WAITERS;
                let free = broker.waiters[candidate].with(&guard, |w| !w.active);
                if free {
                    found = Some(candidate);
                    break;
                }
            }
            let Some(slot) = found else { return Err(KernelError::Full) };
            let mut filter = [RESERVED_ID; MAX_WAITER_IDS];
            filter[..id_filter.len()].copy_from_slice(id_filter);
            broker.waiters[slot].with(&guard, |w| {
                *w = WaiterSlot { active: true, task: Some(caller), id_filter: filter, timeout_ms, ..WaiterSlot::FREE };
            });
            let mut next = (slot + 1) % MAX_WAITERS;
            while broker.waiters[next].with(&guard, |w| w.active) && next != slot {
                next = (next + 1) % MAX_WAITERS;
            }
            broker.next_waiter_index.with(&guard, |i| *i = next);
            slot
        };

        self.block(caller, crate::config::BLOCK_FOREVER)?;
        let wait_result = self.wait_until_ready(caller);

        let (served, matched_id, payload_len, payload) = {
            let guard = self.lock();
            broker.waiters[slot].with(&guard, |w| {
                let result = (w.served, w.matched_id, w.payload_len, w.payload);
                *w = WaiterSlot::FREE;
                result
            })
        };
        wait_result?;
        if !served {
            return Err(KernelError::Timeout);
        }
        if out.len() < payload_len {
            return Err(KernelError::InvalidArgument);
        }
        out[..payload_len].copy_from_slice(&payload[..payload_len]);
        Ok((matched_id, payload_len))
    }

    /// One pass of the broker's matching logic: waiters are served in array
    /// order, and for each waiter the in-flight messages are scanned in slot
    /// order, with the first one whose id appears anywhere in the waiter's
    /// filter winning the match — filter position only decides which ids are
    /// accepted, not which accepted id is preferred. One match per waiter
    /// per pass, then elapsed time is accounted against waiters still
    /// unserved. Runs at [`MESSAGE_DAEMON_PRIORITY`] on real hardware;
    /// exposed directly here since this kernel never invokes a task's entry
    /// point in software (that is the port's job when it constructs a
    /// task's initial stack frame).
    ///
    /// [`MESSAGE_DAEMON_PRIORITY`]: crate::config::MESSAGE_DAEMON_PRIORITY
    pub(crate) fn run_message_daemon_once(&self) {
        let broker = self.messages();
        let now = self.kernel_get_sys_ticks();
        {
            let guard = self.lock();
            let due = broker.last_run_ticks.with(&guard, |t| {
                if now.saturating_sub(*t) < MESSAGE_POLL_MS as u64 {
                    false
                } else {
                    *t = now;
                    true
                }
            });
            if !due {
                return;
            }
        }
        let guard = self.lock();
        for waiter_cell in broker.waiters.iter() {
            let outcome = waiter_cell.with(&guard, |w| {
                if !w.active || w.done {
                    return None;
                }
                let wanted = &w.id_filter[..];
                for msg_cell in broker.messages.iter() {
                    let matched = msg_cell.with(&guard, |m| {
                        if m.active
                            && wanted
                                .iter()
                                .take_while(|id| **id != RESERVED_ID)
                                .any(|id| *id == m.id)
                        {
                            m.active = false;
                            Some((m.id, m.len, m.payload))
                        } else {
                            None
                        }
                    });
                    if let Some((id, len, payload)) = matched {
                        w.served = true;
                        w.done = true;
                        w.matched_id = id;
                        w.payload_len = len;
                        w.payload = payload;
                        return Some(w.task);
                    }
                }
                if w.timeout_ms != crate::config::BLOCK_FOREVER {
                    w.elapsed_ms += MESSAGE_POLL_MS;
                    if w.elapsed_ms > w.timeout_ms {
                        w.done = true;
                        w.served = false;
                        return Some(w.task);
                    }
                }
                None
            });
            if let Some(Some(task)) = outcome {
                let _ = self.unblock(task);
            }
        }
    }

    pub fn message_in_flight_count(&self) -> usize {
        self.messages().in_flight_count(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::Privilege;
    use crate::task::TaskDescriptor;
    use crate::test_support::new_test_kernel;

    fn spawn(k: &Kernel<crate::test_support::TestPort>, name: &'static str) -> TaskId {
        k.register_task(&TaskDescriptor {
            name,
            entry: || {},
            stack_base: 0x1000,
            stack_size: 512,
            priority: 10,
            privilege: Privilege::USER,
        })
        .unwrap()
    }

    #[test]
    fn tx_rejects_reserved_id_or_oversized_payload() {
        let k = new_test_kernel();
        assert_eq!(k.message_tx(0, b"x").unwrap_err(), KernelError::InvalidArgument);
        assert_eq!(
            k.message_tx(1, &[0u8; MAX_MESSAGE_LENGTH + 1]).unwrap_err(),
            KernelError::InvalidArgument
        );
    }

    #[test]
    fn matching_message_is_delivered_to_a_blocked_receiver() {
        let k = new_test_kernel();
        let r = spawn(&k, "r");
        k.message_tx(42, b"hi").unwrap();
        let mut buf = [0u8; MAX_MESSAGE_LENGTH];
        let (id, len) = k.message_rx(r, &[42], &mut buf, 1000).unwrap();
        assert_eq!(id, 42);
        assert_eq!(&buf[..len], b"hi");
    }

    #[test]
    fn earliest_slot_wins_over_filter_position() {
        let k = new_test_kernel();
        let r = spawn(&k, "r");
        // id 43 lands in the pool first, id 42 second, but the filter lists
        // 42 ahead of 43. Slot order decides the match, not filter order.
        k.message_tx(43, b"x").unwrap();
        k.message_tx(42, b"yy").unwrap();
        let mut buf = [0u8; MAX_MESSAGE_LENGTH];
        let (id, len) = k.message_rx(r, &[42, 43], &mut buf, 1000).unwrap();
        assert_eq!(id, 43);
        assert_eq!(&buf[..len], b"x");
    }

    #[test]
    fn filter_only_matches_listed_ids() {
        let k = new_test_kernel();
        let r = spawn(&k, "r");
        k.message_tx(7, b"wrong").unwrap();
        k.message_tx(9, b"right").unwrap();
        let mut buf = [0u8; MAX_MESSAGE_LENGTH];
        let (id, len) = k.message_rx(r, &[9], &mut buf, 1000).unwrap();
        assert_eq!(id, 9);
        assert_eq!(&buf[..len], b"right");
        // The id-7 message was never in this receiver's filter and is
        // still sitting in the pool.
        assert_eq!(k.message_in_flight_count(), 1);
    }

    #[test]
    fn rx_times_out_when_no_message_ever_matches() {
        let k = new_test_kernel();
        let r = spawn(&k, "r");
        let mut buf = [0u8; MAX_MESSAGE_LENGTH];
        let err = k.message_rx(r, &[1], &mut buf, 5).unwrap_err();
        assert_eq!(err, KernelError::Timeout);
    }

    #[test]
    fn waiter_table_exhaustion_reports_full() {
        let k = new_test_kernel();
        let broker = k.messages();
        // Fill every waiter slot directly; occupying them through
        // `message_rx` itself isn't possible here since that call blocks
        // the caller until served, and this harness has no second thread
        // to let one waiter install while another already parked.
        {
            let guard = k.lock();
            for cell in broker.waiters.iter() {
                cell.with(&guard, |w| w.active = true);
            }
        }
        let overflow = spawn(&k, "overflow");
        let mut buf = [0u8; MAX_MESSAGE_LENGTH];
        assert_eq!(
            k.message_rx(overflow, &[1], &mut buf, 5).unwrap_err(),
            KernelError::Full
        );
    }

    #[test]
    fn message_in_flight_count_reflects_pending_publishes() {
        let k = new_test_kernel();
        k.message_tx(1, b"a").unwrap();
        k.message_tx(2, b"b").unwrap();
        assert_eq!(k.message_in_flight_count(), 2);
    }

    #[test]
    fn pool_exhaustion_reports_full() {
        let k = new_test_kernel();
        for i in 1..=MAX_MESSAGES as u16 {
            k.message_tx(i, b"x").unwrap();
        }
        assert_eq!(k.message_tx(9999, b"x").unwrap_err(), KernelError::Full);
    }

    #[test]
    fn waiter_filter_rejects_reserved_id_or_empty_filter() {
        let k = new_test_kernel();
        let r = spawn(&k, "r");
        let mut buf = [0u8; MAX_MESSAGE_LENGTH];
        assert_eq!(k.message_rx(r, &[0], &mut buf, 0).unwrap_err(), KernelError::InvalidArgument);
        assert_eq!(k.message_rx(r, &[], &mut buf, 0).unwrap_err(), KernelError::InvalidArgument);
    }
}
