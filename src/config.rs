//! Compile-time configuration.
//!
//! These are plain `const`s rather than a Cargo-level configuration system:
//! the kernel is built once per target image, and every subsystem sizes its
//! static storage off of these values at compile time, so there is no
//! allocator and no runtime-resizable table anywhere in the crate.
//!
//! Two behavioral switches are Cargo features instead of `const bool`s,
//! because they change which code paths are compiled in at all:
//! `priority_inheritance` (`USE_PRIORITY_INHERITANCE`) and `cooperative`
//! (`SCHED_COOPERATIVE`).

/// Number of task control block slots in the task table.
pub const MAX_TASKS: usize = 32;

/// Maximum length, in bytes, of a task name (including no terminator; names
/// are stored as a byte array plus an explicit length).
pub const MAX_TASK_NAME: usize = 24;

/// Smallest stack size accepted at registration.
pub const MIN_STACK_SIZE: usize = 256;

/// Largest stack size accepted at registration.
pub const MAX_STACK_SIZE: usize = 16 * 1024;

/// Retry interval used by [`crate::mutex::Mutex::lock`] while contended.
pub const MUTEX_RETRY_MS: u32 = 2;

/// Maximum number of messages in flight in the message broker at once.
pub const MAX_MESSAGES: usize = 16;

/// Maximum payload length of a single message.
pub const MAX_MESSAGE_LENGTH: usize = 64;

/// Maximum number of concurrent receivers parked on the message broker.
pub const MAX_WAITERS: usize = 8;

/// Maximum number of ids in a single receiver's filter (plus the terminating
/// zero sentinel).
pub const MAX_WAITER_IDS: usize = 8;

/// Poll period of the message broker daemon.
pub const MESSAGE_POLL_MS: u32 = 50;

/// Maximum number of named queues.
pub const MAX_QUEUES: usize = 8;

/// Maximum number of elements held by a single queue.
pub const MAX_QUEUE_ELEMENTS: usize = 16;

/// Maximum length, in bytes, of a single queue element.
pub const MAX_QUEUE_LENGTH: usize = 32;

/// Maximum length of a queue's name.
pub const MAX_QUEUE_NAME_LENGTH: usize = 16;

/// Maximum number of signal slots.
pub const MAX_SIGNALS: usize = 16;

/// Maximum number of subscribers on a single signal.
pub const MAX_SIGNAL_SUBSCRIBERS: usize = 8;

/// Delay, in milliseconds, the fatal-error handler waits before resetting
/// the CPU (allows any in-flight trace output to drain).
pub const RESET_ON_ERROR_DELAY_MS: u32 = 100;

/// Sentinel meaning "block forever" for `block_ticks`/timeout arguments.
pub const BLOCK_FOREVER: u32 = 0xFFFF_FFFF;

/// Priority assigned to the implicit idle task. Numerically the lowest
/// urgency, i.e. the largest value any task may hold.
pub const IDLE_PRIORITY: u8 = u8::MAX;

/// Priority the kernel's own system task runs at (must preempt ordinary
/// user tasks so initialization and CPU-usage accounting are not starved).
pub const SYSTEM_TASK_PRIORITY: u8 = 1;

/// Priority the message broker daemon runs at.
pub const MESSAGE_DAEMON_PRIORITY: u8 = 2;

/// Priority the signal daemon runs at.
pub const SIGNAL_DAEMON_PRIORITY: u8 = 2;

/// Period, in milliseconds, between CPU-usage recomputation passes on the
/// system task.
pub const CPU_USAGE_PERIOD_MS: u32 = 100;
