//! Wait and Dispatch Executive (ke)
//!
//! The synchronization heart of the server:
//!
//! - **Wait engine**: multi-object WAIT-ANY / WAIT-ALL with alertable and
//!   interruptible flags, deadlines, abandoned-mutex reporting and the
//!   wake-up protocol
//! - **Select**: per-request wait installation and signal-and-wait
//! - **APC**: system/user queues, coalescing, cancellation, delivery
//! - **Waitable primitives**: event, mutex, semaphore
//! - **Timers**: the deadline interface waits arm their timeouts on
//! - **Contexts**: captured register state and per-CPU partitioning

pub mod apc;
pub mod context;
pub mod event;
pub mod mutex;
pub mod select;
pub mod semaphore;
pub mod timer;
pub mod wait;

pub use apc::{
    clear_apc_queue, create_apc, is_in_apc_wait, queue_apc, thread_cancel_apc,
    thread_dequeue_apc, Apc, ApcCall, ApcKind, ApcResult,
};
pub use context::{
    copy_context, system_flags, ContextFlags, CpuMask, CpuType, ThreadContext,
};
pub use event::Event;
pub use mutex::{abandon_mutexes, Mutex};
pub use select::{select_on, signal_object};
pub use semaphore::Semaphore;
pub use timer::{DeadlineList, Timeout, TimerCallback, TimerId, TimerQueue, TIMEOUT_INFINITE};
pub use wait::{
    check_wait, end_wait, wait_on, wake_thread, wake_up, SelectFlags, ThreadWait, WaitEntry,
    MAXIMUM_WAIT_OBJECTS,
};
