//! Process Support (ps)
//!
//! Thread and process records, identity allocation and lookup:
//!
//! - **Thread object**: per-client-thread state, lifecycle, suspension
//! - **Process record**: the process surface the thread core touches
//! - **PTID allocator**: dense 16-bit id namespace shared by both
//! - **Registry**: global thread list and id/OS-pid lookups
//! - **In-flight cache**: descriptors in transit across the IPC boundary

pub mod cid;
pub mod inflight;
pub mod process;
pub mod registry;
pub mod thread;

pub use cid::{PtidAllocator, FIRST_PTID};
pub use inflight::{InflightCache, InflightLookup, MAX_INFLIGHT_FDS};
pub use process::{Affinity, LdtEntry, PriorityClass, Process, ProcessOptions};
pub use registry::{ThreadRegistry, ThreadSnapshot};
pub use thread::{
    cleanup_thread, create_thread, fatal_protocol_error, kill_thread, resume_thread,
    suspend_thread, RunState, Thread, MAXIMUM_SUSPEND_COUNT, THREAD_PRIORITY_HIGHEST,
    THREAD_PRIORITY_IDLE, THREAD_PRIORITY_LOWEST, THREAD_PRIORITY_REALTIME_HIGHEST,
    THREAD_PRIORITY_REALTIME_LOWEST, THREAD_PRIORITY_TIME_CRITICAL,
};
