//! Persona Server: thread and synchronization core
//!
//! The single-process arbiter at the heart of the Persona user-mode OS
//! personality server. It tracks every client thread of every client
//! process, owns the cross-process wait-object graph, and mediates
//! suspension, wake-up, asynchronous procedure calls and debugger
//! breakpoints on their behalf. Clients are external processes speaking
//! request/reply messages over per-thread duplex channels; they block
//! *here* whenever they wait on a synchronizable object.
//!
//! # Layout
//!
//! - [`ob`]: polymorphic object model and per-process handle tables
//! - [`ps`]: thread and process records, id allocation, registry,
//!   in-flight descriptor cache
//! - [`ke`]: wait engine, select, APCs, waitable primitives, timers,
//!   register contexts
//! - [`svc`]: request entrypoints
//! - [`lpc`]: client channels, wake-up records, kick signals
//! - [`engine`]: the per-server engine value tying it all together
//!
//! # Concurrency model
//!
//! The dispatcher is single-threaded and cooperative: one request runs
//! to completion before the next is picked up, so no state here is
//! locked. The server schedules *waits*, never CPU time; every thread
//! object shadows a real OS thread in some client process.

pub mod dbgk;
pub mod engine;
pub mod ke;
pub mod lpc;
pub mod ob;
pub mod ps;
pub mod status;
pub mod svc;

#[cfg(test)]
pub(crate) mod test_support;

pub use dbgk::DebuggerHooks;
pub use engine::{Engine, EngineOptions};
pub use ke::{
    Apc, ApcCall, ApcKind, ApcResult, ContextFlags, CpuMask, CpuType, DeadlineList, Event,
    Mutex, SelectFlags, Semaphore, ThreadContext, Timeout, TimerQueue, MAXIMUM_WAIT_OBJECTS,
    TIMEOUT_INFINITE,
};
pub use lpc::{
    FdTransportFactory, KickSignal, NullKicker, ThreadKicker, TransportFactory, WakeChannel,
    WakeupReply,
};
pub use ob::{access, HandleTable, ObjHandle, Object, ObjectHeader};
pub use ps::{
    Affinity, InflightLookup, PriorityClass, Process, ProcessOptions, RunState, Thread,
    ThreadRegistry, ThreadSnapshot, MAXIMUM_SUSPEND_COUNT, MAX_INFLIGHT_FDS,
};
pub use status::NtStatus;
pub use svc::SERVER_PROTOCOL_VERSION;
