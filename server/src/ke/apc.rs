//! Asynchronous Procedure Calls (APC)
//!
//! APCs queue work onto a client thread, to be executed in that client at
//! its next delivery point. Each thread keeps two FIFO queues:
//!
//! - **System queue**: memory operations, map/unmap, create-thread,
//!   async-I/O completions. Delivered even from non-alertable waits when
//!   the wait is interruptible, and to suspended threads.
//! - **User queue**: `None`, `User` and `Timer` calls. Delivered only
//!   from alertable waits.
//!
//! The system queue strictly precedes the user queue at dequeue time. An
//! APC is itself a waitable object: threads joining on its completion
//! park on it and wake when it is marked executed, including when the
//! target thread dies before running it.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{debug, trace};

use crate::engine::Engine;
use crate::ob::{same_object, ObjHandle, Object, ObjectHeader};
use crate::ps::process::Process;
use crate::ps::thread::{send_thread_signal, Thread};
use crate::status::NtStatus;

use crate::lpc::channel::KickSignal;

use super::timer::Timeout;
use super::wait::{wake_thread, wake_up, SelectFlags};

/// Discriminates APC calls for routing, coalescing and cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApcKind {
    None,
    User,
    Timer,
    VirtualAlloc,
    VirtualFree,
    VirtualProtect,
    VirtualQuery,
    MapView,
    UnmapView,
    CreateThread,
    AsyncIo,
}

impl ApcKind {
    /// User-queue kinds; everything else routes to the system queue.
    #[inline]
    pub fn is_user(self) -> bool {
        matches!(self, ApcKind::None | ApcKind::User | ApcKind::Timer)
    }
}

/// The call descriptor shipped to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ApcCall {
    /// Wake-up only; discarded silently at delivery.
    None,
    User {
        func: u64,
        args: [u64; 3],
    },
    Timer {
        time: Timeout,
        arg: u64,
    },
    VirtualAlloc {
        addr: u64,
        size: u64,
        op_type: u32,
        prot: u32,
    },
    VirtualFree {
        addr: u64,
        size: u64,
        op_type: u32,
    },
    VirtualProtect {
        addr: u64,
        size: u64,
        prot: u32,
    },
    VirtualQuery {
        addr: u64,
    },
    MapView {
        handle: ObjHandle,
        addr: u64,
        size: u64,
        offset: u64,
    },
    UnmapView {
        addr: u64,
    },
    CreateThread {
        func: u64,
        arg: u64,
        reserve: u64,
        commit: u64,
        suspend: bool,
    },
    AsyncIo {
        user: u64,
        sb: u64,
        status: NtStatus,
    },
}

impl ApcCall {
    pub fn kind(&self) -> ApcKind {
        match self {
            ApcCall::None => ApcKind::None,
            ApcCall::User { .. } => ApcKind::User,
            ApcCall::Timer { .. } => ApcKind::Timer,
            ApcCall::VirtualAlloc { .. } => ApcKind::VirtualAlloc,
            ApcCall::VirtualFree { .. } => ApcKind::VirtualFree,
            ApcCall::VirtualProtect { .. } => ApcKind::VirtualProtect,
            ApcCall::VirtualQuery { .. } => ApcKind::VirtualQuery,
            ApcCall::MapView { .. } => ApcKind::MapView,
            ApcCall::UnmapView { .. } => ApcKind::UnmapView,
            ApcCall::CreateThread { .. } => ApcKind::CreateThread,
            ApcCall::AsyncIo { .. } => ApcKind::AsyncIo,
        }
    }
}

/// The result the client posts back after executing an APC.
#[derive(Debug, Clone, PartialEq)]
pub enum ApcResult {
    None,
    User {
        status: NtStatus,
    },
    VirtualAlloc {
        status: NtStatus,
        addr: u64,
        size: u64,
    },
    VirtualFree {
        status: NtStatus,
        addr: u64,
        size: u64,
    },
    VirtualProtect {
        status: NtStatus,
        addr: u64,
        size: u64,
        prot: u32,
    },
    VirtualQuery {
        status: NtStatus,
        base: u64,
        size: u64,
        prot: u32,
        state: u32,
    },
    MapView {
        status: NtStatus,
        addr: u64,
        size: u64,
    },
    UnmapView {
        status: NtStatus,
    },
    CreateThread {
        status: NtStatus,
        tid: u32,
        handle: ObjHandle,
    },
    AsyncIo {
        status: NtStatus,
        total: u64,
    },
}

/// A queued asynchronous procedure call.
pub struct Apc {
    header: ObjectHeader,
    /// Coalescing/cancellation key: a new APC with the same owner and
    /// kind replaces a queued one.
    owner: Option<Rc<dyn Object>>,
    /// Originating thread, populated when the APC crosses processes.
    caller: RefCell<Option<Rc<Thread>>>,
    executed: Cell<bool>,
    call: ApcCall,
    result: RefCell<Option<ApcResult>>,
}

impl Apc {
    #[inline]
    pub fn call(&self) -> &ApcCall {
        &self.call
    }

    #[inline]
    pub fn kind(&self) -> ApcKind {
        self.call.kind()
    }

    #[inline]
    pub fn owner(&self) -> Option<&Rc<dyn Object>> {
        self.owner.as_ref()
    }

    #[inline]
    pub fn is_executed(&self) -> bool {
        self.executed.get()
    }

    pub(crate) fn mark_executed(&self) {
        self.executed.set(true);
    }

    pub fn caller(&self) -> Option<Rc<Thread>> {
        self.caller.borrow().clone()
    }

    pub(crate) fn set_caller(&self, caller: &Rc<Thread>) {
        *self.caller.borrow_mut() = Some(caller.clone());
    }

    pub fn result(&self) -> Option<ApcResult> {
        self.result.borrow().clone()
    }

    pub(crate) fn set_result(&self, result: ApcResult) {
        *self.result.borrow_mut() = Some(result);
    }
}

impl Object for Apc {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn dump(&self) -> String {
        format!("apc kind={:?} executed={}", self.kind(), self.executed.get())
    }

    /// Joiners wake once the APC has executed (or was cancelled).
    fn signaled(&self, _thread: &Rc<Thread>) -> bool {
        self.executed.get()
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Allocate an APC carrying `call`, optionally keyed to `owner`.
pub fn create_apc(owner: Option<Rc<dyn Object>>, call: ApcCall) -> Rc<Apc> {
    Rc::new(Apc {
        header: ObjectHeader::new(),
        owner,
        caller: RefCell::new(None),
        executed: Cell::new(false),
        call,
        result: RefCell::new(None),
    })
}

/// An APC-acceptable wait: suspended (thread or process), or parked in an
/// interruptible wait.
pub fn is_in_apc_wait(thread: &Thread) -> bool {
    thread.process().suspend_count() > 0
        || thread.suspend_count() > 0
        || thread
            .wait
            .borrow()
            .as_ref()
            .is_some_and(|w| w.flags.contains(SelectFlags::INTERRUPTIBLE))
}

/// Queue an APC to a thread, or to any suitable thread of a process.
///
/// With a thread target: fails when the thread has terminated, or when a
/// system APC needs a kick the OS thread no longer accepts. A queued APC
/// with the same owner and kind is cancelled first, so only the latest
/// completion of an async operation is ever delivered.
///
/// With a process target: prefers a thread already in an APC-acceptable
/// wait, else the first thread the kick signal reaches.
pub fn queue_apc(
    engine: &Engine,
    process: Option<&Rc<Process>>,
    thread: Option<&Rc<Thread>>,
    apc: &Rc<Apc>,
) -> bool {
    let mut target = thread.cloned();
    // A dead direct target can be re-routed when a process was given.
    if let Some(t) = &target {
        if t.is_terminated() && process.is_some() {
            target = None;
        }
    }

    let user_queue = apc.kind().is_user();
    let target = match target {
        Some(thread) => {
            if thread.is_terminated() {
                return false;
            }
            if !user_queue
                && thread.apc_queue(false).borrow().is_empty()
                && !is_in_apc_wait(&thread)
                && !send_thread_signal(engine, &thread, KickSignal::Kick)
            {
                return false;
            }
            if let Some(owner) = &apc.owner {
                thread_cancel_apc(engine, &thread, owner, apc.kind());
            }
            thread
        }
        None => {
            let Some(process) = process else {
                return false;
            };
            let threads = process.threads();
            let waiting = threads
                .iter()
                .find(|t| !t.is_terminated() && is_in_apc_wait(t));
            match waiting {
                Some(t) => t.clone(),
                None => {
                    let Some(t) = threads.iter().find(|t| {
                        !t.is_terminated() && send_thread_signal(engine, t, KickSignal::Kick)
                    }) else {
                        return false;
                    };
                    t.clone()
                }
            }
        }
    };

    let was_empty = {
        let queue = target.apc_queue(user_queue);
        let was_empty = queue.borrow().is_empty();
        queue.borrow_mut().push_back(apc.clone());
        was_empty
    };
    debug!(
        "[APC] queued {:?} APC to thread {:04x}",
        apc.kind(),
        target.id()
    );
    if was_empty {
        wake_thread(engine, &target);
    }
    true
}

/// Dequeue the next deliverable APC: system queue first, then the user
/// queue unless `system_only`.
pub fn thread_dequeue_apc(thread: &Thread, system_only: bool) -> Option<Rc<Apc>> {
    if let Some(apc) = thread.system_apc.borrow_mut().pop_front() {
        return Some(apc);
    }
    if system_only {
        return None;
    }
    thread.user_apc.borrow_mut().pop_front()
}

/// Cancel the first queued APC matching `(owner, kind)`.
///
/// The cancelled APC counts as executed so joiners observe completion.
pub fn thread_cancel_apc(
    engine: &Engine,
    thread: &Thread,
    owner: &Rc<dyn Object>,
    kind: ApcKind,
) {
    let cancelled = {
        let queue = thread.apc_queue(kind.is_user());
        let mut queue = queue.borrow_mut();
        let position = queue.iter().position(|apc| {
            apc.kind() == kind
                && apc
                    .owner
                    .as_ref()
                    .is_some_and(|o| same_object(o, owner))
        });
        position.and_then(|i| queue.remove(i))
    };
    if let Some(apc) = cancelled {
        trace!("[APC] cancelled {:?} APC on thread {:04x}", kind, thread.id());
        apc.mark_executed();
        wake_up(engine, &*apc, 0);
    }
}

/// Flush one of a dead thread's APC queues.
///
/// Every flushed APC is marked executed and its joiners are woken: the
/// wait contract holds for clients blocked on APC completion even though
/// the target never ran the call.
pub fn clear_apc_queue(engine: &Engine, thread: &Thread, user: bool) {
    loop {
        let apc = thread.apc_queue(user).borrow_mut().pop_front();
        let Some(apc) = apc else {
            break;
        };
        apc.mark_executed();
        wake_up(engine, &*apc, 0);
    }
}
