//! Polymorphic Object Model
//!
//! Every waitable or handle-addressable entity in the server implements the
//! [`Object`] trait and embeds an [`ObjectHeader`]. The header carries the
//! object's wait queue (the list of wait-record entries currently parked on
//! it) and an opaque security-descriptor slot.
//!
//! Objects live behind `Rc<dyn Object>`; the reference count is the shared
//! pointer's strong count. Handle-table entries, wait-record entries, APC
//! queue membership and registry linkage each hold a strong reference, and
//! the object is destroyed when the last of them drops.
//!
//! New object kinds are contributed by collaborating modules (async I/O,
//! debug objects, completion ports, ...) by implementing the trait; the
//! core never enumerates object kinds.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::engine::Engine;
use crate::ps::thread::Thread;
use crate::status::{set_error, NtStatus, STATUS_OBJECT_TYPE_MISMATCH};

/// One entry in an object's wait queue.
///
/// The entry belongs to exactly one wait record on the waiting thread; the
/// wait record owns the strong reference to the object, while the queue
/// entry carries only a weak back reference to the thread. This breaks the
/// thread <-> object reference cycle inherent to the wait graph.
pub struct WaitQueueEntry {
    thread: Weak<Thread>,
}

impl WaitQueueEntry {
    pub fn new(thread: &Rc<Thread>) -> Rc<Self> {
        Rc::new(Self {
            thread: Rc::downgrade(thread),
        })
    }

    /// The waiting thread, if it is still alive.
    #[inline]
    pub fn thread(&self) -> Option<Rc<Thread>> {
        self.thread.upgrade()
    }
}

/// Header embedded in every server object.
pub struct ObjectHeader {
    /// Threads (via their wait-record entries) parked on this object,
    /// in insertion order. Wake-ups walk this front to back.
    wait_queue: RefCell<Vec<Rc<WaitQueueEntry>>>,
    /// Opaque security descriptor; interpreted by the security module.
    sd: RefCell<Option<Vec<u8>>>,
}

impl ObjectHeader {
    pub fn new() -> Self {
        Self {
            wait_queue: RefCell::new(Vec::new()),
            sd: RefCell::new(None),
        }
    }

    /// Number of wait entries currently queued.
    #[inline]
    pub fn waiter_count(&self) -> usize {
        self.wait_queue.borrow().len()
    }

    #[inline]
    pub fn has_waiters(&self) -> bool {
        !self.wait_queue.borrow().is_empty()
    }

    /// Snapshot of the queue, for fan-out iteration that may mutate it.
    pub(crate) fn snapshot_waiters(&self) -> Vec<Rc<WaitQueueEntry>> {
        self.wait_queue.borrow().clone()
    }

    pub(crate) fn push_waiter(&self, entry: Rc<WaitQueueEntry>) {
        self.wait_queue.borrow_mut().push(entry);
    }

    pub(crate) fn remove_waiter(&self, entry: &Rc<WaitQueueEntry>) {
        self.wait_queue
            .borrow_mut()
            .retain(|e| !Rc::ptr_eq(e, entry));
    }

    /// True when the queue holds exactly this entry once.
    #[cfg(test)]
    pub(crate) fn holds_once(&self, entry: &Rc<WaitQueueEntry>) -> bool {
        self.wait_queue
            .borrow()
            .iter()
            .filter(|e| Rc::ptr_eq(e, entry))
            .count()
            == 1
    }

    pub fn security_descriptor(&self) -> Option<Vec<u8>> {
        self.sd.borrow().clone()
    }

    pub fn set_security_descriptor(&self, sd: Option<Vec<u8>>) {
        *self.sd.borrow_mut() = sd;
    }
}

impl Default for ObjectHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Sink for asynchronous I/O completion results.
///
/// Implemented by async objects that own ASYNC_IO APCs; the select
/// entrypoint forwards the client-posted result here.
pub trait AsyncResult {
    fn set_result(&self, status: NtStatus, total: u64);
}

/// Virtual operations shared by all server objects.
///
/// The default `add_queue`/`remove_queue`/`satisfied` bodies are correct
/// for objects with plain queue behavior; objects with side effects on
/// grant (mutexes taking ownership, auto-reset events consuming their
/// state) override `satisfied`, and signalable objects override `signal`.
pub trait Object: Any {
    /// The embedded header.
    fn header(&self) -> &ObjectHeader;

    /// One-line description for debug logging.
    fn dump(&self) -> String;

    /// Is the object currently signaled for `thread`?
    ///
    /// Must not consume the signal; consumption happens in `satisfied`
    /// once the whole wait is granted.
    fn signaled(&self, thread: &Rc<Thread>) -> bool;

    /// Consume the signal after the wait has been granted.
    ///
    /// Returns true when the grant observed an abandoned state (an owner
    /// died without releasing), which colours the reported wake status.
    fn satisfied(self: Rc<Self>, thread: &Rc<Thread>) -> bool {
        let _ = thread;
        false
    }

    /// Park a wait-record entry on this object.
    ///
    /// Returns false to reject the wait; the caller rolls back the entries
    /// queued so far.
    fn add_queue(self: Rc<Self>, entry: Rc<WaitQueueEntry>) -> bool {
        self.header().push_waiter(entry);
        true
    }

    /// Remove a wait-record entry from this object.
    fn remove_queue(&self, entry: &Rc<WaitQueueEntry>) {
        self.header().remove_waiter(entry);
    }

    /// Signal the object on behalf of a signal-and-wait request.
    ///
    /// `access` is the access mask granted on the handle used to signal.
    /// Returns false (with the error slot set) when the object cannot be
    /// signaled this way.
    fn signal(self: Rc<Self>, engine: &Engine, access: u32) -> bool {
        let _ = (engine, access);
        set_error(STATUS_OBJECT_TYPE_MISMATCH);
        false
    }

    /// Narrow to the async-result sink, for ASYNC_IO result forwarding.
    fn as_async(&self) -> Option<&dyn AsyncResult> {
        None
    }

    /// Upcast for typed downcasting through [`object_as`].
    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

/// Downcast a shared object to a concrete type.
pub fn object_as<T: Any>(obj: Rc<dyn Object>) -> Option<Rc<T>> {
    obj.into_any().downcast::<T>().ok()
}

/// Identity comparison for shared objects.
#[inline]
pub fn same_object(a: &Rc<dyn Object>, b: &Rc<dyn Object>) -> bool {
    Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
}
