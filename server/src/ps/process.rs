//! Process Record
//!
//! The thread core reads and writes a small process surface: affinity and
//! priority class for validation, the suspend counter for effective
//! suspension, the per-process thread list for APC target selection and
//! termination accounting, the CPU type finalized by the first thread's
//! init, and the handle table. The full process lifecycle (creation
//! requests, image loading, exit) lives in a collaborating module.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::debug;

use crate::engine::Engine;
use crate::ke::context::CpuType;
use crate::ke::timer::Timeout;
use crate::ob::{object_as, HandleTable, ObjHandle, Object, ObjectHeader};
use crate::status::{set_error, STATUS_OBJECT_TYPE_MISMATCH};

use super::thread::Thread;

/// CPU affinity bitmask. One bit per schedulable processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Affinity(pub u64);

impl Affinity {
    /// All processors.
    pub const fn all() -> Self {
        Affinity(u64::MAX)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `self` is also set in `other`.
    #[inline]
    pub const fn is_subset_of(self, other: Affinity) -> bool {
        self.0 & other.0 == self.0
    }
}

/// Scheduling class of a process; bounds the valid thread priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityClass {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
    Realtime,
}

/// One LDT descriptor as mirrored from the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LdtEntry {
    pub base: u32,
    pub limit: u32,
    pub flags: u8,
}

/// Construction parameters for a process record.
pub struct ProcessOptions {
    pub affinity: Affinity,
    pub priority_class: PriorityClass,
    /// A parentless process adopts its first thread's affinity.
    pub parentless: bool,
    /// Size of the startup blob handed to the first thread.
    pub startup_info_size: u32,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            affinity: Affinity::all(),
            priority_class: PriorityClass::Normal,
            parentless: true,
            startup_info_size: 0,
        }
    }
}

/// Per-process state referenced by the thread core.
pub struct Process {
    header: ObjectHeader,
    id: Cell<u32>,
    affinity: Cell<Affinity>,
    priority_class: Cell<PriorityClass>,
    suspend: Cell<u32>,
    terminating: Cell<bool>,
    running_threads: Cell<u32>,
    threads: RefCell<Vec<Rc<Thread>>>,
    cpu: Cell<Option<CpuType>>,
    unix_pid: Cell<i32>,
    init_done: Cell<bool>,
    parentless: bool,
    startup_info_size: u32,
    start_time: Timeout,
    handles: HandleTable,
    ldt_copy: RefCell<Option<Vec<LdtEntry>>>,
}

impl Process {
    pub(crate) fn alloc(engine: &Engine, options: ProcessOptions) -> Rc<Self> {
        Rc::new(Self {
            header: ObjectHeader::new(),
            id: Cell::new(0),
            affinity: Cell::new(options.affinity),
            priority_class: Cell::new(options.priority_class),
            suspend: Cell::new(0),
            terminating: Cell::new(false),
            running_threads: Cell::new(0),
            threads: RefCell::new(Vec::new()),
            cpu: Cell::new(None),
            unix_pid: Cell::new(-1),
            init_done: Cell::new(false),
            parentless: options.parentless,
            startup_info_size: options.startup_info_size,
            start_time: engine.current_time(),
            handles: HandleTable::new(),
            ldt_copy: RefCell::new(None),
        })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id.get()
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.id.set(id);
    }

    #[inline]
    pub fn affinity(&self) -> Affinity {
        self.affinity.get()
    }

    pub fn set_affinity(&self, affinity: Affinity) {
        self.affinity.set(affinity);
    }

    #[inline]
    pub fn priority_class(&self) -> PriorityClass {
        self.priority_class.get()
    }

    pub fn set_priority_class(&self, class: PriorityClass) {
        self.priority_class.set(class);
    }

    #[inline]
    pub fn suspend_count(&self) -> u32 {
        self.suspend.get()
    }

    /// Process-wide suspend counter, managed by the process lifecycle
    /// module; it adds into every thread's effective suspension.
    pub fn set_suspend_count(&self, count: u32) {
        self.suspend.set(count);
    }

    #[inline]
    pub fn is_terminating(&self) -> bool {
        self.terminating.get()
    }

    pub fn set_terminating(&self) {
        self.terminating.set(true);
    }

    #[inline]
    pub fn running_threads(&self) -> u32 {
        self.running_threads.get()
    }

    /// Threads currently attached, in attach order.
    pub fn threads(&self) -> Vec<Rc<Thread>> {
        self.threads.borrow().clone()
    }

    #[inline]
    pub fn cpu(&self) -> Option<CpuType> {
        self.cpu.get()
    }

    pub(crate) fn set_cpu(&self, cpu: CpuType) {
        self.cpu.set(Some(cpu));
    }

    #[inline]
    pub fn unix_pid(&self) -> i32 {
        self.unix_pid.get()
    }

    pub(crate) fn set_unix_pid(&self, pid: i32) {
        self.unix_pid.set(pid);
    }

    #[inline]
    pub fn is_init_done(&self) -> bool {
        self.init_done.get()
    }

    #[inline]
    pub fn is_parentless(&self) -> bool {
        self.parentless
    }

    #[inline]
    pub fn start_time(&self) -> Timeout {
        self.start_time
    }

    #[inline]
    pub fn handle_table(&self) -> &HandleTable {
        &self.handles
    }

    /// Run first-thread process initialization. Returns the size of the
    /// startup blob the client should fetch.
    pub(crate) fn finish_init(&self, first: &Rc<Thread>) -> u32 {
        self.init_done.set(true);
        debug!(
            "[PS] process {:04x} initialized by thread {:04x}",
            self.id(),
            first.id()
        );
        self.startup_info_size
    }

    pub(crate) fn add_thread(&self, thread: &Rc<Thread>) {
        self.threads.borrow_mut().push(thread.clone());
        self.running_threads.set(self.running_threads.get() + 1);
    }

    /// Detach a dead thread. The last detach marks the process
    /// terminating and wakes its joiners.
    pub(crate) fn remove_thread(self: &Rc<Self>, engine: &Engine, thread: &Rc<Thread>) {
        self.threads
            .borrow_mut()
            .retain(|t| !Rc::ptr_eq(t, thread));
        let running = self.running_threads.get().saturating_sub(1);
        self.running_threads.set(running);
        if running == 0 {
            self.terminating.set(true);
            crate::ke::wait::wake_up(engine, &**self, 0);
        }
    }

    /// Install the client's LDT mirror.
    pub fn set_ldt_copy(&self, entries: Option<Vec<LdtEntry>>) {
        *self.ldt_copy.borrow_mut() = entries;
    }

    pub(crate) fn ldt_entry(&self, index: usize) -> Option<LdtEntry> {
        self.ldt_copy
            .borrow()
            .as_ref()
            .map(|ldt| ldt.get(index).copied().unwrap_or_default())
    }

    pub(crate) fn has_ldt_copy(&self) -> bool {
        self.ldt_copy.borrow().is_some()
    }
}

impl Object for Process {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn dump(&self) -> String {
        format!(
            "process id={:04x} unix_pid={} threads={} terminating={}",
            self.id(),
            self.unix_pid(),
            self.running_threads(),
            self.is_terminating()
        )
    }

    /// A process handle is signaled once the process has terminated.
    fn signaled(&self, _thread: &Rc<Thread>) -> bool {
        self.terminating.get() && self.running_threads.get() == 0
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Resolve a process handle in the current thread's table.
pub fn get_process_from_handle(
    current: &Rc<Thread>,
    handle: ObjHandle,
    access: u32,
) -> Option<Rc<Process>> {
    let obj = current.process().handle_table().get(handle, access)?;
    match object_as::<Process>(obj) {
        Some(process) => Some(process),
        None => {
            set_error(STATUS_OBJECT_TYPE_MISMATCH);
            None
        }
    }
}
