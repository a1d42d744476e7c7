//! Thread Registry
//!
//! Process-wide bookkeeping for every live thread: the global thread list
//! (creation order), the shared process/thread id namespace, and an
//! optional hash index from client OS pid to thread id.
//!
//! Lookups by internal id go through the dense id table and report
//! `STATUS_INVALID_CID` on a miss. Lookups by OS pid or tid walk the
//! global list (linear is fine, the list is bounded by client count),
//! with the pid index as a fast path. The index is the one structure a
//! multi-threaded host may touch concurrently, so it sits behind a
//! reader-writer lock: insertion and removal are writers, lookup is a
//! reader.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use spin::RwLock;

use crate::status::{set_error, STATUS_INVALID_CID, STATUS_NO_MEMORY};

use super::cid::PtidAllocator;
use super::process::Process;
use super::thread::{RunState, Thread};

/// One row of [`ThreadRegistry::snapshot`].
pub struct ThreadSnapshot {
    pub thread: Rc<Thread>,
    /// Strong reference count at snapshot time.
    pub count: usize,
    pub priority: i32,
}

/// Global thread bookkeeping, one per engine.
pub struct ThreadRegistry {
    list: RefCell<Vec<Rc<Thread>>>,
    ptids: RefCell<PtidAllocator>,
    unix_pid_index: RwLock<HashMap<i32, u32>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            list: RefCell::new(Vec::new()),
            ptids: RefCell::new(PtidAllocator::new()),
            unix_pid_index: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a fresh thread: global list plus id allocation. A failed id
    /// allocation rolls the list insertion back and reports
    /// `STATUS_NO_MEMORY`.
    pub(crate) fn insert_thread(&self, thread: &Rc<Thread>) -> bool {
        self.list.borrow_mut().push(thread.clone());
        match self.ptids.borrow_mut().alloc_thread(thread) {
            Some(id) => {
                thread.set_id(id);
                true
            }
            None => {
                self.list
                    .borrow_mut()
                    .retain(|t| !Rc::ptr_eq(t, thread));
                set_error(STATUS_NO_MEMORY);
                false
            }
        }
    }

    /// Drop a dead thread from the list, the id table and the pid index.
    pub(crate) fn remove_thread(&self, thread: &Rc<Thread>) {
        self.list.borrow_mut().retain(|t| !Rc::ptr_eq(t, thread));
        self.ptids.borrow_mut().free(thread.id());
        self.unindex_unix_pid(thread);
    }

    pub(crate) fn alloc_process_id(&self, process: &Rc<Process>) -> Option<u32> {
        self.ptids.borrow_mut().alloc_process(process)
    }

    pub(crate) fn free_process_id(&self, id: u32) {
        self.ptids.borrow_mut().free(id);
    }

    /// Record the OS pid of an initialized thread in the fast index.
    pub(crate) fn index_unix_pid(&self, thread: &Thread) {
        if thread.unix_pid() != -1 {
            self.unix_pid_index
                .write()
                .entry(thread.unix_pid())
                .or_insert(thread.id());
        }
    }

    pub(crate) fn unindex_unix_pid(&self, thread: &Thread) {
        let mut index = self.unix_pid_index.write();
        if index.get(&thread.unix_pid()) == Some(&thread.id()) {
            index.remove(&thread.unix_pid());
        }
    }

    /// Look a thread up by internal id. Grants a fresh strong reference;
    /// a miss reports `STATUS_INVALID_CID`.
    pub fn get_thread_from_id(&self, id: u32) -> Option<Rc<Thread>> {
        match self.ptids.borrow().lookup_thread(id) {
            Some(thread) => Some(thread),
            None => {
                set_error(STATUS_INVALID_CID);
                None
            }
        }
    }

    /// First thread whose client OS pid matches.
    pub fn get_thread_from_pid(&self, unix_pid: i32) -> Option<Rc<Thread>> {
        if let Some(&id) = self.unix_pid_index.read().get(&unix_pid) {
            if let Some(thread) = self.ptids.borrow().lookup_thread(id) {
                if thread.unix_pid() == unix_pid {
                    return Some(thread);
                }
            }
        }
        self.list
            .borrow()
            .iter()
            .find(|t| t.unix_pid() == unix_pid)
            .cloned()
    }

    /// First thread whose client OS tid matches.
    pub fn get_thread_from_tid(&self, unix_tid: i32) -> Option<Rc<Thread>> {
        self.list
            .borrow()
            .iter()
            .find(|t| t.unix_tid() == unix_tid)
            .cloned()
    }

    /// All live (non-terminated) threads with refcount and priority.
    pub fn snapshot(&self) -> Vec<ThreadSnapshot> {
        self.list
            .borrow()
            .iter()
            .filter(|t| t.state() != RunState::Terminated)
            .map(|t| ThreadSnapshot {
                thread: t.clone(),
                count: Rc::strong_count(t),
                priority: t.priority(),
            })
            .collect()
    }

    /// Every thread still on the global list, for shutdown sweeps.
    pub(crate) fn all_threads(&self) -> Vec<Rc<Thread>> {
        self.list.borrow().clone()
    }

    /// Live ticket count, processes included.
    pub fn ticket_count(&self) -> usize {
        self.ptids.borrow().used()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
