//! Client ID (PTID) Allocation
//!
//! Processes and threads draw their ids from one dense ticket namespace.
//! The table holds at most 0x10000 entries (a 16-bit namespace); ids start
//! at [`FIRST_PTID`] so the low values stay reserved for client-side
//! sentinels. A lookup miss is the `STATUS_INVALID_CID` condition.
//!
//! Entries store weak references: the allocator never keeps an object
//! alive, it only names it. Freed slots go onto a free list and are reused
//! before the table grows.

use std::rc::{Rc, Weak};

use super::process::Process;
use super::thread::Thread;

/// First id handed out.
pub const FIRST_PTID: u32 = 8;

/// The ticket namespace is 16 bits wide.
const MAX_PTID_ENTRIES: usize = 0x10000;

enum PtidSlot {
    Free { next: Option<u32> },
    Thread(Weak<Thread>),
    Process(Weak<Process>),
}

/// Dense id allocator shared by processes and threads.
pub struct PtidAllocator {
    slots: Vec<PtidSlot>,
    free_head: Option<u32>,
    used: usize,
}

impl PtidAllocator {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            used: 0,
        }
    }

    fn alloc_slot(&mut self, slot: PtidSlot) -> Option<u32> {
        if let Some(index) = self.free_head {
            self.free_head = match self.slots[index as usize] {
                PtidSlot::Free { next } => next,
                _ => None,
            };
            self.slots[index as usize] = slot;
            self.used += 1;
            return Some(index + FIRST_PTID);
        }
        if self.slots.len() >= MAX_PTID_ENTRIES {
            return None;
        }
        self.slots.push(slot);
        self.used += 1;
        Some(self.slots.len() as u32 - 1 + FIRST_PTID)
    }

    /// Allocate an id for a thread. None when the namespace is exhausted.
    pub fn alloc_thread(&mut self, thread: &Rc<Thread>) -> Option<u32> {
        self.alloc_slot(PtidSlot::Thread(Rc::downgrade(thread)))
    }

    /// Allocate an id for a process.
    pub fn alloc_process(&mut self, process: &Rc<Process>) -> Option<u32> {
        self.alloc_slot(PtidSlot::Process(Rc::downgrade(process)))
    }

    /// Return an id to the namespace.
    pub fn free(&mut self, id: u32) {
        let Some(index) = id.checked_sub(FIRST_PTID) else {
            return;
        };
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return;
        };
        if !matches!(slot, PtidSlot::Free { .. }) {
            *slot = PtidSlot::Free {
                next: self.free_head,
            };
            self.free_head = Some(index);
            self.used -= 1;
        }
    }

    fn slot(&self, id: u32) -> Option<&PtidSlot> {
        let index = id.checked_sub(FIRST_PTID)?;
        self.slots.get(index as usize)
    }

    /// Resolve a thread id. A process id, a freed id, or an id past the
    /// table is a miss.
    pub fn lookup_thread(&self, id: u32) -> Option<Rc<Thread>> {
        match self.slot(id)? {
            PtidSlot::Thread(weak) => weak.upgrade(),
            _ => None,
        }
    }

    /// Resolve a process id.
    pub fn lookup_process(&self, id: u32) -> Option<Rc<Process>> {
        match self.slot(id)? {
            PtidSlot::Process(weak) => weak.upgrade(),
            _ => None,
        }
    }

    /// Number of live tickets.
    pub fn used(&self) -> usize {
        self.used
    }
}

impl Default for PtidAllocator {
    fn default() -> Self {
        Self::new()
    }
}
