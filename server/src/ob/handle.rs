//! Per-Process Handle Table
//!
//! Maps small-integer handles to server objects with a granted access
//! mask. Handles are nonzero multiples of 4 (the low bits are reserved for
//! client-side tagging). The table is a flat array grown on demand and
//! capped at [`MAX_HANDLES`].
//!
//! Every entry holds a strong reference; closing a handle drops it, and an
//! object whose last handle closes is destroyed unless other references
//! (waits, APC queues, registry) remain.

use std::cell::RefCell;
use std::rc::Rc;

use super::object::Object;
use crate::status::{
    set_error, STATUS_ACCESS_DENIED, STATUS_INVALID_HANDLE, STATUS_TOO_MANY_OPENED_FILES,
};

/// Handle value as seen by clients.
pub type ObjHandle = u32;

/// Maximum handles per process.
pub const MAX_HANDLES: usize = 1024;

/// Handle values are spaced by 4.
const HANDLE_STEP: ObjHandle = 4;

/// Access rights. Only the bits the core itself checks are defined here;
/// collaborating modules add their own object-specific rights.
pub mod access {
    pub const SYNCHRONIZE: u32 = 0x0010_0000;
    pub const STANDARD_RIGHTS_REQUIRED: u32 = 0x000F_0000;

    pub const THREAD_TERMINATE: u32 = 0x0001;
    pub const THREAD_SUSPEND_RESUME: u32 = 0x0002;
    pub const THREAD_GET_CONTEXT: u32 = 0x0008;
    pub const THREAD_SET_CONTEXT: u32 = 0x0010;
    pub const THREAD_SET_INFORMATION: u32 = 0x0020;
    pub const THREAD_QUERY_INFORMATION: u32 = 0x0040;
    pub const THREAD_ALL_ACCESS: u32 = STANDARD_RIGHTS_REQUIRED | SYNCHRONIZE | 0x3FF;

    pub const PROCESS_CREATE_THREAD: u32 = 0x0002;
    pub const PROCESS_VM_OPERATION: u32 = 0x0008;
    pub const PROCESS_QUERY_INFORMATION: u32 = 0x0400;

    pub const EVENT_MODIFY_STATE: u32 = 0x0002;
    pub const SEMAPHORE_MODIFY_STATE: u32 = 0x0002;
    pub const MUTANT_QUERY_STATE: u32 = 0x0001;
}

struct HandleEntry {
    object: Rc<dyn Object>,
    access: u32,
}

/// Flat handle table.
pub struct HandleTable {
    entries: RefCell<Vec<Option<HandleEntry>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
        }
    }

    #[inline]
    fn index(handle: ObjHandle) -> Option<usize> {
        if handle == 0 || handle % HANDLE_STEP != 0 {
            return None;
        }
        Some((handle / HANDLE_STEP) as usize - 1)
    }

    #[inline]
    fn handle_for(index: usize) -> ObjHandle {
        (index as ObjHandle + 1) * HANDLE_STEP
    }

    /// Allocate a handle to `object` with the given granted access.
    ///
    /// Returns 0 with `STATUS_TOO_MANY_OPENED_FILES` when the table is
    /// full.
    pub fn alloc(&self, object: Rc<dyn Object>, access: u32) -> ObjHandle {
        let mut entries = self.entries.borrow_mut();
        let entry = HandleEntry { object, access };
        for (i, slot) in entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return Self::handle_for(i);
            }
        }
        if entries.len() >= MAX_HANDLES {
            set_error(STATUS_TOO_MANY_OPENED_FILES);
            return 0;
        }
        entries.push(Some(entry));
        Self::handle_for(entries.len() - 1)
    }

    /// Resolve a handle, checking that `access` is a subset of the granted
    /// mask. Grants a fresh strong reference.
    pub fn get(&self, handle: ObjHandle, access: u32) -> Option<Rc<dyn Object>> {
        self.get_with_access(handle, access).map(|(obj, _)| obj)
    }

    /// Like [`get`](Self::get), also returning the granted access mask.
    pub fn get_with_access(&self, handle: ObjHandle, access: u32) -> Option<(Rc<dyn Object>, u32)> {
        let entries = self.entries.borrow();
        let entry = match Self::index(handle).and_then(|i| entries.get(i)) {
            Some(Some(entry)) => entry,
            _ => {
                set_error(STATUS_INVALID_HANDLE);
                return None;
            }
        };
        if access & !entry.access != 0 {
            set_error(STATUS_ACCESS_DENIED);
            return None;
        }
        Some((entry.object.clone(), entry.access))
    }

    /// Close a handle, dropping its reference.
    pub fn close(&self, handle: ObjHandle) -> bool {
        let mut entries = self.entries.borrow_mut();
        match Self::index(handle).and_then(|i| entries.get_mut(i)) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => {
                set_error(STATUS_INVALID_HANDLE);
                false
            }
        }
    }

    /// Duplicate a handle into `target`.
    ///
    /// With `same_access` the source's granted mask carries over verbatim;
    /// otherwise `access` is granted.
    pub fn duplicate_to(
        &self,
        handle: ObjHandle,
        target: &HandleTable,
        access: u32,
        same_access: bool,
    ) -> ObjHandle {
        let (object, granted) = match self.get_with_access(handle, 0) {
            Some(pair) => pair,
            None => return 0,
        };
        let new_access = if same_access { granted } else { access };
        target.alloc(object, new_access)
    }

    /// Number of live handles.
    pub fn count(&self) -> usize {
        self.entries
            .borrow()
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::event::Event;
    use crate::status::{clear_error, get_error, STATUS_SUCCESS};

    #[test]
    fn test_alloc_get_close() {
        clear_error();
        let table = HandleTable::new();
        let event = Event::new(true, false);
        let h = table.alloc(event, access::SYNCHRONIZE | access::EVENT_MODIFY_STATE);
        assert_ne!(h, 0);
        assert_eq!(h % 4, 0);

        assert!(table.get(h, access::SYNCHRONIZE).is_some());
        assert!(table.close(h));
        assert!(table.get(h, 0).is_none());
        assert_eq!(get_error(), STATUS_INVALID_HANDLE);
    }

    #[test]
    fn test_access_check() {
        clear_error();
        let table = HandleTable::new();
        let event = Event::new(true, false);
        let h = table.alloc(event, access::SYNCHRONIZE);

        assert!(table.get(h, access::EVENT_MODIFY_STATE).is_none());
        assert_eq!(get_error(), STATUS_ACCESS_DENIED);

        clear_error();
        assert!(table.get(h, access::SYNCHRONIZE).is_some());
        assert_eq!(get_error(), STATUS_SUCCESS);
    }

    #[test]
    fn test_bad_handle_values() {
        clear_error();
        let table = HandleTable::new();
        assert!(table.get(0, 0).is_none());
        assert!(table.get(3, 0).is_none());
        assert!(table.get(4096, 0).is_none());
        assert_eq!(get_error(), STATUS_INVALID_HANDLE);
    }

    #[test]
    fn test_slot_reuse() {
        let table = HandleTable::new();
        let event = Event::new(true, false);
        let h1 = table.alloc(event.clone(), 0);
        table.close(h1);
        let h2 = table.alloc(event, 0);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_duplicate_same_access() {
        clear_error();
        let src = HandleTable::new();
        let dst = HandleTable::new();
        let event = Event::new(false, false);
        let h = src.alloc(event, access::SYNCHRONIZE | access::EVENT_MODIFY_STATE);

        let dup = src.duplicate_to(h, &dst, 0, true);
        assert_ne!(dup, 0);
        // The duplicated handle carries the source rights.
        assert!(dst
            .get(dup, access::SYNCHRONIZE | access::EVENT_MODIFY_STATE)
            .is_some());
    }
}
