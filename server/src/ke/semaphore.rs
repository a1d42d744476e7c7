//! Semaphore Object
//!
//! Counted semaphore with an upper limit. A grant consumes one unit;
//! releasing `n` units wakes up to `n` waiters. Releasing past the limit
//! fails without changing the count.

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

use crate::engine::Engine;
use crate::ob::{access, Object, ObjectHeader};
use crate::ps::thread::Thread;
use crate::status::{set_error, STATUS_ACCESS_DENIED, STATUS_SEMAPHORE_LIMIT_EXCEEDED};

use super::wait::wake_up;

/// Waitable counted semaphore.
pub struct Semaphore {
    header: ObjectHeader,
    count: Cell<u32>,
    max: u32,
}

impl Semaphore {
    pub fn new(initial: u32, max: u32) -> Rc<Self> {
        Rc::new(Self {
            header: ObjectHeader::new(),
            count: Cell::new(initial.min(max)),
            max,
        })
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count.get()
    }

    #[inline]
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Release `n` units and wake up to `n` waiters. Returns the previous
    /// count; fails with `STATUS_SEMAPHORE_LIMIT_EXCEEDED` when the new
    /// count would pass the limit.
    pub fn release(self: &Rc<Self>, engine: &Engine, n: u32) -> Option<u32> {
        let prev = self.count.get();
        if n > self.max - prev {
            set_error(STATUS_SEMAPHORE_LIMIT_EXCEEDED);
            return None;
        }
        self.count.set(prev + n);
        wake_up(engine, &**self, n);
        Some(prev)
    }
}

impl Object for Semaphore {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn dump(&self) -> String {
        format!("semaphore count={} max={}", self.count.get(), self.max)
    }

    fn signaled(&self, _thread: &Rc<Thread>) -> bool {
        self.count.get() > 0
    }

    fn satisfied(self: Rc<Self>, _thread: &Rc<Thread>) -> bool {
        let count = self.count.get();
        if count > 0 {
            self.count.set(count - 1);
        }
        false
    }

    fn signal(self: Rc<Self>, engine: &Engine, access: u32) -> bool {
        if access & access::SEMAPHORE_MODIFY_STATE == 0 {
            set_error(STATUS_ACCESS_DENIED);
            return false;
        }
        self.release(engine, 1).is_some()
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}
