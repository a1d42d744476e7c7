//! Event Object
//!
//! Events signal state between client threads. Two flavours:
//! - **Manual reset (notification)**: stays signaled until explicitly
//!   reset; every waiter's grant sees it signaled.
//! - **Auto reset (synchronization)**: consumed by the first granted
//!   wait; resets as part of the grant, not the probe, so a WAIT-ALL
//!   probe never half-consumes it.

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

use crate::engine::Engine;
use crate::ob::{access, Object, ObjectHeader};
use crate::ps::thread::Thread;
use crate::status::{set_error, STATUS_ACCESS_DENIED};

use super::wait::wake_up;

/// Waitable event.
pub struct Event {
    header: ObjectHeader,
    manual_reset: bool,
    signaled: Cell<bool>,
}

impl Event {
    pub fn new(manual_reset: bool, initial: bool) -> Rc<Self> {
        Rc::new(Self {
            header: ObjectHeader::new(),
            manual_reset,
            signaled: Cell::new(initial),
        })
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.signaled.get()
    }

    #[inline]
    pub fn is_manual_reset(&self) -> bool {
        self.manual_reset
    }

    /// Signal the event and wake its waiters.
    pub fn set(self: &Rc<Self>, engine: &Engine) {
        self.signaled.set(true);
        wake_up(engine, &**self, 0);
    }

    /// Clear the signal without waking anyone.
    pub fn reset(&self) {
        self.signaled.set(false);
    }

    /// Signal, wake current waiters, and clear again.
    pub fn pulse(self: &Rc<Self>, engine: &Engine) {
        self.set(engine);
        self.signaled.set(false);
    }
}

impl Object for Event {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn dump(&self) -> String {
        format!(
            "event manual_reset={} signaled={}",
            self.manual_reset,
            self.signaled.get()
        )
    }

    fn signaled(&self, _thread: &Rc<Thread>) -> bool {
        self.signaled.get()
    }

    fn satisfied(self: Rc<Self>, _thread: &Rc<Thread>) -> bool {
        if !self.manual_reset {
            self.signaled.set(false);
        }
        false
    }

    fn signal(self: Rc<Self>, engine: &Engine, access: u32) -> bool {
        if access & access::EVENT_MODIFY_STATE == 0 {
            set_error(STATUS_ACCESS_DENIED);
            return false;
        }
        self.set(engine);
        true
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_engine, test_process, test_thread};

    #[test]
    fn test_manual_reset_stays_signaled() {
        let engine = test_engine();
        let process = test_process(&engine);
        let thread = test_thread(&engine, &process);

        let event = Event::new(true, false);
        event.set(&engine);
        assert!(event.signaled(&thread));
        assert!(!event.clone().satisfied(&thread));
        assert!(event.is_set());
    }

    #[test]
    fn test_auto_reset_consumed_by_grant() {
        let engine = test_engine();
        let process = test_process(&engine);
        let thread = test_thread(&engine, &process);

        let event = Event::new(false, true);
        assert!(event.signaled(&thread));
        event.clone().satisfied(&thread);
        assert!(!event.is_set());
    }

    #[test]
    fn test_signal_requires_modify_state() {
        crate::status::clear_error();
        let engine = test_engine();
        let event = Event::new(true, false);

        assert!(!event.clone().signal(&engine, access::SYNCHRONIZE));
        assert_eq!(crate::status::get_error(), STATUS_ACCESS_DENIED);
        assert!(!event.is_set());

        assert!(event
            .clone()
            .signal(&engine, access::EVENT_MODIFY_STATE));
        assert!(event.is_set());
    }

    #[test]
    fn test_pulse_leaves_unset() {
        let engine = test_engine();
        let event = Event::new(true, false);
        event.pulse(&engine);
        assert!(!event.is_set());
    }
}
