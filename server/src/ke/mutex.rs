//! Mutex Object
//!
//! Ownership-tracking recursive mutex. A granted wait transfers ownership
//! to the waiting thread and links the mutex onto that thread's held-mutex
//! list; release walks the other way. When an owner dies with mutexes
//! still held they are *abandoned*: ownership is torn off, waiters are
//! woken, and the next grant reports the abandoned status exactly once.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use log::trace;

use crate::engine::Engine;
use crate::ob::{Object, ObjectHeader};
use crate::ps::thread::Thread;
use crate::status::{set_error, STATUS_MUTANT_NOT_OWNED};

use super::wait::wake_up;

/// Waitable, ownership-tracking mutex.
pub struct Mutex {
    header: ObjectHeader,
    /// Recursion count; 0 means free.
    count: Cell<u32>,
    owner: RefCell<Option<Weak<Thread>>>,
    /// Set when the previous owner died holding the mutex; cleared by the
    /// first grant that reports it.
    abandoned: Cell<bool>,
}

impl Mutex {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            header: ObjectHeader::new(),
            count: Cell::new(0),
            owner: RefCell::new(None),
            abandoned: Cell::new(false),
        })
    }

    /// Create already owned by `thread`, as an initially-owned create
    /// request does.
    pub fn new_owned(thread: &Rc<Thread>) -> Rc<Self> {
        let mutex = Self::new();
        mutex.clone().grab(thread);
        mutex
    }

    #[inline]
    pub fn recursion_count(&self) -> u32 {
        self.count.get()
    }

    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.get()
    }

    pub fn owner(&self) -> Option<Rc<Thread>> {
        self.owner.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub fn is_owned_by(&self, thread: &Rc<Thread>) -> bool {
        self.owner()
            .is_some_and(|owner| Rc::ptr_eq(&owner, thread))
    }

    /// Take (or re-enter) ownership.
    fn grab(self: Rc<Self>, thread: &Rc<Thread>) {
        if self.count.get() == 0 {
            *self.owner.borrow_mut() = Some(Rc::downgrade(thread));
            thread.mutex_list.borrow_mut().push(self.clone());
        }
        self.count.set(self.count.get() + 1);
    }

    /// Drop one level of ownership; the final release frees the mutex and
    /// wakes waiters.
    ///
    /// Fails with `STATUS_MUTANT_NOT_OWNED` when `thread` is not the
    /// owner.
    pub fn release(self: &Rc<Self>, engine: &Engine, thread: &Rc<Thread>) -> bool {
        if !self.is_owned_by(thread) {
            set_error(STATUS_MUTANT_NOT_OWNED);
            return false;
        }
        let count = self.count.get() - 1;
        self.count.set(count);
        if count == 0 {
            self.unlink(thread);
            wake_up(engine, &**self, 0);
        }
        true
    }

    fn unlink(self: &Rc<Self>, owner: &Rc<Thread>) {
        *self.owner.borrow_mut() = None;
        owner
            .mutex_list
            .borrow_mut()
            .retain(|m| !Rc::ptr_eq(m, self));
    }
}

impl Object for Mutex {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn dump(&self) -> String {
        format!(
            "mutex count={} abandoned={} owner={:?}",
            self.count.get(),
            self.abandoned.get(),
            self.owner().map(|t| t.id())
        )
    }

    /// Free, or already owned by the probing thread (recursion).
    fn signaled(&self, thread: &Rc<Thread>) -> bool {
        self.count.get() == 0 || self.is_owned_by(thread)
    }

    fn satisfied(self: Rc<Self>, thread: &Rc<Thread>) -> bool {
        let abandoned = self.abandoned.replace(false);
        self.grab(thread);
        abandoned
    }

    /// Signal-and-wait releases one level.
    fn signal(self: Rc<Self>, engine: &Engine, _access: u32) -> bool {
        let Some(owner) = self.owner() else {
            set_error(STATUS_MUTANT_NOT_OWNED);
            return false;
        };
        self.release(engine, &owner)
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Tear ownership off every mutex a dead thread still holds.
pub fn abandon_mutexes(engine: &Engine, thread: &Rc<Thread>) {
    loop {
        let mutex = match thread.mutex_list.borrow().first() {
            Some(mutex) => mutex.clone(),
            None => break,
        };
        trace!(
            "[KE] abandoning mutex held by thread {:04x}",
            thread.id()
        );
        mutex.count.set(0);
        mutex.abandoned.set(true);
        mutex.unlink(thread);
        wake_up(engine, &*mutex, 0);
    }
}
