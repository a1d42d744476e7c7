//! Multi-Object Wait Engine
//!
//! Threads block in the server by installing a *wait record* over a set of
//! objects. The record links every object's wait queue back to the thread;
//! a state change anywhere in the graph funnels into [`wake_thread`],
//! which re-evaluates the thread's top wait and, once it has a verdict,
//! pops the record and writes a `{cookie, signaled}` message on the
//! thread's wake channel.
//!
//! # Wait Types
//! - **WAIT-ANY** (default): the first signalled object wins; the verdict
//!   is its index, offset by the abandoned base when the grant observed an
//!   abandoned owner.
//! - **WAIT-ALL** (`SELECT_ALL`): every object must be signalled at once;
//!   all grants run together.
//!
//! # Verdict precedence
//! System APCs (under `SELECT_INTERRUPTIBLE`) preempt everything,
//! including suspension. Suspension then blocks any grant: a suspended
//! thread holds its wait even over signalled objects, so suspension defers
//! lock acquisition while still letting system APCs through. Then object
//! grants, user APCs (under `SELECT_ALERTABLE`), and finally the deadline.
//!
//! Waits nest: a request handler that needs to block while its client is
//! already waiting pushes a new record onto the stack; wake-ups peel
//! records one at a time, newest first.

use std::cell::Cell;
use std::rc::Rc;

use bitflags::bitflags;
use log::trace;

use crate::engine::Engine;
use crate::ob::{Object, WaitQueueEntry};
use crate::ps::thread::{send_thread_wakeup, Thread};
use crate::status::{
    set_error, STATUS_ABANDONED_WAIT_0, STATUS_THREAD_IS_TERMINATING, STATUS_TIMEOUT,
    STATUS_USER_APC,
};

use super::timer::{Timeout, TimerId};

/// Ceiling on objects in one wait.
pub const MAXIMUM_WAIT_OBJECTS: usize = 64;

/// Verdict meaning "no verdict yet, keep waiting".
pub(crate) const KEEP_WAITING: i32 = -1;

bitflags! {
    /// Flags on a select/wait request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SelectFlags: u32 {
        /// WAIT-ALL semantics.
        const ALL = 1;
        /// User APCs may terminate the wait.
        const ALERTABLE = 2;
        /// System APCs may terminate the wait.
        const INTERRUPTIBLE = 4;
    }
}

/// One waited object inside a wait record: the strong object reference
/// plus the queue entry parked on it.
pub struct WaitEntry {
    pub obj: Rc<dyn Object>,
    pub entry: Rc<WaitQueueEntry>,
}

/// A thread's wait over a set of objects.
pub struct ThreadWait {
    /// Older wait this one is stacked on.
    pub next: Option<Box<ThreadWait>>,
    /// Distinguishes this record from later ones at the same stack slot,
    /// for timer callbacks arriving after the record was popped.
    pub(crate) token: u64,
    pub flags: SelectFlags,
    /// Absolute deadline.
    pub when: Timeout,
    /// Opaque client cookie echoed in the wake-up message.
    pub cookie: u64,
    pub(crate) timer: Cell<Option<TimerId>>,
    pub entries: Vec<WaitEntry>,
}

/// Install a wait record over `objects` on `current`.
///
/// A non-positive `when` is a relative delta from the current time. Each
/// object's `add_queue` runs in input order; a rejection rolls back the
/// prefix already queued and fails the call. The cookie is recorded up
/// front so even a wake-up delivered during installation (signal-and-wait
/// satisfying itself) carries it.
pub fn wait_on(
    engine: &Engine,
    current: &Rc<Thread>,
    objects: &[Rc<dyn Object>],
    flags: SelectFlags,
    when: Timeout,
    cookie: u64,
) -> bool {
    if current.is_terminated() {
        set_error(STATUS_THREAD_IS_TERMINATING);
        return false;
    }
    let deadline = if when <= 0 {
        engine.current_time().saturating_sub(when)
    } else {
        when
    };

    let wait = Box::new(ThreadWait {
        next: current.wait.borrow_mut().take(),
        token: engine.next_wait_token(),
        flags,
        when: deadline,
        cookie,
        timer: Cell::new(None),
        entries: Vec::with_capacity(objects.len()),
    });
    *current.wait.borrow_mut() = Some(wait);

    for obj in objects {
        let entry = WaitQueueEntry::new(current);
        if !obj.clone().add_queue(entry.clone()) {
            // Roll back the entries queued so far.
            end_wait(engine, current);
            return false;
        }
        if let Some(wait) = current.wait.borrow_mut().as_mut() {
            wait.entries.push(WaitEntry {
                obj: obj.clone(),
                entry,
            });
        }
    }
    true
}

/// Pop the thread's top wait record, unparking every queue entry and
/// cancelling the armed timer.
pub fn end_wait(engine: &Engine, thread: &Thread) {
    let Some(mut wait) = thread.wait.borrow_mut().take() else {
        return;
    };
    *thread.wait.borrow_mut() = wait.next.take();
    for WaitEntry { obj, entry } in &wait.entries {
        obj.remove_queue(entry);
    }
    if let Some(id) = wait.timer.take() {
        engine.timers().cancel(id);
    }
}

/// Evaluate the thread's top wait.
///
/// Returns [`KEEP_WAITING`] or a definite verdict: a signalled index
/// (plus the abandoned base when the grant observed an abandonment),
/// `STATUS_USER_APC`, or `STATUS_TIMEOUT`.
pub fn check_wait(engine: &Engine, thread: &Rc<Thread>) -> i32 {
    let guard = thread.wait.borrow();
    let Some(wait) = guard.as_deref() else {
        return KEEP_WAITING;
    };

    // System APCs preempt even a suspended thread's wait.
    if wait.flags.contains(SelectFlags::INTERRUPTIBLE) && !thread.system_apc.borrow().is_empty() {
        return STATUS_USER_APC.code() as i32;
    }
    // Suspension defers every grant below this point.
    if thread.effectively_suspended() {
        return KEEP_WAITING;
    }

    if wait.flags.contains(SelectFlags::ALL) {
        // Probe every object even after a mismatch: some objects observe
        // the probe, and they must all see a consistent pass.
        let mut not_ok = false;
        for entry in &wait.entries {
            not_ok |= !entry.obj.signaled(thread);
        }
        if !not_ok {
            let mut abandoned = false;
            for entry in &wait.entries {
                abandoned |= entry.obj.clone().satisfied(thread);
            }
            return if abandoned {
                STATUS_ABANDONED_WAIT_0.code() as i32
            } else {
                0
            };
        }
    } else {
        for (index, entry) in wait.entries.iter().enumerate() {
            if entry.obj.signaled(thread) {
                let abandoned = entry.obj.clone().satisfied(thread);
                return index as i32
                    + if abandoned {
                        STATUS_ABANDONED_WAIT_0.code() as i32
                    } else {
                        0
                    };
            }
        }
    }

    if wait.flags.contains(SelectFlags::ALERTABLE) && !thread.user_apc.borrow().is_empty() {
        return STATUS_USER_APC.code() as i32;
    }
    if wait.when <= engine.current_time() {
        return STATUS_TIMEOUT.code() as i32;
    }
    KEEP_WAITING
}

/// Re-evaluate and complete the thread's waits.
///
/// Pops one wait per verdict (nested waits unwind one at a time) and
/// sends each verdict on the wake channel. Returns the number of wake-ups
/// delivered, or -1 when the first send failed.
pub fn wake_thread(engine: &Engine, thread: &Rc<Thread>) -> i32 {
    let mut count = 0;
    while thread.wait.borrow().is_some() {
        let signaled = check_wait(engine, thread);
        if signaled == KEEP_WAITING {
            break;
        }
        let cookie = thread
            .wait
            .borrow()
            .as_ref()
            .map(|w| w.cookie)
            .unwrap_or(0);
        trace!(
            "[KE] wakeup thread={:04x} cookie={:#x} signaled={}",
            thread.id(),
            cookie,
            signaled
        );
        end_wait(engine, thread);
        if send_thread_wakeup(engine, thread, cookie, signaled) == -1 {
            if count == 0 {
                count = -1;
            }
            break;
        }
        count += 1;
    }
    count
}

/// Fan a state change out to an object's wait queue.
///
/// Threads are tried in insertion order; any wake-up may change the
/// object's state (and the queue), so iteration restarts at the head
/// whenever a thread was woken. With `max > 0` the fan-out stops after
/// `max` successfully woken threads.
pub fn wake_up(engine: &Engine, obj: &dyn Object, max: u32) {
    let mut remaining = max;
    'restart: loop {
        for entry in obj.header().snapshot_waiters() {
            let Some(thread) = entry.thread() else {
                continue;
            };
            let woken = wake_thread(engine, &thread);
            if woken == 0 {
                continue;
            }
            if woken > 0 && max > 0 {
                remaining -= 1;
                if remaining == 0 {
                    return;
                }
            }
            continue 'restart;
        }
        return;
    }
}

/// Timer callback for an armed wait deadline.
///
/// The record may have been popped (stale fire: ignore), buried under a
/// newer wait (clear its timer and leave it; its own deadline check runs
/// when it resurfaces), or the thread may be suspended (swallow the fire;
/// the wait persists until resume).
pub(crate) fn wait_timeout_fired(engine: &Engine, thread: &Rc<Thread>, token: u64) {
    let cookie;
    {
        let guard = thread.wait.borrow();
        let mut record = guard.as_deref();
        let mut on_top = true;
        loop {
            match record {
                Some(w) if w.token == token => {
                    w.timer.set(None);
                    if !on_top {
                        return;
                    }
                    break;
                }
                Some(w) => {
                    record = w.next.as_deref();
                    on_top = false;
                }
                None => return,
            }
        }
        if thread.effectively_suspended() {
            return;
        }
        cookie = guard.as_deref().map(|w| w.cookie).unwrap_or(0);
    }

    end_wait(engine, thread);
    if send_thread_wakeup(engine, thread, cookie, STATUS_TIMEOUT.code() as i32) == -1 {
        return;
    }
    // Other objects may have become signalled in the meantime.
    wake_thread(engine, thread);
}
