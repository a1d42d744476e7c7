//! Timers and Server Time
//!
//! The engine keeps one logical clock, advanced by the host once per
//! dispatch tick; everything time-related (wait deadlines, creation and
//! exit stamps) is expressed in that clock's ticks (100 ns units).
//!
//! Wait timeouts are armed through the [`TimerQueue`] interface. The host
//! owns the actual timekeeping; [`DeadlineList`] is the reference
//! implementation a poll-loop host (or a test) drives by asking for the
//! next deadline and running whatever is due.

use std::cell::{Cell, RefCell};

use crate::engine::Engine;

/// Absolute server time in ticks. Non-positive request timeouts are
/// relative deltas; see the wait engine.
pub type Timeout = i64;

/// Deadline meaning "never".
pub const TIMEOUT_INFINITE: Timeout = i64::MAX;

/// Identifies an armed timer for cancellation.
pub type TimerId = u64;

/// Work to run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce(&Engine)>;

/// Interface between the wait engine and the host's timekeeping.
pub trait TimerQueue {
    /// Arm a one-shot timer at absolute time `when`.
    fn arm(&self, when: Timeout, callback: TimerCallback) -> TimerId;

    /// Cancel an armed timer. Unknown ids (already fired, already
    /// cancelled) are ignored.
    fn cancel(&self, id: TimerId);
}

struct DeadlineEntry {
    id: TimerId,
    when: Timeout,
    callback: TimerCallback,
}

/// Straightforward deadline list: armed timers kept unsorted, fired in
/// deadline order by [`run_due`](DeadlineList::run_due).
pub struct DeadlineList {
    entries: RefCell<Vec<DeadlineEntry>>,
    next_id: Cell<TimerId>,
}

impl DeadlineList {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }

    /// Earliest armed deadline, for the host's poll timeout.
    pub fn next_deadline(&self) -> Option<Timeout> {
        self.entries.borrow().iter().map(|e| e.when).min()
    }

    /// Number of armed timers.
    pub fn armed(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Fire every timer due at the engine's current time, earliest first.
    /// Callbacks may arm or cancel timers. Returns the number fired.
    pub fn run_due(&self, engine: &Engine) -> usize {
        let mut fired = 0;
        loop {
            let now = engine.current_time();
            let due = {
                let mut entries = self.entries.borrow_mut();
                let next = entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.when <= now)
                    .min_by_key(|(_, e)| e.when)
                    .map(|(i, _)| i);
                match next {
                    Some(i) => entries.swap_remove(i),
                    None => break,
                }
            };
            (due.callback)(engine);
            fired += 1;
        }
        fired
    }
}

impl TimerQueue for DeadlineList {
    fn arm(&self, when: Timeout, callback: TimerCallback) -> TimerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.entries.borrow_mut().push(DeadlineEntry {
            id,
            when,
            callback,
        });
        id
    }

    fn cancel(&self, id: TimerId) {
        self.entries.borrow_mut().retain(|e| e.id != id);
    }
}

impl Default for DeadlineList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_arm_cancel_fire() {
        let engine = crate::test_support::test_engine();
        let list = engine.deadline_list();
        let fired = Rc::new(Cell::new(0u32));

        let f = fired.clone();
        let a = list.arm(100, Box::new(move |_| f.set(f.get() + 1)));
        let f = fired.clone();
        let _b = list.arm(50, Box::new(move |_| f.set(f.get() + 10)));
        assert_eq!(list.next_deadline(), Some(50));

        list.cancel(a);
        engine.set_current_time(100);
        assert_eq!(list.run_due(&engine), 1);
        assert_eq!(fired.get(), 10);
        assert_eq!(list.armed(), 0);
    }

    #[test]
    fn test_run_due_fires_in_deadline_order() {
        let engine = crate::test_support::test_engine();
        let list = engine.deadline_list();
        let order = Rc::new(RefCell::new(Vec::new()));

        for when in [30i64, 10, 20] {
            let order = order.clone();
            list.arm(when, Box::new(move |_| order.borrow_mut().push(when)));
        }
        engine.set_current_time(30);
        list.run_due(&engine);
        assert_eq!(*order.borrow(), vec![10, 20, 30]);
    }

    #[test]
    fn test_not_due_stays_armed() {
        let engine = crate::test_support::test_engine();
        let list = engine.deadline_list();
        list.arm(1000, Box::new(|_| {}));
        engine.set_current_time(999);
        assert_eq!(list.run_due(&engine), 0);
        assert_eq!(list.armed(), 1);
    }
}
