//! Select Orchestration
//!
//! `select_on` is the single path by which a request installs a wait:
//! resolve handles, build the wait record, optionally signal an object
//! first (the classic signal-and-wait primitive), run the initial
//! satisfaction check, and arm the deadline timer when the thread really
//! has to park. The caller observes the outcome through the error slot:
//! `STATUS_PENDING` means the thread is parked on its wake channel,
//! anything else is an immediate verdict.

use std::rc::Rc;

use crate::engine::Engine;
use crate::ob::{access, ObjHandle, Object};
use crate::ps::thread::Thread;
use crate::status::{set_error, NtStatus, STATUS_INVALID_PARAMETER, STATUS_PENDING};

use super::timer::{Timeout, TIMEOUT_INFINITE};
use super::wait::{
    check_wait, end_wait, wait_on, wait_timeout_fired, SelectFlags, KEEP_WAITING,
    MAXIMUM_WAIT_OBJECTS,
};

/// Signal an object named by handle, using the handle's granted access.
pub fn signal_object(engine: &Engine, current: &Rc<Thread>, handle: ObjHandle) -> bool {
    let Some((obj, granted)) = current
        .process()
        .handle_table()
        .get_with_access(handle, 0)
    else {
        return false;
    };
    obj.signal(engine, granted)
}

/// Install a wait for `current` over `handles`, signalling `signal_obj`
/// first when nonzero.
///
/// Returns the absolute deadline echoed in the reply. Outcomes, via the
/// error slot:
/// - `STATUS_PENDING`: wait installed, timer armed if finite; the wake
///   channel will carry the verdict.
/// - success / index / `STATUS_USER_APC` / `STATUS_TIMEOUT`: the wait
///   resolved immediately and was torn down again (a self-satisfying
///   signal-and-wait already pushed its wake-up record).
/// - an error: nothing is installed.
pub fn select_on(
    engine: &Engine,
    current: &Rc<Thread>,
    handles: &[ObjHandle],
    signal_obj: ObjHandle,
    flags: SelectFlags,
    timeout: Timeout,
    cookie: u64,
) -> Timeout {
    let when = if timeout <= 0 {
        engine.current_time().saturating_sub(timeout)
    } else {
        timeout
    };

    if handles.len() > MAXIMUM_WAIT_OBJECTS {
        set_error(STATUS_INVALID_PARAMETER);
        return when;
    }

    let mut objects: Vec<Rc<dyn Object>> = Vec::with_capacity(handles.len());
    for &handle in handles {
        match current
            .process()
            .handle_table()
            .get(handle, access::SYNCHRONIZE)
        {
            Some(obj) => objects.push(obj),
            None => return when,
        }
    }

    if !wait_on(engine, current, &objects, flags, when, cookie) {
        return when;
    }

    if signal_obj != 0 {
        if !signal_object(engine, current, signal_obj) {
            end_wait(engine, current);
            return when;
        }
        // The signal may have satisfied our own wait; the wake-up record
        // is already on the channel.
        if current.wait.borrow().is_none() {
            return when;
        }
    }

    let verdict = check_wait(engine, current);
    if verdict != KEEP_WAITING {
        end_wait(engine, current);
        set_error(NtStatus(verdict as u32));
        return when;
    }

    if when != TIMEOUT_INFINITE {
        let token = current
            .wait
            .borrow()
            .as_ref()
            .map(|w| w.token)
            .unwrap_or(0);
        let target = Rc::downgrade(current);
        let id = engine.timers().arm(
            when,
            Box::new(move |eng| {
                if let Some(thread) = target.upgrade() {
                    wait_timeout_fired(eng, &thread, token);
                }
            }),
        );
        if let Some(wait) = current.wait.borrow().as_ref() {
            wait.timer.set(Some(id));
        }
    }
    set_error(STATUS_PENDING);
    when
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::event::Event;
    use crate::ke::semaphore::Semaphore;
    use crate::status::{clear_error, get_error, STATUS_TIMEOUT, STATUS_SUCCESS};
    use crate::test_support::{test_engine, test_process, test_thread};

    #[test]
    fn test_too_many_handles() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let thread = test_thread(&engine, &process);

        let handles = vec![4u32; MAXIMUM_WAIT_OBJECTS + 1];
        select_on(&engine, &thread, &handles, 0, SelectFlags::empty(), -1, 0);
        assert_eq!(get_error(), STATUS_INVALID_PARAMETER);
        assert!(thread.wait.borrow().is_none());
    }

    #[test]
    fn test_pending_arms_timer() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let thread = test_thread(&engine, &process);

        let event = Event::new(true, false);
        let h = process
            .handle_table()
            .alloc(event.clone(), access::SYNCHRONIZE);

        let when = select_on(
            &engine,
            &thread,
            &[h],
            0,
            SelectFlags::empty(),
            -500,
            0x77,
        );
        assert_eq!(get_error(), STATUS_PENDING);
        assert_eq!(when, 500);
        assert_eq!(engine.deadline_list().armed(), 1);

        engine.set_current_time(500);
        engine.deadline_list().run_due(&engine);
        let wakeups = engine.test_wakeups();
        assert_eq!(wakeups.len(), 1);
        assert_eq!(wakeups[0].cookie, 0x77);
        assert_eq!(wakeups[0].signaled, STATUS_TIMEOUT.code() as i32);
    }

    #[test]
    fn test_immediate_satisfaction_cancels_install() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let thread = test_thread(&engine, &process);

        let event = Event::new(true, true);
        let h = process
            .handle_table()
            .alloc(event.clone(), access::SYNCHRONIZE);

        select_on(
            &engine,
            &thread,
            &[h],
            0,
            SelectFlags::empty(),
            TIMEOUT_INFINITE,
            0,
        );
        // Verdict 0 delivered through the error slot; no wait, no timer.
        assert_eq!(get_error(), STATUS_SUCCESS);
        assert!(thread.wait.borrow().is_none());
        assert_eq!(engine.deadline_list().armed(), 0);
        assert!(!event.header().has_waiters());
    }

    #[test]
    fn test_signal_and_wait_self_satisfy() {
        // Signal-and-wait on one's own semaphore: the signal satisfies
        // the wait immediately and the wake record carries the cookie.
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let thread = test_thread(&engine, &process);

        let sem = Semaphore::new(0, 1);
        let h = process.handle_table().alloc(
            sem.clone(),
            access::SYNCHRONIZE | access::SEMAPHORE_MODIFY_STATE,
        );

        select_on(
            &engine,
            &thread,
            &[h],
            h,
            SelectFlags::empty(),
            TIMEOUT_INFINITE,
            0x1234,
        );
        assert_eq!(get_error(), STATUS_SUCCESS);
        assert!(thread.wait.borrow().is_none());

        let wakeups = engine.test_wakeups();
        assert_eq!(wakeups.len(), 1);
        assert_eq!(wakeups[0].cookie, 0x1234);
        assert_eq!(wakeups[0].signaled, 0);
        // The released unit was consumed by the grant.
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_signal_failure_unwinds_wait() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let thread = test_thread(&engine, &process);

        let event = Event::new(true, false);
        // SYNCHRONIZE only: signalling through this handle is denied.
        let h = process
            .handle_table()
            .alloc(event.clone(), access::SYNCHRONIZE);

        select_on(
            &engine,
            &thread,
            &[h],
            h,
            SelectFlags::empty(),
            TIMEOUT_INFINITE,
            0,
        );
        assert!(get_error().is_error());
        assert!(thread.wait.borrow().is_none());
        assert!(!event.header().has_waiters());
    }
}
