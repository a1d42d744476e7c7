//! Debugger Hook Interface (dbgk)
//!
//! The debugger event pipeline lives in a collaborating module; the
//! thread core only raises events through this seam. Every hook has a
//! no-op default so hosts without a debugger attach nothing.

use std::rc::Rc;

use crate::ps::thread::Thread;

/// Events the thread core raises toward the debugger module.
pub trait DebuggerHooks {
    /// A non-first thread finished `init_thread`.
    fn create_thread(&self, thread: &Rc<Thread>) {
        let _ = thread;
    }

    /// A thread was killed.
    fn exit_thread(&self, thread: &Rc<Thread>) {
        let _ = thread;
    }

    /// A pending debug break fired on a captured context.
    fn break_event(&self, thread: &Rc<Thread>, ip: u64) {
        let _ = (thread, ip);
    }
}
