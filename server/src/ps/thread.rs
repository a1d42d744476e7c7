//! Thread Object and Lifecycle
//!
//! One thread object per client thread. The server schedules *waits*, not
//! CPU time: every object here shadows a real OS thread in a client
//! process, reachable through its request/reply/wake channels and, when a
//! kick is needed, through an OS signal.
//!
//! # Lifecycle
//!
//! ```text
//! create ── init ── ... ── terminate/kill ── cleanup ── drop
//! ```
//!
//! `RUNNING -> TERMINATED` is the only state transition and it is
//! irreversible. A terminated thread accepts no new APC, no wait and no
//! affinity change. Kill is idempotent; cleanup may run at kill time and
//! the remaining teardown repeats harmlessly when the last reference
//! drops.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use log::{debug, error, trace};

use crate::engine::Engine;
use crate::ke::apc::{clear_apc_queue, Apc};
use crate::ke::context::ThreadContext;
use crate::ke::mutex::{abandon_mutexes, Mutex};
use crate::ke::timer::Timeout;
use crate::ke::wait::{end_wait, wake_thread, wake_up, ThreadWait};
use crate::lpc::channel::{ChannelError, KickSignal, WakeChannel, WakeupReply};
use crate::ob::{object_as, ObjHandle, Object, ObjectHeader};
use crate::ps::inflight::InflightCache;
use crate::ps::process::{Affinity, Process};
use crate::status::{set_error, STATUS_OBJECT_TYPE_MISMATCH, STATUS_PROCESS_IS_TERMINATING,
                    STATUS_SUSPEND_COUNT_EXCEEDED};

/// Thread priorities relative to the process base.
pub const THREAD_PRIORITY_LOWEST: i32 = -2;
pub const THREAD_PRIORITY_HIGHEST: i32 = 2;
/// Sentinel accepted outside the class range.
pub const THREAD_PRIORITY_IDLE: i32 = -15;
/// Sentinel accepted outside the class range.
pub const THREAD_PRIORITY_TIME_CRITICAL: i32 = 15;
/// Realtime-class bounds.
pub const THREAD_PRIORITY_REALTIME_LOWEST: i32 = -7;
pub const THREAD_PRIORITY_REALTIME_HIGHEST: i32 = 6;

/// The suspend counter saturates here.
pub const MAXIMUM_SUSPEND_COUNT: u32 = 127;

/// Thread run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Terminated,
}

/// Per-thread state record.
pub struct Thread {
    header: ObjectHeader,
    id: Cell<u32>,
    process: Rc<Process>,

    // Identity reported by the client at init time.
    unix_pid: Cell<i32>,
    unix_tid: Cell<i32>,
    teb: Cell<u64>,
    entry_point: Cell<u64>,

    // Lifecycle.
    state: Cell<RunState>,
    creation_time: Timeout,
    exit_time: Cell<Timeout>,
    exit_code: Cell<i32>,

    // Scheduling.
    priority: Cell<i32>,
    affinity: Cell<Affinity>,
    suspend: Cell<u32>,

    // Client transports.
    request_fd: RefCell<Option<OwnedFd>>,
    reply_fd: RefCell<Option<OwnedFd>>,
    wake_channel: RefCell<Option<Box<dyn WakeChannel>>>,

    // Queues.
    pub(crate) wait: RefCell<Option<Box<ThreadWait>>>,
    pub(crate) system_apc: RefCell<VecDeque<Rc<Apc>>>,
    pub(crate) user_apc: RefCell<VecDeque<Rc<Apc>>>,
    pub(crate) mutex_list: RefCell<Vec<Rc<Mutex>>>,

    // Descriptors in transit from this client.
    inflight: RefCell<InflightCache>,

    // Captured register state.
    captured: RefCell<Option<Box<ThreadContext>>>,
    context_from_suspend: Cell<bool>,
    debug_break: Cell<bool>,

    // Impersonation token, opaque to the core.
    token: RefCell<Option<Rc<dyn Object>>>,
}

impl Thread {
    #[inline]
    pub fn id(&self) -> u32 {
        self.id.get()
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.id.set(id);
    }

    #[inline]
    pub fn process(&self) -> &Rc<Process> {
        &self.process
    }

    #[inline]
    pub fn state(&self) -> RunState {
        self.state.get()
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.state.get() == RunState::Terminated
    }

    #[inline]
    pub fn unix_pid(&self) -> i32 {
        self.unix_pid.get()
    }

    #[inline]
    pub fn unix_tid(&self) -> i32 {
        self.unix_tid.get()
    }

    pub(crate) fn set_unix_ids(&self, pid: i32, tid: i32) {
        self.unix_pid.set(pid);
        self.unix_tid.set(tid);
    }

    #[inline]
    pub fn teb(&self) -> u64 {
        self.teb.get()
    }

    pub(crate) fn set_teb(&self, teb: u64) {
        self.teb.set(teb);
    }

    #[inline]
    pub fn entry_point(&self) -> u64 {
        self.entry_point.get()
    }

    pub(crate) fn set_entry_point(&self, entry: u64) {
        self.entry_point.set(entry);
    }

    #[inline]
    pub fn creation_time(&self) -> Timeout {
        self.creation_time
    }

    #[inline]
    pub fn exit_time(&self) -> Timeout {
        self.exit_time.get()
    }

    #[inline]
    pub fn exit_code(&self) -> i32 {
        self.exit_code.get()
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.set(code);
    }

    #[inline]
    pub fn priority(&self) -> i32 {
        self.priority.get()
    }

    pub(crate) fn set_priority(&self, priority: i32) {
        self.priority.set(priority);
    }

    #[inline]
    pub fn affinity(&self) -> Affinity {
        self.affinity.get()
    }

    pub(crate) fn set_affinity(&self, affinity: Affinity) {
        self.affinity.set(affinity);
    }

    #[inline]
    pub fn suspend_count(&self) -> u32 {
        self.suspend.get()
    }

    pub(crate) fn set_suspend_count(&self, count: u32) {
        self.suspend.set(count);
    }

    /// Effective suspension combines the thread and process counters.
    #[inline]
    pub fn effectively_suspended(&self) -> bool {
        self.suspend.get() + self.process.suspend_count() > 0
    }

    /// True once `init_thread` has adopted the reply channel.
    pub(crate) fn is_initialized(&self) -> bool {
        self.reply_fd.borrow().is_some()
    }

    pub(crate) fn adopt_reply_fd(&self, fd: OwnedFd) {
        *self.reply_fd.borrow_mut() = Some(fd);
    }

    pub(crate) fn set_wake_channel(&self, channel: Box<dyn WakeChannel>) {
        *self.wake_channel.borrow_mut() = Some(channel);
    }

    pub(crate) fn apc_queue(&self, user: bool) -> &RefCell<VecDeque<Rc<Apc>>> {
        if user {
            &self.user_apc
        } else {
            &self.system_apc
        }
    }

    pub(crate) fn inflight(&self) -> &RefCell<InflightCache> {
        &self.inflight
    }

    pub(crate) fn captured_context(&self) -> &RefCell<Option<Box<ThreadContext>>> {
        &self.captured
    }

    pub(crate) fn context_from_suspend(&self) -> bool {
        self.context_from_suspend.get()
    }

    pub(crate) fn set_context_from_suspend(&self, value: bool) {
        self.context_from_suspend.set(value);
    }

    /// Arm a debug break for the next suspend-context capture.
    pub fn request_debug_break(&self) {
        self.debug_break.set(true);
    }

    pub(crate) fn take_debug_break(&self) -> bool {
        self.debug_break.replace(false)
    }

    pub(crate) fn set_token(&self, token: Option<Rc<dyn Object>>) {
        *self.token.borrow_mut() = token;
    }

    pub fn token(&self) -> Option<Rc<dyn Object>> {
        self.token.borrow().clone()
    }

    /// Depth of the nested wait stack.
    pub fn wait_depth(&self) -> usize {
        let mut depth = 0;
        let guard = self.wait.borrow();
        let mut wait = guard.as_deref();
        while let Some(w) = wait {
            depth += 1;
            wait = w.next.as_deref();
        }
        depth
    }
}

impl Object for Thread {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn dump(&self) -> String {
        format!(
            "thread id={:04x} unix={}/{} state={:?} suspend={}",
            self.id(),
            self.unix_pid(),
            self.unix_tid(),
            self.state(),
            self.suspend_count()
        )
    }

    /// A thread handle is signaled once the thread has terminated.
    fn signaled(&self, _thread: &Rc<Thread>) -> bool {
        self.is_terminated()
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Create a thread attached to `process`, adopting `request_fd` as its
/// request channel.
///
/// Fails with `STATUS_PROCESS_IS_TERMINATING` when the process is already
/// exiting, or `STATUS_NO_MEMORY` when the id namespace is exhausted (the
/// global-list insertion is rolled back).
pub fn create_thread(
    engine: &Engine,
    request_fd: OwnedFd,
    process: &Rc<Process>,
) -> Option<Rc<Thread>> {
    if process.is_terminating() {
        set_error(STATUS_PROCESS_IS_TERMINATING);
        return None;
    }

    let thread = Rc::new(Thread {
        header: ObjectHeader::new(),
        id: Cell::new(0),
        process: process.clone(),
        unix_pid: Cell::new(-1),
        unix_tid: Cell::new(-1),
        teb: Cell::new(0),
        entry_point: Cell::new(0),
        state: Cell::new(RunState::Running),
        creation_time: engine.current_time(),
        exit_time: Cell::new(0),
        exit_code: Cell::new(0),
        priority: Cell::new(0),
        affinity: Cell::new(process.affinity()),
        suspend: Cell::new(0),
        request_fd: RefCell::new(Some(request_fd)),
        reply_fd: RefCell::new(None),
        wake_channel: RefCell::new(None),
        wait: RefCell::new(None),
        system_apc: RefCell::new(VecDeque::new()),
        user_apc: RefCell::new(VecDeque::new()),
        mutex_list: RefCell::new(Vec::new()),
        inflight: RefCell::new(InflightCache::new()),
        captured: RefCell::new(None),
        context_from_suspend: Cell::new(false),
        debug_break: Cell::new(false),
        token: RefCell::new(None),
    });

    if !engine.registry().insert_thread(&thread) {
        return None;
    }
    process.add_thread(&thread);
    debug!(
        "[PS] created thread {:04x} in process {:04x}",
        thread.id(),
        process.id()
    );
    Some(thread)
}

/// Resolve a thread handle in the current thread's table.
pub fn get_thread_from_handle(
    current: &Rc<Thread>,
    handle: ObjHandle,
    access: u32,
) -> Option<Rc<Thread>> {
    let obj = current.process().handle_table().get(handle, access)?;
    match object_as::<Thread>(obj) {
        Some(thread) => Some(thread),
        None => {
            set_error(STATUS_OBJECT_TYPE_MISMATCH);
            None
        }
    }
}

/// Deliver a kick signal to the client OS thread.
///
/// A target whose OS thread is gone clears the recorded unix ids and
/// reports failure.
pub fn send_thread_signal(engine: &Engine, thread: &Thread, signal: KickSignal) -> bool {
    if thread.unix_pid.get() == -1 {
        return false;
    }
    let ok = engine
        .kicker()
        .send_thread_signal(thread.unix_pid.get(), thread.unix_tid.get(), signal);
    if !ok {
        // The OS thread is gone.
        thread.set_unix_ids(-1, -1);
    }
    ok
}

/// Write one `{cookie, signaled}` record on the thread's wake channel.
///
/// Returns 0 on success. A broken pipe kills the thread non-violently; any
/// other transport failure is a fatal protocol error. Both report -1.
pub fn send_thread_wakeup(engine: &Engine, thread: &Rc<Thread>, cookie: u64, signaled: i32) -> i32 {
    let reply = WakeupReply { cookie, signaled };
    let result = match &*thread.wake_channel.borrow() {
        Some(channel) => channel.send(&reply),
        None => Err(ChannelError::Closed),
    };
    match result {
        Ok(()) => 0,
        Err(ChannelError::Closed) => {
            kill_thread(engine, thread, false);
            -1
        }
        Err(ChannelError::Io(err)) => {
            error!(
                "[PS] wake channel failure on thread {:04x}: {}",
                thread.id(),
                err
            );
            fatal_protocol_error(engine, thread, "wake channel write failed");
            -1
        }
    }
}

/// Tear down a thread that sent corrupt or impossible wire input.
pub fn fatal_protocol_error(engine: &Engine, thread: &Rc<Thread>, reason: &str) {
    error!("[PS] fatal protocol error: {} ({})", reason, thread.dump());
    thread.exit_code.set(1);
    kill_thread(engine, thread, true);
}

/// Stop the client OS thread with a kick signal.
///
/// Skipped when a context is already captured (the thread is inside a
/// debug event) or while process initialization is still in progress.
pub(crate) fn stop_thread(engine: &Engine, thread: &Thread) {
    if thread.captured.borrow().is_some() {
        return;
    }
    if thread.process().is_init_done() {
        send_thread_signal(engine, thread, KickSignal::Kick);
    }
}

/// Stop the thread again if it is still effectively suspended.
pub(crate) fn stop_thread_if_suspended(engine: &Engine, thread: &Thread) {
    if thread.effectively_suspended() {
        stop_thread(engine, thread);
    }
}

/// Increment the suspend counter. Returns the previous count.
///
/// The 0 -> 1 effective transition stops the OS thread. Saturation
/// reports `STATUS_SUSPEND_COUNT_EXCEEDED` and changes nothing.
pub fn suspend_thread(engine: &Engine, thread: &Rc<Thread>) -> u32 {
    let old = thread.suspend.get();
    if old < MAXIMUM_SUSPEND_COUNT {
        let was_running = thread.process.suspend_count() + old == 0;
        thread.suspend.set(old + 1);
        if was_running {
            stop_thread(engine, thread);
        }
    } else {
        set_error(STATUS_SUSPEND_COUNT_EXCEEDED);
    }
    old
}

/// Decrement the suspend counter. Returns the previous count.
///
/// The 1 -> 0 effective transition re-runs the wake-up check so a wait
/// that became satisfiable while suspended completes now. Over-resume is
/// tolerated.
pub fn resume_thread(engine: &Engine, thread: &Rc<Thread>) -> u32 {
    let old = thread.suspend.get();
    if old > 0 {
        thread.suspend.set(old - 1);
        if old - 1 + thread.process.suspend_count() == 0 {
            wake_thread(engine, thread);
        }
    }
    old
}

/// Kill a thread.
///
/// Idempotent. Drains every nested wait, delivering the exit code to each
/// as its wake-up status, wakes the thread's own joiners, abandons held
/// mutexes, runs cleanup and detaches the thread from its process and
/// from the registry. The quit signal is sent only for a violent death
/// with no wait pending (a waiting client is parked on its wake channel
/// and needs no signal to notice).
pub fn kill_thread(engine: &Engine, thread: &Rc<Thread>, mut violent: bool) {
    if thread.is_terminated() {
        return;
    }
    thread.state.set(RunState::Terminated);
    thread.exit_time.set(engine.current_time());
    debug!(
        "[PS] killed thread {:04x} exit_code={}",
        thread.id(),
        thread.exit_code.get()
    );

    if thread.wait.borrow().is_some() {
        violent = false;
        while thread.wait.borrow().is_some() {
            let cookie = thread.wait.borrow().as_ref().map(|w| w.cookie).unwrap_or(0);
            end_wait(engine, thread);
            send_thread_wakeup(engine, thread, cookie, thread.exit_code.get());
        }
    }

    if let Some(hooks) = engine.debugger() {
        hooks.exit_thread(thread);
    }
    abandon_mutexes(engine, thread);
    wake_up(engine, &**thread, 0);
    if violent {
        send_thread_signal(engine, thread, KickSignal::Quit);
    }
    cleanup_thread(engine, thread);
    thread.process.remove_thread(engine, thread);
    engine.registry().remove_thread(thread);
}

/// Release everything a dead thread still holds.
///
/// Runs at kill time; repeating any part of it later (at final drop) is
/// harmless.
pub fn cleanup_thread(engine: &Engine, thread: &Rc<Thread>) {
    trace!("[PS] cleanup thread {:04x}", thread.id());
    clear_apc_queue(engine, thread, false);
    clear_apc_queue(engine, thread, true);
    thread.inflight.borrow_mut().clear();
    *thread.request_fd.borrow_mut() = None;
    *thread.reply_fd.borrow_mut() = None;
    *thread.wake_channel.borrow_mut() = None;
    *thread.captured.borrow_mut() = None;
    thread.context_from_suspend.set(false);
    *thread.token.borrow_mut() = None;
    engine.registry().unindex_unix_pid(thread);
}
