//! Shared test fixtures: an engine wired to recording collaborators and
//! helpers for building processes and threads without a live client.

use std::cell::{Cell, RefCell};
use std::ops::Deref;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use crate::dbgk::DebuggerHooks;
use crate::engine::{Engine, EngineOptions};
use crate::ke::context::{CpuMask, CpuType};
use crate::ke::timer::DeadlineList;
use crate::lpc::channel::{
    ChannelError, KickSignal, ThreadKicker, TransportFactory, WakeChannel, WakeupReply,
};
use crate::ps::inflight::InflightLookup;
use crate::ps::process::{Process, ProcessOptions};
use crate::ps::thread::{create_thread, Thread};

/// Shared state of the recording collaborators.
struct Recording {
    wakeups: RefCell<Vec<WakeupReply>>,
    kicks: RefCell<Vec<(i32, i32, KickSignal)>>,
    broken: Cell<bool>,
    kick_ok: Cell<bool>,
}

struct RecordingWakeChannel {
    state: Rc<Recording>,
}

impl WakeChannel for RecordingWakeChannel {
    fn send(&self, reply: &WakeupReply) -> Result<(), ChannelError> {
        if self.state.broken.get() {
            return Err(ChannelError::Closed);
        }
        self.state.wakeups.borrow_mut().push(*reply);
        Ok(())
    }
}

struct RecordingTransport {
    state: Rc<Recording>,
}

impl TransportFactory for RecordingTransport {
    fn wake_channel(&self, _fd: OwnedFd) -> Box<dyn WakeChannel> {
        Box::new(RecordingWakeChannel {
            state: self.state.clone(),
        })
    }
}

struct RecordingKicker {
    state: Rc<Recording>,
}

impl ThreadKicker for RecordingKicker {
    fn send_thread_signal(&self, unix_pid: i32, unix_tid: i32, signal: KickSignal) -> bool {
        self.state
            .kicks
            .borrow_mut()
            .push((unix_pid, unix_tid, signal));
        self.state.kick_ok.get()
    }
}

struct RecordingDebugger {
    breaks: Rc<RefCell<Vec<u64>>>,
}

impl DebuggerHooks for RecordingDebugger {
    fn break_event(&self, _thread: &Rc<Thread>, ip: u64) {
        self.breaks.borrow_mut().push(ip);
    }
}

/// Engine plus handles on its recording collaborators. Derefs to
/// [`Engine`] so fixtures drop straight into production signatures.
pub(crate) struct TestEngine {
    engine: Engine,
    state: Rc<Recording>,
    timers: Rc<DeadlineList>,
}

impl Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        &self.engine
    }
}

impl TestEngine {
    /// Every wake-up record written so far, all threads interleaved.
    pub fn test_wakeups(&self) -> Vec<WakeupReply> {
        self.state.wakeups.borrow().clone()
    }

    /// Every kick signal sent so far.
    pub fn test_kicks(&self) -> Vec<(i32, i32, KickSignal)> {
        self.state.kicks.borrow().clone()
    }

    /// Make every wake channel report a hung-up peer.
    pub fn set_broken_wake(&self, broken: bool) {
        self.state.broken.set(broken);
    }

    /// Make kick delivery fail (the OS thread is "gone").
    pub fn set_kick_ok(&self, ok: bool) {
        self.state.kick_ok.set(ok);
    }

    pub fn deadline_list(&self) -> Rc<DeadlineList> {
        self.timers.clone()
    }

    /// Attach a debugger recording breakpoint instruction pointers.
    pub fn install_recording_debugger(&self) -> Rc<RefCell<Vec<u64>>> {
        let breaks = Rc::new(RefCell::new(Vec::new()));
        self.engine.set_debugger(Some(Rc::new(RecordingDebugger {
            breaks: breaks.clone(),
        })));
        breaks
    }
}

pub(crate) fn test_engine() -> TestEngine {
    test_engine_with_cpus(
        CpuMask::X86 | CpuMask::X86_64,
        CpuMask::X86 | CpuMask::X86_64,
    )
}

pub(crate) fn test_engine_with_cpus(supported: CpuMask, prefix: CpuMask) -> TestEngine {
    let state = Rc::new(Recording {
        wakeups: RefCell::new(Vec::new()),
        kicks: RefCell::new(Vec::new()),
        broken: Cell::new(false),
        kick_ok: Cell::new(true),
    });
    let timers = Rc::new(DeadlineList::new());
    let engine = Engine::new(EngineOptions {
        timers: timers.clone(),
        kicker: Rc::new(RecordingKicker {
            state: state.clone(),
        }),
        transport: Rc::new(RecordingTransport {
            state: state.clone(),
        }),
        supported_cpus: supported,
        prefix_cpus: prefix,
        start_time: 0,
        inflight_lookup: InflightLookup::Strict,
    });
    TestEngine {
        engine,
        state,
        timers,
    }
}

/// A connected descriptor pair; either end stands in for a client
/// channel.
pub(crate) fn fd_pair() -> (OwnedFd, OwnedFd) {
    let (a, b) = UnixStream::pair().expect("socketpair");
    (OwnedFd::from(a), OwnedFd::from(b))
}

pub(crate) fn test_process(engine: &Engine) -> Rc<Process> {
    engine
        .create_process(ProcessOptions::default())
        .expect("process id available")
}

/// Create a thread with a recording wake channel already attached.
pub(crate) fn test_thread(engine: &Engine, process: &Rc<Process>) -> Rc<Thread> {
    let (request_fd, _peer) = fd_pair();
    let thread = create_thread(engine, request_fd, process).expect("create_thread");
    attach_wake_channel(engine, &thread);
    thread
}

pub(crate) fn attach_wake_channel(engine: &Engine, thread: &Rc<Thread>) {
    let (wake_fd, _peer) = fd_pair();
    thread.set_wake_channel(engine.transport().wake_channel(wake_fd));
}

/// A thread as it looks after `init_thread`, with its process finalized.
pub(crate) fn test_initialized_thread(
    engine: &Engine,
    process: &Rc<Process>,
    unix_pid: i32,
    unix_tid: i32,
) -> Rc<Thread> {
    let thread = test_thread(engine, process);
    let (reply_fd, _peer) = fd_pair();
    thread.adopt_reply_fd(reply_fd);
    thread.set_unix_ids(unix_pid, unix_tid);
    thread.set_teb(0x7FFD_0000);
    engine.registry().index_unix_pid(&thread);
    if !process.is_init_done() {
        process.set_cpu(CpuType::X86_64);
        process.set_unix_pid(unix_pid);
        process.finish_init(&thread);
    }
    thread
}

/// Park a descriptor in the thread's in-flight cache under `client`.
pub(crate) fn push_inflight(thread: &Rc<Thread>, client: i32) {
    let (fd, _peer) = fd_pair();
    thread
        .inflight()
        .borrow_mut()
        .add(client, fd)
        .expect("inflight slot");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::event::Event;
    use crate::ke::timer::TIMEOUT_INFINITE;
    use crate::ke::wait::{wait_on, SelectFlags};
    use crate::ob::Object;

    #[test]
    fn test_broken_wake_channel_kills_quietly() {
        // A hung-up wake channel tears the thread down non-violently.
        let engine = test_engine();
        let process = test_process(&engine);
        let thread = test_thread(&engine, &process);
        thread.set_unix_ids(5, 5);

        let event = Event::new(true, false);
        let objects: Vec<Rc<dyn Object>> = vec![event.clone()];
        assert!(wait_on(
            &engine,
            &thread,
            &objects,
            SelectFlags::empty(),
            TIMEOUT_INFINITE,
            0,
        ));

        engine.set_broken_wake(true);
        event.set(&engine);

        assert!(thread.is_terminated());
        // Non-violent: no quit signal was sent.
        assert!(engine
            .test_kicks()
            .iter()
            .all(|(_, _, sig)| *sig != KickSignal::Quit));
        assert!(engine.test_wakeups().is_empty());
        assert!(!event.header().has_waiters());
    }
}
