//! The Server Engine
//!
//! One [`Engine`] value per server process. It owns the thread registry,
//! the logical clock, the timer queue, and the host-provided collaborator
//! interfaces (kick signals, wake-channel transport, debugger hooks).
//! Request handlers receive the engine explicitly; there is no global
//! state.
//!
//! The dispatcher is single-threaded and cooperative: one request runs to
//! completion before the next is picked up, so every mutation performed
//! through the engine is atomic from other clients' point of view. The
//! host advances the clock once per dispatch tick and fires due timers
//! between requests.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::debug;

use crate::dbgk::DebuggerHooks;
use crate::ke::context::CpuMask;
use crate::ke::timer::{Timeout, TimerQueue};
use crate::lpc::channel::{ThreadKicker, TransportFactory};
use crate::ps::inflight::InflightLookup;
use crate::ps::process::{Process, ProcessOptions};
use crate::ps::registry::ThreadRegistry;
use crate::ps::thread::kill_thread;
use crate::status::{set_error, STATUS_NO_MEMORY};

/// Collaborators and configuration for an engine.
pub struct EngineOptions {
    pub timers: Rc<dyn TimerQueue>,
    pub kicker: Rc<dyn ThreadKicker>,
    pub transport: Rc<dyn TransportFactory>,
    /// Architectures this server build can run clients of.
    pub supported_cpus: CpuMask,
    /// Architectures the installation prefix permits.
    pub prefix_cpus: CpuMask,
    /// Timestamp recorded as the server start, in clock ticks.
    pub start_time: Timeout,
    /// Miss behavior of the in-flight descriptor cache.
    pub inflight_lookup: InflightLookup,
}

/// Per-server state and collaborator interfaces.
pub struct Engine {
    registry: ThreadRegistry,
    timers: Rc<dyn TimerQueue>,
    kicker: Rc<dyn ThreadKicker>,
    transport: Rc<dyn TransportFactory>,
    debugger: RefCell<Option<Rc<dyn DebuggerHooks>>>,
    now: Cell<Timeout>,
    start_time: Timeout,
    supported_cpus: CpuMask,
    prefix_cpus: CpuMask,
    inflight_lookup: InflightLookup,
    next_wait_token: Cell<u64>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            registry: ThreadRegistry::new(),
            timers: options.timers,
            kicker: options.kicker,
            transport: options.transport,
            debugger: RefCell::new(None),
            now: Cell::new(options.start_time),
            start_time: options.start_time,
            supported_cpus: options.supported_cpus,
            prefix_cpus: options.prefix_cpus,
            inflight_lookup: options.inflight_lookup,
            next_wait_token: Cell::new(1),
        }
    }

    #[inline]
    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    #[inline]
    pub fn timers(&self) -> &Rc<dyn TimerQueue> {
        &self.timers
    }

    #[inline]
    pub fn kicker(&self) -> &Rc<dyn ThreadKicker> {
        &self.kicker
    }

    #[inline]
    pub fn transport(&self) -> &Rc<dyn TransportFactory> {
        &self.transport
    }

    pub fn debugger(&self) -> Option<Rc<dyn DebuggerHooks>> {
        self.debugger.borrow().clone()
    }

    pub fn set_debugger(&self, hooks: Option<Rc<dyn DebuggerHooks>>) {
        *self.debugger.borrow_mut() = hooks;
    }

    /// Current server time in ticks.
    #[inline]
    pub fn current_time(&self) -> Timeout {
        self.now.get()
    }

    /// Advance the clock. Called by the host once per dispatch tick;
    /// time never moves backwards.
    pub fn set_current_time(&self, now: Timeout) {
        if now > self.now.get() {
            self.now.set(now);
        }
    }

    #[inline]
    pub fn start_time(&self) -> Timeout {
        self.start_time
    }

    #[inline]
    pub fn supported_cpus(&self) -> CpuMask {
        self.supported_cpus
    }

    #[inline]
    pub fn prefix_cpus(&self) -> CpuMask {
        self.prefix_cpus
    }

    #[inline]
    pub fn inflight_lookup(&self) -> InflightLookup {
        self.inflight_lookup
    }

    pub(crate) fn next_wait_token(&self) -> u64 {
        let token = self.next_wait_token.get();
        self.next_wait_token.set(token + 1);
        token
    }

    /// Register a process record, drawing its id from the shared ticket
    /// namespace. `STATUS_NO_MEMORY` when the namespace is exhausted.
    pub fn create_process(&self, options: ProcessOptions) -> Option<Rc<Process>> {
        let process = Process::alloc(self, options);
        match self.registry.alloc_process_id(&process) {
            Some(id) => {
                process.set_id(id);
                debug!("[PS] created process {:04x}", id);
                Some(process)
            }
            None => {
                set_error(STATUS_NO_MEMORY);
                None
            }
        }
    }

    /// Drop a process record's ticket.
    pub fn release_process(&self, process: &Rc<Process>) {
        self.registry.free_process_id(process.id());
    }

    /// Kill every remaining thread and release its resources. The engine
    /// stays usable; a restarting host builds a fresh one instead.
    pub fn shutdown(&self) {
        for thread in self.registry.all_threads() {
            kill_thread(self, &thread, true);
        }
    }
}
