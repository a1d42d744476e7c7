//! Thread Register Contexts
//!
//! The server never interprets client register state; it stores captured
//! contexts, merges requested register categories, and partitions out the
//! system registers (debug registers on x86 and x86-64, none elsewhere)
//! that only dedicated per-CPU helpers may touch.
//!
//! A context is captured when a suspended client thread reports in through
//! `set_suspend_context`; it is handed back exactly once through
//! `get_suspend_context`. While captured it also serves
//! `get_thread_context`/`set_thread_context` requests from other threads.

use std::rc::Rc;

use bitflags::bitflags;
use log::debug;

use crate::engine::Engine;
use crate::ps::thread::Thread;
use crate::status::{set_error, STATUS_INVALID_PARAMETER};

/// Client CPU architectures the protocol knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CpuType {
    X86 = 0,
    X86_64 = 1,
    PowerPc = 2,
    Arm = 3,
    Arm64 = 4,
}

bitflags! {
    /// Set of CPU architectures, as exchanged in `init_thread`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuMask: u32 {
        const X86     = 1 << CpuType::X86 as u32;
        const X86_64  = 1 << CpuType::X86_64 as u32;
        const POWERPC = 1 << CpuType::PowerPc as u32;
        const ARM     = 1 << CpuType::Arm as u32;
        const ARM64   = 1 << CpuType::Arm64 as u32;
    }
}

impl From<CpuType> for CpuMask {
    fn from(cpu: CpuType) -> Self {
        CpuMask::from_bits_truncate(1 << cpu as u32)
    }
}

bitflags! {
    /// Register categories selectable on context transfers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        const CONTROL         = 0x01;
        const INTEGER         = 0x02;
        const SEGMENTS        = 0x04;
        const FLOATING_POINT  = 0x08;
        const DEBUG_REGISTERS = 0x10;
    }
}

/// Captured register state, tagged with its CPU type.
///
/// The register banks are opaque to the core; their layout is a contract
/// between the client and the per-CPU modules. Only the instruction
/// pointer is interpreted here (for synthetic breakpoints).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadContext {
    pub cpu: CpuType,
    /// Categories that carry valid data.
    pub flags: ContextFlags,
    pub ip: u64,
    pub sp: u64,
    pub control: [u64; 4],
    pub integer: [u64; 16],
    pub segments: [u64; 6],
    pub fp: [u64; 32],
    pub debug: [u64; 8],
}

impl ThreadContext {
    pub fn new(cpu: CpuType) -> Self {
        Self {
            cpu,
            flags: ContextFlags::empty(),
            ip: 0,
            sp: 0,
            control: [0; 4],
            integer: [0; 16],
            segments: [0; 6],
            fp: [0; 32],
            debug: [0; 8],
        }
    }
}

/// Register categories owned by the server-side per-CPU helpers rather
/// than the client: debug registers on x86 and x86-64, nothing elsewhere.
pub fn system_flags(cpu: CpuType) -> ContextFlags {
    match cpu {
        CpuType::X86 | CpuType::X86_64 => ContextFlags::DEBUG_REGISTERS,
        CpuType::PowerPc | CpuType::Arm | CpuType::Arm64 => ContextFlags::empty(),
    }
}

/// Merge the client-accessible categories selected by `flags` from `src`
/// into `dst`. System categories must be masked out by the caller.
pub fn copy_context(dst: &mut ThreadContext, src: &ThreadContext, flags: ContextFlags) {
    if flags.contains(ContextFlags::CONTROL) {
        dst.ip = src.ip;
        dst.sp = src.sp;
        dst.control = src.control;
    }
    if flags.contains(ContextFlags::INTEGER) {
        dst.integer = src.integer;
    }
    if flags.contains(ContextFlags::SEGMENTS) {
        dst.segments = src.segments;
    }
    if flags.contains(ContextFlags::FLOATING_POINT) {
        dst.fp = src.fp;
    }
    dst.flags |= flags
        & (ContextFlags::CONTROL
            | ContextFlags::INTEGER
            | ContextFlags::SEGMENTS
            | ContextFlags::FLOATING_POINT);
}

/// Fetch system registers from a captured context.
pub fn get_system_regs(dst: &mut ThreadContext, src: &ThreadContext, flags: ContextFlags) {
    if flags.contains(ContextFlags::DEBUG_REGISTERS) {
        dst.debug = src.debug;
        dst.flags |= ContextFlags::DEBUG_REGISTERS;
    }
}

/// Store system registers into a captured context.
pub fn set_system_regs(dst: &mut ThreadContext, src: &ThreadContext, flags: ContextFlags) {
    if flags.contains(ContextFlags::DEBUG_REGISTERS) {
        dst.debug = src.debug;
        dst.flags |= ContextFlags::DEBUG_REGISTERS;
    }
}

/// Record the register context a suspended client thread delivered.
///
/// Nested captures are rejected. A pending debug break fires a synthetic
/// breakpoint on the captured program counter.
pub fn set_suspend_context(engine: &Engine, thread: &Rc<Thread>, context: ThreadContext) {
    if thread.captured_context().borrow().is_some() {
        set_error(STATUS_INVALID_PARAMETER);
        return;
    }
    *thread.captured_context().borrow_mut() = Some(Box::new(context));
    thread.set_context_from_suspend(true);
    if thread.take_debug_break() {
        break_thread(engine, thread);
    }
}

/// Hand the suspend-time context back to the client, once.
pub fn get_suspend_context(thread: &Rc<Thread>) -> Option<Box<ThreadContext>> {
    if !thread.context_from_suspend() {
        set_error(STATUS_INVALID_PARAMETER);
        return None;
    }
    thread.set_context_from_suspend(false);
    match thread.captured_context().borrow_mut().take() {
        Some(context) => Some(context),
        None => {
            set_error(STATUS_INVALID_PARAMETER);
            None
        }
    }
}

/// Raise a synthetic breakpoint event on the captured program counter.
pub fn break_thread(engine: &Engine, thread: &Rc<Thread>) {
    let ip = match &*thread.captured_context().borrow() {
        Some(context) => context.ip,
        None => return,
    };
    debug!(
        "[KE] synthetic breakpoint thread={:04x} ip={:#x}",
        thread.id(),
        ip
    );
    if let Some(hooks) = engine.debugger() {
        hooks.break_event(thread, ip);
    }
}
