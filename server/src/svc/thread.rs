//! Thread Request Handlers
//!
//! Creation, initialization, termination, information, suspension and
//! register-context transfer.

use std::rc::Rc;

use bitflags::bitflags;
use log::debug;

use crate::engine::Engine;
use crate::ke::context::{
    copy_context, get_suspend_context, get_system_regs, set_suspend_context, set_system_regs,
    system_flags, ContextFlags, CpuMask, CpuType, ThreadContext,
};
use crate::ke::timer::Timeout;
use crate::ob::{access, ObjHandle};
use crate::ps::process::Affinity;
use crate::ps::thread::{
    create_thread, get_thread_from_handle, kill_thread, resume_thread,
    stop_thread_if_suspended, suspend_thread, RunState, Thread, THREAD_PRIORITY_HIGHEST,
    THREAD_PRIORITY_IDLE, THREAD_PRIORITY_LOWEST, THREAD_PRIORITY_REALTIME_HIGHEST,
    THREAD_PRIORITY_REALTIME_LOWEST, THREAD_PRIORITY_TIME_CRITICAL,
};
use crate::ps::PriorityClass;
use crate::status::{
    set_error, STATUS_ACCESS_DENIED, STATUS_INVALID_HANDLE, STATUS_INVALID_PARAMETER,
    STATUS_NOT_REGISTRY_FILE, STATUS_NOT_SUPPORTED, STATUS_PENDING,
    STATUS_THREAD_IS_TERMINATING, STATUS_TOO_MANY_OPENED_FILES, STATUS_UNSUCCESSFUL,
};

use super::SERVER_PROTOCOL_VERSION;

pub struct NewThreadRequest {
    /// Client number of the in-flight request-channel descriptor.
    pub request_fd: i32,
    pub access: u32,
    pub attributes: u32,
    pub suspend: bool,
}

#[derive(Default)]
pub struct NewThreadReply {
    pub tid: u32,
    pub handle: ObjHandle,
}

/// Create a thread in the calling process.
pub fn req_new_thread(
    engine: &Engine,
    current: &Rc<Thread>,
    req: &NewThreadRequest,
    reply: &mut NewThreadReply,
) {
    let request_fd = current
        .inflight()
        .borrow_mut()
        .take(req.request_fd, engine.inflight_lookup());
    let Some(request_fd) = request_fd else {
        set_error(STATUS_INVALID_HANDLE);
        return;
    };
    let Some(thread) = create_thread(engine, request_fd, current.process()) else {
        return;
    };
    if req.suspend {
        // Not started yet, so no stop signal is involved.
        thread.set_suspend_count(1);
    }
    reply.tid = thread.id();
    reply.handle = current
        .process()
        .handle_table()
        .alloc(thread.clone(), req.access);
    if reply.handle == 0 {
        kill_thread(engine, &thread, true);
    }
}

pub struct InitThreadRequest {
    pub unix_pid: i32,
    pub unix_tid: i32,
    pub debug_level: u32,
    pub teb: u64,
    pub entry: u64,
    /// Client numbers of the in-flight reply and wake descriptors.
    pub reply_fd: i32,
    pub wait_fd: i32,
    pub cpu: CpuType,
}

pub struct InitThreadReply {
    pub pid: u32,
    pub tid: u32,
    pub version: u32,
    pub server_start: Timeout,
    pub all_cpus: CpuMask,
    pub info_size: u32,
}

impl Default for InitThreadReply {
    fn default() -> Self {
        Self {
            pid: 0,
            tid: 0,
            version: 0,
            server_start: 0,
            all_cpus: CpuMask::empty(),
            info_size: 0,
        }
    }
}

/// One-shot thread initialization, called first on every new connection.
///
/// The first thread of a process also finalizes the process: CPU type,
/// affinity adoption for parentless processes, initial process init.
pub fn req_init_thread(
    engine: &Engine,
    current: &Rc<Thread>,
    req: &InitThreadRequest,
    reply: &mut InitThreadReply,
) {
    let lookup = engine.inflight_lookup();
    let Some(reply_fd) = current.inflight().borrow_mut().take(req.reply_fd, lookup) else {
        set_error(STATUS_TOO_MANY_OPENED_FILES);
        return;
    };
    let Some(wait_fd) = current.inflight().borrow_mut().take(req.wait_fd, lookup) else {
        set_error(STATUS_TOO_MANY_OPENED_FILES);
        return;
    };

    if current.is_initialized() {
        set_error(STATUS_INVALID_PARAMETER);
        return;
    }
    if req.teb == 0 || req.teb % 4 != 0 {
        set_error(STATUS_INVALID_PARAMETER);
        return;
    }

    current.adopt_reply_fd(reply_fd);
    current.set_wake_channel(engine.transport().wake_channel(wait_fd));
    current.set_unix_ids(req.unix_pid, req.unix_tid);
    current.set_teb(req.teb);
    current.set_entry_point(req.entry);
    engine.registry().index_unix_pid(current);

    let process = current.process().clone();
    if !process.is_init_done() {
        let flag = CpuMask::from(req.cpu);
        if !engine.supported_cpus().contains(flag) {
            set_error(STATUS_NOT_SUPPORTED);
            return;
        }
        if !engine.prefix_cpus().contains(flag) {
            // The server could run this client, the prefix cannot.
            set_error(STATUS_NOT_REGISTRY_FILE);
            return;
        }
        process.set_unix_pid(req.unix_pid);
        process.set_cpu(req.cpu);
        reply.info_size = process.finish_init(current);
        if process.is_parentless() {
            process.set_affinity(current.affinity());
        } else {
            current.set_affinity(process.affinity());
        }
    } else {
        if process.cpu() != Some(req.cpu) {
            set_error(STATUS_INVALID_PARAMETER);
            return;
        }
        if process.unix_pid() != req.unix_pid {
            // Threads reporting different pids: pid tracking is off.
            process.set_unix_pid(-1);
        }
        stop_thread_if_suspended(engine, current);
        if let Some(hooks) = engine.debugger() {
            hooks.create_thread(current);
        }
        current.set_affinity(process.affinity());
    }
    debug!(
        "[SVC] init thread {:04x} unix={}/{} debug_level={}",
        current.id(),
        req.unix_pid,
        req.unix_tid,
        req.debug_level
    );

    reply.pid = process.id();
    reply.tid = current.id();
    reply.version = SERVER_PROTOCOL_VERSION;
    reply.server_start = engine.start_time();
    reply.all_cpus = engine.supported_cpus() & engine.prefix_cpus();
}

pub struct TerminateThreadRequest {
    pub handle: ObjHandle,
    pub exit_code: i32,
}

#[derive(Default)]
pub struct TerminateThreadReply {
    /// The target was the calling thread; it must exit its request loop
    /// itself.
    pub is_self: bool,
    /// It was the last running thread of its process.
    pub last: bool,
}

pub fn req_terminate_thread(
    engine: &Engine,
    current: &Rc<Thread>,
    req: &TerminateThreadRequest,
    reply: &mut TerminateThreadReply,
) {
    let Some(thread) = get_thread_from_handle(current, req.handle, access::THREAD_TERMINATE)
    else {
        return;
    };
    thread.set_exit_code(req.exit_code);
    if Rc::ptr_eq(&thread, current) {
        reply.is_self = true;
        reply.last = thread.process().running_threads() == 1;
    } else {
        kill_thread(engine, &thread, true);
    }
}

pub struct OpenThreadRequest {
    pub tid: u32,
    pub access: u32,
    pub attributes: u32,
}

#[derive(Default)]
pub struct OpenThreadReply {
    pub handle: ObjHandle,
}

pub fn req_open_thread(
    engine: &Engine,
    current: &Rc<Thread>,
    req: &OpenThreadRequest,
    reply: &mut OpenThreadReply,
) {
    let Some(thread) = engine.registry().get_thread_from_id(req.tid) else {
        return;
    };
    reply.handle = current
        .process()
        .handle_table()
        .alloc(thread, req.access);
}

pub struct GetThreadInfoRequest {
    /// Zero means look up by `tid_in` instead.
    pub handle: ObjHandle,
    pub tid_in: u32,
}

#[derive(Default)]
pub struct GetThreadInfoReply {
    pub pid: u32,
    pub tid: u32,
    pub teb: u64,
    pub exit_code: i32,
    pub priority: i32,
    pub affinity: u64,
    pub creation_time: Timeout,
    pub exit_time: Timeout,
    pub last: bool,
}

pub fn req_get_thread_info(
    engine: &Engine,
    current: &Rc<Thread>,
    req: &GetThreadInfoRequest,
    reply: &mut GetThreadInfoReply,
) {
    let thread = if req.handle == 0 {
        engine.registry().get_thread_from_id(req.tid_in)
    } else {
        get_thread_from_handle(current, req.handle, access::THREAD_QUERY_INFORMATION)
    };
    let Some(thread) = thread else {
        return;
    };
    reply.pid = thread.process().id();
    reply.tid = thread.id();
    reply.teb = thread.teb();
    reply.exit_code = if thread.is_terminated() {
        thread.exit_code()
    } else {
        STATUS_PENDING.code() as i32
    };
    reply.priority = thread.priority();
    reply.affinity = thread.affinity().0;
    reply.creation_time = thread.creation_time();
    reply.exit_time = thread.exit_time();
    reply.last = thread.process().running_threads() == 1;
}

bitflags! {
    /// Field selector for `set_thread_info`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SetThreadInfoMask: u32 {
        const PRIORITY = 1;
        const AFFINITY = 2;
        const TOKEN = 4;
    }
}

pub struct SetThreadInfoRequest {
    pub handle: ObjHandle,
    pub mask: SetThreadInfoMask,
    pub priority: i32,
    pub affinity: u64,
    pub token: ObjHandle,
}

pub fn req_set_thread_info(
    engine: &Engine,
    current: &Rc<Thread>,
    req: &SetThreadInfoRequest,
) {
    let _ = engine;
    let Some(thread) = get_thread_from_handle(current, req.handle, access::THREAD_SET_INFORMATION)
    else {
        return;
    };

    if req.mask.contains(SetThreadInfoMask::PRIORITY) {
        let (min, max) = if thread.process().priority_class() == PriorityClass::Realtime {
            (
                THREAD_PRIORITY_REALTIME_LOWEST,
                THREAD_PRIORITY_REALTIME_HIGHEST,
            )
        } else {
            (THREAD_PRIORITY_LOWEST, THREAD_PRIORITY_HIGHEST)
        };
        if (req.priority < min || req.priority > max)
            && req.priority != THREAD_PRIORITY_IDLE
            && req.priority != THREAD_PRIORITY_TIME_CRITICAL
        {
            set_error(STATUS_INVALID_PARAMETER);
        } else if thread.is_terminated() {
            set_error(STATUS_THREAD_IS_TERMINATING);
        } else {
            thread.set_priority(req.priority);
        }
    }

    if req.mask.contains(SetThreadInfoMask::AFFINITY) {
        let affinity = Affinity(req.affinity);
        if affinity.is_empty() || !affinity.is_subset_of(thread.process().affinity()) {
            set_error(STATUS_INVALID_PARAMETER);
        } else if thread.is_terminated() {
            set_error(STATUS_THREAD_IS_TERMINATING);
        } else {
            thread.set_affinity(affinity);
        }
    }

    if req.mask.contains(SetThreadInfoMask::TOKEN) {
        if req.token == 0 {
            thread.set_token(None);
        } else if let Some(token) = current.process().handle_table().get(req.token, 0) {
            thread.set_token(Some(token));
        }
    }
}

pub struct SuspendThreadRequest {
    pub handle: ObjHandle,
}

#[derive(Default)]
pub struct SuspendThreadReply {
    /// Suspend count before the operation.
    pub count: u32,
}

pub fn req_suspend_thread(
    engine: &Engine,
    current: &Rc<Thread>,
    req: &SuspendThreadRequest,
    reply: &mut SuspendThreadReply,
) {
    let Some(thread) = get_thread_from_handle(current, req.handle, access::THREAD_SUSPEND_RESUME)
    else {
        return;
    };
    if thread.is_terminated() {
        set_error(STATUS_ACCESS_DENIED);
        return;
    }
    reply.count = suspend_thread(engine, &thread);
}

pub fn req_resume_thread(
    engine: &Engine,
    current: &Rc<Thread>,
    req: &SuspendThreadRequest,
    reply: &mut SuspendThreadReply,
) {
    let Some(thread) = get_thread_from_handle(current, req.handle, access::THREAD_SUSPEND_RESUME)
    else {
        return;
    };
    if thread.is_terminated() {
        set_error(STATUS_ACCESS_DENIED);
        return;
    }
    reply.count = resume_thread(engine, &thread);
}

pub struct GetThreadContextRequest {
    pub handle: ObjHandle,
    pub flags: ContextFlags,
    /// Auto-suspend a running target so the retry finds it captured.
    pub suspend: bool,
}

#[derive(Default)]
pub struct GetThreadContextReply {
    pub context: Option<ThreadContext>,
}

pub fn req_get_thread_context(
    engine: &Engine,
    current: &Rc<Thread>,
    req: &GetThreadContextRequest,
    reply: &mut GetThreadContextReply,
) {
    let Some(thread) = get_thread_from_handle(current, req.handle, access::THREAD_GET_CONTEXT)
    else {
        return;
    };
    let captured = thread.captured_context().borrow();
    match captured.as_deref() {
        Some(context) => {
            let system = system_flags(context.cpu);
            let mut out = ThreadContext::new(context.cpu);
            copy_context(&mut out, context, req.flags & !system);
            get_system_regs(&mut out, context, req.flags & system);
            reply.context = Some(out);
        }
        None => {
            drop(captured);
            if thread.state() == RunState::Running {
                set_error(STATUS_PENDING);
                if req.suspend {
                    suspend_thread(engine, &thread);
                }
            } else {
                set_error(STATUS_UNSUCCESSFUL);
            }
        }
    }
}

pub struct SetThreadContextRequest {
    pub handle: ObjHandle,
    pub suspend: bool,
    /// `context.flags` selects the categories to store.
    pub context: ThreadContext,
}

pub fn req_set_thread_context(
    engine: &Engine,
    current: &Rc<Thread>,
    req: &SetThreadContextRequest,
) {
    let Some(thread) = get_thread_from_handle(current, req.handle, access::THREAD_SET_CONTEXT)
    else {
        return;
    };
    if let Some(cpu) = thread.process().cpu() {
        if req.context.cpu != cpu {
            set_error(STATUS_INVALID_PARAMETER);
            return;
        }
    }
    let mut captured = thread.captured_context().borrow_mut();
    match captured.as_deref_mut() {
        Some(context) => {
            let system = system_flags(context.cpu);
            copy_context(context, &req.context, req.context.flags & !system);
            set_system_regs(context, &req.context, req.context.flags & system);
        }
        None => {
            drop(captured);
            if thread.state() == RunState::Running {
                set_error(STATUS_PENDING);
                if req.suspend {
                    suspend_thread(engine, &thread);
                }
            } else {
                set_error(STATUS_UNSUCCESSFUL);
            }
        }
    }
}

#[derive(Default)]
pub struct GetSuspendContextReply {
    pub context: Option<ThreadContext>,
}

pub fn req_get_suspend_context(
    _engine: &Engine,
    current: &Rc<Thread>,
    reply: &mut GetSuspendContextReply,
) {
    if let Some(context) = get_suspend_context(current) {
        reply.context = Some(*context);
    }
}

pub struct SetSuspendContextRequest {
    pub context: ThreadContext,
}

pub fn req_set_suspend_context(
    engine: &Engine,
    current: &Rc<Thread>,
    req: &SetSuspendContextRequest,
) {
    set_suspend_context(engine, current, req.context.clone());
}

pub struct GetSelectorEntryRequest {
    pub handle: ObjHandle,
    pub entry: u32,
}

#[derive(Default)]
pub struct GetSelectorEntryReply {
    pub base: u32,
    pub limit: u32,
    pub flags: u8,
}

pub fn req_get_selector_entry(
    _engine: &Engine,
    current: &Rc<Thread>,
    req: &GetSelectorEntryRequest,
    reply: &mut GetSelectorEntryReply,
) {
    let Some(thread) = get_thread_from_handle(current, req.handle, access::THREAD_QUERY_INFORMATION)
    else {
        return;
    };
    let process = thread.process();
    if !process.has_ldt_copy() {
        set_error(STATUS_ACCESS_DENIED);
        return;
    }
    if req.entry >= 8192 {
        set_error(STATUS_INVALID_PARAMETER);
        return;
    }
    if let Some(entry) = process.ldt_entry(req.entry as usize) {
        reply.base = entry.base;
        reply.limit = entry.limit;
        reply.flags = entry.flags;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ps::process::LdtEntry;
    use crate::ps::thread::MAXIMUM_SUSPEND_COUNT;
    use crate::status::{clear_error, get_error, STATUS_INVALID_CID, STATUS_SUCCESS};
    use crate::test_support::{
        push_inflight, test_engine, test_initialized_thread, test_process, test_thread,
    };

    #[test]
    fn test_new_thread_bad_inflight_fd() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_thread(&engine, &process);

        let req = NewThreadRequest {
            request_fd: 42,
            access: access::THREAD_ALL_ACCESS,
            attributes: 0,
            suspend: false,
        };
        let mut reply = NewThreadReply::default();
        req_new_thread(&engine, &current, &req, &mut reply);
        assert_eq!(get_error(), STATUS_INVALID_HANDLE);
        assert_eq!(reply.handle, 0);
    }

    #[test]
    fn test_new_thread_suspended_create() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_thread(&engine, &process);
        push_inflight(&current, 9);

        let req = NewThreadRequest {
            request_fd: 9,
            access: access::THREAD_ALL_ACCESS,
            attributes: 0,
            suspend: true,
        };
        let mut reply = NewThreadReply::default();
        req_new_thread(&engine, &current, &req, &mut reply);
        assert_eq!(get_error(), STATUS_SUCCESS);
        assert_ne!(reply.handle, 0);

        let thread = engine.registry().get_thread_from_id(reply.tid).unwrap();
        assert_eq!(thread.suspend_count(), 1);
        // Created suspended before any OS thread exists: no kick yet.
        assert!(engine.test_kicks().is_empty());
    }

    #[test]
    fn test_init_thread_first_finalizes_process() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_thread(&engine, &process);
        push_inflight(&current, 3);
        push_inflight(&current, 4);

        let req = InitThreadRequest {
            unix_pid: 500,
            unix_tid: 501,
            debug_level: 0,
            teb: 0x7FFD_F000,
            entry: 0x40_1000,
            reply_fd: 3,
            wait_fd: 4,
            cpu: CpuType::X86_64,
        };
        let mut reply = InitThreadReply::default();
        req_init_thread(&engine, &current, &req, &mut reply);

        assert_eq!(get_error(), STATUS_SUCCESS);
        assert_eq!(reply.pid, process.id());
        assert_eq!(reply.tid, current.id());
        assert_eq!(reply.version, SERVER_PROTOCOL_VERSION);
        assert_eq!(reply.all_cpus, engine.supported_cpus());
        assert!(process.is_init_done());
        assert_eq!(process.cpu(), Some(CpuType::X86_64));
        assert_eq!(process.unix_pid(), 500);
        assert_eq!(current.teb(), 0x7FFD_F000);
        assert!(engine
            .registry()
            .get_thread_from_pid(500)
            .is_some_and(|t| Rc::ptr_eq(&t, &current)));
    }

    #[test]
    fn test_init_thread_is_one_shot() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_initialized_thread(&engine, &process, 600, 601);

        push_inflight(&current, 3);
        push_inflight(&current, 4);
        let req = InitThreadRequest {
            unix_pid: 600,
            unix_tid: 601,
            debug_level: 0,
            teb: 0x1000,
            entry: 0,
            reply_fd: 3,
            wait_fd: 4,
            cpu: CpuType::X86_64,
        };
        let mut reply = InitThreadReply::default();
        req_init_thread(&engine, &current, &req, &mut reply);
        assert_eq!(get_error(), STATUS_INVALID_PARAMETER);
    }

    #[test]
    fn test_init_thread_rejects_bad_teb() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_thread(&engine, &process);
        push_inflight(&current, 3);
        push_inflight(&current, 4);

        let req = InitThreadRequest {
            unix_pid: 1,
            unix_tid: 1,
            debug_level: 0,
            teb: 0x1001, // misaligned
            entry: 0,
            reply_fd: 3,
            wait_fd: 4,
            cpu: CpuType::X86_64,
        };
        let mut reply = InitThreadReply::default();
        req_init_thread(&engine, &current, &req, &mut reply);
        assert_eq!(get_error(), STATUS_INVALID_PARAMETER);
        assert!(!process.is_init_done());
    }

    #[test]
    fn test_init_thread_unsupported_cpu() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_thread(&engine, &process);
        push_inflight(&current, 3);
        push_inflight(&current, 4);

        let req = InitThreadRequest {
            unix_pid: 1,
            unix_tid: 1,
            debug_level: 0,
            teb: 0x1000,
            entry: 0,
            reply_fd: 3,
            wait_fd: 4,
            cpu: CpuType::PowerPc,
        };
        let mut reply = InitThreadReply::default();
        req_init_thread(&engine, &current, &req, &mut reply);
        assert_eq!(get_error(), STATUS_NOT_SUPPORTED);
    }

    #[test]
    fn test_init_thread_prefix_excluded_cpu() {
        clear_error();
        // Server supports x86 but the prefix does not.
        let engine = crate::test_support::test_engine_with_cpus(
            CpuMask::X86 | CpuMask::X86_64,
            CpuMask::X86_64,
        );
        let process = test_process(&engine);
        let current = test_thread(&engine, &process);
        push_inflight(&current, 3);
        push_inflight(&current, 4);

        let req = InitThreadRequest {
            unix_pid: 1,
            unix_tid: 1,
            debug_level: 0,
            teb: 0x1000,
            entry: 0,
            reply_fd: 3,
            wait_fd: 4,
            cpu: CpuType::X86,
        };
        let mut reply = InitThreadReply::default();
        req_init_thread(&engine, &current, &req, &mut reply);
        assert_eq!(get_error(), STATUS_NOT_REGISTRY_FILE);
    }

    #[test]
    fn test_terminate_self_reports_last() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_thread(&engine, &process);
        let handle = process
            .handle_table()
            .alloc(current.clone(), access::THREAD_ALL_ACCESS);

        let req = TerminateThreadRequest {
            handle,
            exit_code: 3,
        };
        let mut reply = TerminateThreadReply::default();
        req_terminate_thread(&engine, &current, &req, &mut reply);

        assert!(reply.is_self);
        assert!(reply.last);
        // Self-termination does not kill from within the call.
        assert!(!current.is_terminated());
        assert_eq!(current.exit_code(), 3);
    }

    #[test]
    fn test_terminate_other_kills() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_thread(&engine, &process);
        let victim = test_thread(&engine, &process);
        let handle = process
            .handle_table()
            .alloc(victim.clone(), access::THREAD_ALL_ACCESS);

        let req = TerminateThreadRequest {
            handle,
            exit_code: 9,
        };
        let mut reply = TerminateThreadReply::default();
        req_terminate_thread(&engine, &current, &req, &mut reply);

        assert!(!reply.is_self);
        assert!(victim.is_terminated());
        assert_eq!(victim.exit_code(), 9);
    }

    #[test]
    fn test_open_thread_and_info() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_thread(&engine, &process);
        let other = test_thread(&engine, &process);
        other.set_priority(2);

        let mut open_reply = OpenThreadReply::default();
        req_open_thread(
            &engine,
            &current,
            &OpenThreadRequest {
                tid: other.id(),
                access: access::THREAD_QUERY_INFORMATION,
                attributes: 0,
            },
            &mut open_reply,
        );
        assert_ne!(open_reply.handle, 0);

        let mut info = GetThreadInfoReply::default();
        req_get_thread_info(
            &engine,
            &current,
            &GetThreadInfoRequest {
                handle: open_reply.handle,
                tid_in: 0,
            },
            &mut info,
        );
        assert_eq!(info.tid, other.id());
        assert_eq!(info.pid, process.id());
        assert_eq!(info.priority, 2);
        // Still running: exit code reads as pending.
        assert_eq!(info.exit_code, STATUS_PENDING.code() as i32);
        assert!(!info.last);

        clear_error();
        let mut miss = OpenThreadReply::default();
        req_open_thread(
            &engine,
            &current,
            &OpenThreadRequest {
                tid: 0xBEEF,
                access: 0,
                attributes: 0,
            },
            &mut miss,
        );
        assert_eq!(get_error(), STATUS_INVALID_CID);
    }

    #[test]
    fn test_set_thread_info_priority_bounds() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_thread(&engine, &process);
        let handle = process
            .handle_table()
            .alloc(current.clone(), access::THREAD_ALL_ACCESS);

        // Out of class range, not a sentinel.
        req_set_thread_info(
            &engine,
            &current,
            &SetThreadInfoRequest {
                handle,
                mask: SetThreadInfoMask::PRIORITY,
                priority: 5,
                affinity: 0,
                token: 0,
            },
        );
        assert_eq!(get_error(), STATUS_INVALID_PARAMETER);
        assert_eq!(current.priority(), 0);

        // Sentinels pass anywhere.
        clear_error();
        req_set_thread_info(
            &engine,
            &current,
            &SetThreadInfoRequest {
                handle,
                mask: SetThreadInfoMask::PRIORITY,
                priority: THREAD_PRIORITY_TIME_CRITICAL,
                affinity: 0,
                token: 0,
            },
        );
        assert_eq!(get_error(), STATUS_SUCCESS);
        assert_eq!(current.priority(), THREAD_PRIORITY_TIME_CRITICAL);

        // Realtime class widens the range.
        process.set_priority_class(PriorityClass::Realtime);
        req_set_thread_info(
            &engine,
            &current,
            &SetThreadInfoRequest {
                handle,
                mask: SetThreadInfoMask::PRIORITY,
                priority: 5,
                affinity: 0,
                token: 0,
            },
        );
        assert_eq!(get_error(), STATUS_SUCCESS);
        assert_eq!(current.priority(), 5);
    }

    #[test]
    fn test_set_thread_info_affinity_subset() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        process.set_affinity(Affinity(0b0110));
        let current = test_thread(&engine, &process);
        let handle = process
            .handle_table()
            .alloc(current.clone(), access::THREAD_ALL_ACCESS);

        req_set_thread_info(
            &engine,
            &current,
            &SetThreadInfoRequest {
                handle,
                mask: SetThreadInfoMask::AFFINITY,
                priority: 0,
                affinity: 0b1000,
                token: 0,
            },
        );
        assert_eq!(get_error(), STATUS_INVALID_PARAMETER);

        clear_error();
        req_set_thread_info(
            &engine,
            &current,
            &SetThreadInfoRequest {
                handle,
                mask: SetThreadInfoMask::AFFINITY,
                priority: 0,
                affinity: 0b0100,
                token: 0,
            },
        );
        assert_eq!(get_error(), STATUS_SUCCESS);
        assert_eq!(current.affinity(), Affinity(0b0100));
        assert!(current.affinity().is_subset_of(process.affinity()));
    }

    #[test]
    fn test_suspend_resume_requests() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_thread(&engine, &process);
        let target = test_thread(&engine, &process);
        let handle = process
            .handle_table()
            .alloc(target.clone(), access::THREAD_ALL_ACCESS);

        let req = SuspendThreadRequest { handle };
        let mut reply = SuspendThreadReply::default();
        req_suspend_thread(&engine, &current, &req, &mut reply);
        assert_eq!(reply.count, 0);
        assert_eq!(target.suspend_count(), 1);

        req_resume_thread(&engine, &current, &req, &mut reply);
        assert_eq!(reply.count, 1);
        assert_eq!(target.suspend_count(), 0);

        // Saturation reported, counter unchanged.
        for _ in 0..MAXIMUM_SUSPEND_COUNT {
            req_suspend_thread(&engine, &current, &req, &mut reply);
        }
        clear_error();
        req_suspend_thread(&engine, &current, &req, &mut reply);
        assert_eq!(get_error(), crate::status::STATUS_SUSPEND_COUNT_EXCEEDED);
        assert_eq!(target.suspend_count(), MAXIMUM_SUSPEND_COUNT);

        kill_thread(&engine, &target, false);
        clear_error();
        req_suspend_thread(&engine, &current, &req, &mut reply);
        assert_eq!(get_error(), STATUS_ACCESS_DENIED);
    }

    #[test]
    fn test_suspend_context_capture_handoff() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_initialized_thread(&engine, &process, 700, 701);

        let mut context = ThreadContext::new(CpuType::X86_64);
        context.flags = ContextFlags::CONTROL;
        context.ip = 0xCAFE;
        req_set_suspend_context(
            &engine,
            &current,
            &SetSuspendContextRequest {
                context: context.clone(),
            },
        );
        assert_eq!(get_error(), STATUS_SUCCESS);

        // Nested capture rejected.
        req_set_suspend_context(&engine, &current, &SetSuspendContextRequest { context });
        assert_eq!(get_error(), STATUS_INVALID_PARAMETER);

        clear_error();
        let mut reply = GetSuspendContextReply::default();
        req_get_suspend_context(&engine, &current, &mut reply);
        assert_eq!(reply.context.unwrap().ip, 0xCAFE);

        // Handed off once; the slot is now empty.
        let mut reply = GetSuspendContextReply::default();
        req_get_suspend_context(&engine, &current, &mut reply);
        assert_eq!(get_error(), STATUS_INVALID_PARAMETER);
        assert!(reply.context.is_none());
    }

    #[test]
    fn test_get_context_running_target_pends() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_thread(&engine, &process);
        let target = test_initialized_thread(&engine, &process, 800, 801);
        let handle = process
            .handle_table()
            .alloc(target.clone(), access::THREAD_ALL_ACCESS);

        let req = GetThreadContextRequest {
            handle,
            flags: ContextFlags::CONTROL,
            suspend: true,
        };
        let mut reply = GetThreadContextReply::default();
        req_get_thread_context(&engine, &current, &req, &mut reply);
        assert_eq!(get_error(), STATUS_PENDING);
        assert!(reply.context.is_none());
        // Auto-suspend kicked in for the retry.
        assert_eq!(target.suspend_count(), 1);

        // The suspended client reports its context; the retry succeeds
        // and system registers stay partitioned.
        clear_error();
        let mut context = ThreadContext::new(CpuType::X86_64);
        context.flags = ContextFlags::CONTROL | ContextFlags::DEBUG_REGISTERS;
        context.ip = 0x1111;
        context.debug[0] = 0x2222;
        req_set_suspend_context(&engine, &target, &SetSuspendContextRequest { context });

        let mut reply = GetThreadContextReply::default();
        req_get_thread_context(
            &engine,
            &current,
            &GetThreadContextRequest {
                handle,
                flags: ContextFlags::CONTROL | ContextFlags::DEBUG_REGISTERS,
                suspend: false,
            },
            &mut reply,
        );
        let out = reply.context.unwrap();
        assert_eq!(out.ip, 0x1111);
        assert_eq!(out.debug[0], 0x2222);
    }

    #[test]
    fn test_set_context_cpu_mismatch() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_thread(&engine, &process);
        let target = test_initialized_thread(&engine, &process, 900, 901);
        let handle = process
            .handle_table()
            .alloc(target.clone(), access::THREAD_ALL_ACCESS);

        let context = ThreadContext::new(CpuType::X86);
        req_set_thread_context(
            &engine,
            &current,
            &SetThreadContextRequest {
                handle,
                suspend: false,
                context,
            },
        );
        assert_eq!(get_error(), STATUS_INVALID_PARAMETER);
    }

    #[test]
    fn test_selector_entry_lookup() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_thread(&engine, &process);
        let handle = process
            .handle_table()
            .alloc(current.clone(), access::THREAD_ALL_ACCESS);

        let req = GetSelectorEntryRequest { handle, entry: 0 };
        let mut reply = GetSelectorEntryReply::default();
        req_get_selector_entry(&engine, &current, &req, &mut reply);
        assert_eq!(get_error(), STATUS_ACCESS_DENIED);

        process.set_ldt_copy(Some(vec![LdtEntry {
            base: 0x5000,
            limit: 0xFFFF,
            flags: 0x92,
        }]));
        clear_error();
        req_get_selector_entry(&engine, &current, &req, &mut reply);
        assert_eq!(reply.base, 0x5000);
        assert_eq!(reply.flags, 0x92);

        clear_error();
        let req = GetSelectorEntryRequest {
            handle,
            entry: 8192,
        };
        req_get_selector_entry(&engine, &current, &req, &mut reply);
        assert_eq!(get_error(), STATUS_INVALID_PARAMETER);
    }

    #[test]
    fn test_debug_break_on_capture() {
        clear_error();
        let engine = test_engine();
        let process = test_process(&engine);
        let current = test_initialized_thread(&engine, &process, 910, 911);

        let breaks = engine.install_recording_debugger();
        current.request_debug_break();

        let mut context = ThreadContext::new(CpuType::X86_64);
        context.flags = ContextFlags::CONTROL;
        context.ip = 0xB00F;
        req_set_suspend_context(&engine, &current, &SetSuspendContextRequest { context });

        assert_eq!(*breaks.borrow(), vec![0xB00F]);
    }
}
