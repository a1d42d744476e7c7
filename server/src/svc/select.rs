//! Select and APC Request Handlers
//!
//! `select` is the workhorse request: it posts the result of the previous
//! APC, installs the new wait, and hands the next deliverable APC back to
//! the client. `queue_apc` and `get_apc_result` complete the cross-process
//! APC round trip.

use std::rc::Rc;

use crate::engine::Engine;
use crate::ke::apc::{
    create_apc, queue_apc, thread_dequeue_apc, Apc, ApcCall, ApcKind, ApcResult,
};
use crate::ke::select::select_on;
use crate::ke::timer::Timeout;
use crate::ke::wait::{wake_up, SelectFlags};
use crate::ob::{access, object_as, ObjHandle};
use crate::ps::process::get_process_from_handle;
use crate::ps::thread::{get_thread_from_handle, Thread};
use crate::status::{
    clear_error, get_error, set_error, STATUS_OBJECT_TYPE_MISMATCH, STATUS_PENDING,
    STATUS_PROCESS_IS_TERMINATING, STATUS_THREAD_IS_TERMINATING, STATUS_USER_APC,
};

pub struct SelectRequest {
    /// Opaque cookie echoed in the wake-up record.
    pub cookie: u64,
    pub flags: SelectFlags,
    /// Absolute deadline, or non-positive relative delta.
    pub timeout: Timeout,
    /// Object to signal before waiting (signal-and-wait), or 0.
    pub signal: ObjHandle,
    /// Handle of the APC whose result is being posted, or 0.
    pub prev_apc: ObjHandle,
    /// Result for `prev_apc`.
    pub result: Option<ApcResult>,
    /// Objects to wait on.
    pub handles: Vec<ObjHandle>,
}

#[derive(Default)]
pub struct SelectReply {
    /// Absolute deadline of the installed wait.
    pub timeout: Timeout,
    /// Handle to the APC being delivered, or 0.
    pub apc_handle: ObjHandle,
    /// The delivered call.
    pub call: Option<ApcCall>,
}

fn resolve_prev_apc(current: &Rc<Thread>, handle: ObjHandle) -> Option<Rc<Apc>> {
    let obj = current.process().handle_table().get(handle, 0)?;
    match object_as::<Apc>(obj) {
        Some(apc) => Some(apc),
        None => {
            set_error(STATUS_OBJECT_TYPE_MISMATCH);
            None
        }
    }
}

/// Post the result of an executed APC and wake its joiners.
fn finish_prev_apc(engine: &Engine, current: &Rc<Thread>, apc: &Rc<Apc>, result: ApcResult) {
    let mut result = result;
    match &mut result {
        ApcResult::CreateThread { handle, .. } => {
            // The returned handle names the new thread in the callee
            // process; move it into the original caller's table with the
            // same access. Duplication errors are swallowed.
            if let Some(caller) = apc.caller() {
                if *handle != 0 && !Rc::ptr_eq(caller.process(), current.process()) {
                    let dup = current.process().handle_table().duplicate_to(
                        *handle,
                        caller.process().handle_table(),
                        0,
                        true,
                    );
                    current.process().handle_table().close(*handle);
                    *handle = dup;
                    clear_error();
                }
            }
        }
        ApcResult::AsyncIo { status, total } => {
            if let Some(sink) = apc.owner().and_then(|owner| owner.as_async()) {
                sink.set_result(*status, *total);
            }
        }
        _ => {}
    }
    apc.set_result(result);
    apc.mark_executed();
    wake_up(engine, &**apc, 0);
}

/// The select entrypoint.
pub fn req_select(
    engine: &Engine,
    current: &Rc<Thread>,
    req: &SelectRequest,
    reply: &mut SelectReply,
) {
    if get_error() == STATUS_PENDING {
        clear_error();
    }

    if req.prev_apc != 0 {
        let Some(apc) = resolve_prev_apc(current, req.prev_apc) else {
            return;
        };
        finish_prev_apc(
            engine,
            current,
            &apc,
            req.result.clone().unwrap_or(ApcResult::None),
        );
        current.process().handle_table().close(req.prev_apc);
    }

    reply.timeout = select_on(
        engine,
        current,
        &req.handles,
        req.signal,
        req.flags,
        req.timeout,
        req.cookie,
    );

    if get_error() == STATUS_USER_APC {
        loop {
            let system_only = !req.flags.contains(SelectFlags::ALERTABLE);
            let Some(apc) = thread_dequeue_apc(current, system_only) else {
                break;
            };
            // `None` calls only exist to wake the thread, which has
            // plainly happened; drop them without telling the client.
            if apc.kind() != ApcKind::None {
                let handle = current
                    .process()
                    .handle_table()
                    .alloc(apc.clone(), access::SYNCHRONIZE);
                if handle != 0 {
                    reply.apc_handle = handle;
                    reply.call = Some(apc.call().clone());
                    break;
                }
            }
            apc.mark_executed();
            wake_up(engine, &*apc, 0);
        }
    }
}

pub struct QueueApcRequest {
    /// Thread handle for user-queue kinds, process handle otherwise.
    pub handle: ObjHandle,
    pub call: ApcCall,
}

#[derive(Default)]
pub struct QueueApcReply {
    /// The target is the caller's own process; the caller executes the
    /// call inline instead of queueing it.
    pub is_self: bool,
    /// Handle to wait on / fetch the result with, for cross-process APCs.
    pub handle: ObjHandle,
}

pub fn req_queue_apc(
    engine: &Engine,
    current: &Rc<Thread>,
    req: &QueueApcRequest,
    reply: &mut QueueApcReply,
) {
    let apc = create_apc(None, req.call.clone());
    match apc.kind() {
        ApcKind::None | ApcKind::User | ApcKind::Timer => {
            let Some(thread) =
                get_thread_from_handle(current, req.handle, access::THREAD_SET_CONTEXT)
            else {
                return;
            };
            if !queue_apc(engine, None, Some(&thread), &apc) {
                set_error(STATUS_THREAD_IS_TERMINATING);
            }
        }
        kind => {
            let process_access = match kind {
                ApcKind::CreateThread => access::PROCESS_CREATE_THREAD,
                ApcKind::VirtualQuery => access::PROCESS_QUERY_INFORMATION,
                _ => access::PROCESS_VM_OPERATION,
            };
            let Some(process) = get_process_from_handle(current, req.handle, process_access)
            else {
                return;
            };
            reply.is_self = Rc::ptr_eq(&process, current.process());
            if !reply.is_self {
                let handle = current
                    .process()
                    .handle_table()
                    .alloc(apc.clone(), access::SYNCHRONIZE);
                if handle == 0 {
                    return;
                }
                if queue_apc(engine, Some(&process), None, &apc) {
                    apc.set_caller(current);
                    reply.handle = handle;
                } else {
                    current.process().handle_table().close(handle);
                    set_error(STATUS_PROCESS_IS_TERMINATING);
                }
            }
        }
    }
}

pub struct GetApcResultRequest {
    pub handle: ObjHandle,
}

#[derive(Default)]
pub struct GetApcResultReply {
    pub result: Option<ApcResult>,
}

pub fn req_get_apc_result(
    _engine: &Engine,
    current: &Rc<Thread>,
    req: &GetApcResultRequest,
    reply: &mut GetApcResultReply,
) {
    let Some(obj) = current
        .process()
        .handle_table()
        .get(req.handle, access::SYNCHRONIZE)
    else {
        return;
    };
    let Some(apc) = object_as::<Apc>(obj) else {
        set_error(STATUS_OBJECT_TYPE_MISMATCH);
        return;
    };
    if !apc.is_executed() {
        set_error(STATUS_PENDING);
    } else {
        reply.result = apc.result();
        // Not needed any more.
        current.process().handle_table().close(req.handle);
    }
}
