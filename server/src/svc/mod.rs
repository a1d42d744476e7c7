//! Request Entrypoints (svc)
//!
//! One handler per protocol request, operating on typed request and reply
//! records. Wire marshalling, request framing and opcode dispatch belong
//! to the request dispatcher; handlers communicate failure through the
//! dispatch error slot.

pub mod select;
pub mod thread;

/// Version negotiated at `init_thread`; a mismatch is the client's
/// problem to report.
pub const SERVER_PROTOCOL_VERSION: u32 = 189;

pub use select::{
    req_get_apc_result, req_queue_apc, req_select, GetApcResultReply, GetApcResultRequest,
    QueueApcReply, QueueApcRequest, SelectReply, SelectRequest,
};
pub use thread::{
    req_get_selector_entry, req_get_suspend_context, req_get_thread_context, req_get_thread_info,
    req_init_thread, req_new_thread, req_open_thread, req_resume_thread, req_set_suspend_context,
    req_set_thread_context, req_set_thread_info, req_suspend_thread, req_terminate_thread,
    GetSelectorEntryReply, GetSelectorEntryRequest, GetSuspendContextReply,
    GetThreadContextReply, GetThreadContextRequest, GetThreadInfoReply, GetThreadInfoRequest,
    InitThreadReply, InitThreadRequest, NewThreadReply, NewThreadRequest, OpenThreadReply,
    OpenThreadRequest, SetSuspendContextRequest, SetThreadContextRequest, SetThreadInfoMask,
    SetThreadInfoRequest, SuspendThreadReply, SuspendThreadRequest, TerminateThreadReply,
    TerminateThreadRequest,
};
