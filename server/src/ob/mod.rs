//! Object Manager (ob)
//!
//! The polymorphic object model shared by every waitable or
//! handle-addressable entity in the server:
//!
//! - **Object trait**: the virtual operation set (dump, signaled,
//!   satisfied, add_queue/remove_queue, signal, destroy-on-last-drop)
//! - **Object header**: embedded wait-queue head and security slot
//! - **Handle table**: per-process handle -> (object, access) mapping

pub mod handle;
pub mod object;

pub use handle::{access, HandleTable, ObjHandle, MAX_HANDLES};
pub use object::{object_as, same_object, AsyncResult, Object, ObjectHeader, WaitQueueEntry};
