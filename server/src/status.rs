//! Status Codes and the Dispatch Error Slot
//!
//! Request handlers never return a `Result`; they post failures to a
//! dispatch-local error slot that the request dispatcher inspects after the
//! handler runs. A non-success value marks the reply failed. This mirrors
//! the NT convention of an NTSTATUS travelling out-of-band with the reply.
//!
//! # Conventions
//!
//! - Validation failures are posted before any state is mutated.
//! - `STATUS_PENDING` and `STATUS_USER_APC` are deferred-result signals,
//!   not hard errors: the reply is still delivered and the client is
//!   expected to come back.
//! - Wait verdicts reuse the low status range: a signalled index is
//!   reported as `index`, an abandoned grant as
//!   `STATUS_ABANDONED_WAIT_0 + index`.

use core::cell::Cell;
use core::fmt;

/// NT-style status code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NtStatus(pub u32);

impl NtStatus {
    /// Raw numeric code.
    #[inline]
    pub const fn code(self) -> u32 {
        self.0
    }

    /// True for error-severity codes (top two bits set).
    #[inline]
    pub const fn is_error(self) -> bool {
        self.0 & 0xC000_0000 == 0xC000_0000
    }

    /// Symbolic name when the code is one of the well-known constants.
    pub const fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0x0000_0000 => "STATUS_SUCCESS",
            0x0000_0080 => "STATUS_ABANDONED_WAIT_0",
            0x0000_00C0 => "STATUS_USER_APC",
            0x0000_0102 => "STATUS_TIMEOUT",
            0x0000_0103 => "STATUS_PENDING",
            0xC000_0001 => "STATUS_UNSUCCESSFUL",
            0xC000_0002 => "STATUS_NOT_IMPLEMENTED",
            0xC000_0008 => "STATUS_INVALID_HANDLE",
            0xC000_000B => "STATUS_INVALID_CID",
            0xC000_000D => "STATUS_INVALID_PARAMETER",
            0xC000_0017 => "STATUS_NO_MEMORY",
            0xC000_0022 => "STATUS_ACCESS_DENIED",
            0xC000_0024 => "STATUS_OBJECT_TYPE_MISMATCH",
            0xC000_0046 => "STATUS_MUTANT_NOT_OWNED",
            0xC000_0047 => "STATUS_SEMAPHORE_LIMIT_EXCEEDED",
            0xC000_004A => "STATUS_SUSPEND_COUNT_EXCEEDED",
            0xC000_004B => "STATUS_THREAD_IS_TERMINATING",
            0xC000_00BB => "STATUS_NOT_SUPPORTED",
            0xC000_010A => "STATUS_PROCESS_IS_TERMINATING",
            0xC000_011F => "STATUS_TOO_MANY_OPENED_FILES",
            0xC000_015C => "STATUS_NOT_REGISTRY_FILE",
            _ => return None,
        })
    }
}

impl fmt::Debug for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "NtStatus({:#010x})", self.0),
        }
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub const STATUS_SUCCESS: NtStatus = NtStatus(0x0000_0000);
/// Base of the signalled-index range reported from a wait.
pub const STATUS_WAIT_0: NtStatus = NtStatus(0x0000_0000);
/// Base of the abandoned-index range reported from a wait.
pub const STATUS_ABANDONED_WAIT_0: NtStatus = NtStatus(0x0000_0080);
pub const STATUS_USER_APC: NtStatus = NtStatus(0x0000_00C0);
pub const STATUS_TIMEOUT: NtStatus = NtStatus(0x0000_0102);
pub const STATUS_PENDING: NtStatus = NtStatus(0x0000_0103);
pub const STATUS_UNSUCCESSFUL: NtStatus = NtStatus(0xC000_0001);
pub const STATUS_NOT_IMPLEMENTED: NtStatus = NtStatus(0xC000_0002);
pub const STATUS_INVALID_HANDLE: NtStatus = NtStatus(0xC000_0008);
pub const STATUS_INVALID_CID: NtStatus = NtStatus(0xC000_000B);
pub const STATUS_INVALID_PARAMETER: NtStatus = NtStatus(0xC000_000D);
pub const STATUS_NO_MEMORY: NtStatus = NtStatus(0xC000_0017);
pub const STATUS_ACCESS_DENIED: NtStatus = NtStatus(0xC000_0022);
pub const STATUS_OBJECT_TYPE_MISMATCH: NtStatus = NtStatus(0xC000_0024);
pub const STATUS_MUTANT_NOT_OWNED: NtStatus = NtStatus(0xC000_0046);
pub const STATUS_SEMAPHORE_LIMIT_EXCEEDED: NtStatus = NtStatus(0xC000_0047);
pub const STATUS_SUSPEND_COUNT_EXCEEDED: NtStatus = NtStatus(0xC000_004A);
pub const STATUS_THREAD_IS_TERMINATING: NtStatus = NtStatus(0xC000_004B);
pub const STATUS_NOT_SUPPORTED: NtStatus = NtStatus(0xC000_00BB);
pub const STATUS_PROCESS_IS_TERMINATING: NtStatus = NtStatus(0xC000_010A);
pub const STATUS_TOO_MANY_OPENED_FILES: NtStatus = NtStatus(0xC000_011F);
pub const STATUS_NOT_REGISTRY_FILE: NtStatus = NtStatus(0xC000_015C);

thread_local! {
    static DISPATCH_ERROR: Cell<NtStatus> = const { Cell::new(STATUS_SUCCESS) };
}

/// Post a status to the dispatch error slot.
#[inline]
pub fn set_error(status: NtStatus) {
    DISPATCH_ERROR.with(|slot| slot.set(status));
}

/// Read the dispatch error slot.
#[inline]
pub fn get_error() -> NtStatus {
    DISPATCH_ERROR.with(|slot| slot.get())
}

/// Reset the dispatch error slot to success.
#[inline]
pub fn clear_error() {
    set_error(STATUS_SUCCESS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_slot_roundtrip() {
        clear_error();
        assert_eq!(get_error(), STATUS_SUCCESS);

        set_error(STATUS_INVALID_HANDLE);
        assert_eq!(get_error(), STATUS_INVALID_HANDLE);

        clear_error();
        assert_eq!(get_error(), STATUS_SUCCESS);
    }

    #[test]
    fn test_severity() {
        assert!(STATUS_ACCESS_DENIED.is_error());
        assert!(!STATUS_PENDING.is_error());
        assert!(!STATUS_USER_APC.is_error());
    }

    #[test]
    fn test_names() {
        assert_eq!(STATUS_TIMEOUT.name(), Some("STATUS_TIMEOUT"));
        assert_eq!(NtStatus(0xDEAD_BEEF).name(), None);
        assert_eq!(format!("{:?}", STATUS_INVALID_CID), "STATUS_INVALID_CID");
    }
}
