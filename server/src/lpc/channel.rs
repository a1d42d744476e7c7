//! Client Channels and Kick Signals
//!
//! Every client thread talks to the server over three adopted
//! descriptors: the request channel it writes requests on, the reply
//! channel replies go back on, and the *wake channel* the server pushes
//! asynchronous wake-up records into. Request and reply marshalling live
//! with the dispatcher; the wake-up record format is owned here because
//! the wait engine writes it.
//!
//! The wake-up record is a fixed 12-byte little-endian pair
//! `{cookie: u64, signaled: i32}`; the client matches `cookie` against
//! its outstanding waits.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::OwnedFd;

/// Size of one encoded wake-up record.
pub const WAKEUP_REPLY_SIZE: usize = 12;

/// One wake-up message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeupReply {
    /// Echo of the cookie supplied when the wait was installed.
    pub cookie: u64,
    /// Wait verdict: signalled index (possibly abandoned-offset),
    /// `STATUS_USER_APC`, `STATUS_TIMEOUT`, or the exit code of a killed
    /// thread.
    pub signaled: i32,
}

impl WakeupReply {
    pub fn to_bytes(&self) -> [u8; WAKEUP_REPLY_SIZE] {
        let mut buf = [0u8; WAKEUP_REPLY_SIZE];
        buf[..8].copy_from_slice(&self.cookie.to_le_bytes());
        buf[8..].copy_from_slice(&self.signaled.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; WAKEUP_REPLY_SIZE]) -> Self {
        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&buf[..8]);
        let mut signaled = [0u8; 4];
        signaled.copy_from_slice(&buf[8..]);
        Self {
            cookie: u64::from_le_bytes(cookie),
            signaled: i32::from_le_bytes(signaled),
        }
    }
}

/// Wake-channel transport failure.
#[derive(Debug)]
pub enum ChannelError {
    /// The peer hung up. The affected thread is torn down quietly.
    Closed,
    /// Anything else; treated as a fatal protocol error.
    Io(io::Error),
}

/// Outbound wake transport of one thread.
pub trait WakeChannel {
    fn send(&self, reply: &WakeupReply) -> Result<(), ChannelError>;
}

/// Wake channel over an adopted descriptor.
pub struct FdWakeChannel {
    file: RefCell<File>,
}

impl FdWakeChannel {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: RefCell::new(File::from(fd)),
        }
    }
}

impl WakeChannel for FdWakeChannel {
    fn send(&self, reply: &WakeupReply) -> Result<(), ChannelError> {
        match self.file.borrow_mut().write_all(&reply.to_bytes()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Err(ChannelError::Closed),
            Err(err) => Err(ChannelError::Io(err)),
        }
    }
}

/// Builds wake channels around descriptors adopted at `init_thread`.
pub trait TransportFactory {
    fn wake_channel(&self, fd: OwnedFd) -> Box<dyn WakeChannel>;
}

/// Default factory: plain descriptor writes.
pub struct FdTransportFactory;

impl TransportFactory for FdTransportFactory {
    fn wake_channel(&self, fd: OwnedFd) -> Box<dyn WakeChannel> {
        Box::new(FdWakeChannel::new(fd))
    }
}

/// The per-thread OS wake-up primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickSignal {
    /// Pull the client thread into the server (system-APC delivery,
    /// suspension). SIGUSR1 on a signal-capable host.
    Kick,
    /// Violent termination. SIGQUIT on a signal-capable host.
    Quit,
}

/// Delivers kick signals to client OS threads.
///
/// A host without per-thread signals substitutes another per-thread wake
/// primitive (eventfd, pipe token). Returning false means the OS thread
/// is unreachable, typically because it already died.
pub trait ThreadKicker {
    fn send_thread_signal(&self, unix_pid: i32, unix_tid: i32, signal: KickSignal) -> bool;
}

/// Kicker for hosts with no way to reach client threads.
pub struct NullKicker;

impl ThreadKicker for NullKicker {
    fn send_thread_signal(&self, _unix_pid: i32, _unix_tid: i32, _signal: KickSignal) -> bool {
        false
    }
}
