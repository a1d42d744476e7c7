//! Client Transport (lpc)
//!
//! Per-thread duplex channels between clients and the server, the
//! wake-up record codec, and the kick-signal abstraction used to pull a
//! client thread into the server from outside a request.

pub mod channel;

pub use channel::{
    ChannelError, FdTransportFactory, FdWakeChannel, KickSignal, NullKicker, ThreadKicker,
    TransportFactory, WakeChannel, WakeupReply, WAKEUP_REPLY_SIZE,
};
