//! In-Flight Descriptor Cache
//!
//! Descriptors travel from clients ahead of the request that names them;
//! each arrives numbered in the *client's* descriptor namespace alongside
//! the locally materialized server descriptor. The per-thread cache
//! reconciles the two: requests quote the client number and the server
//! redeems it for the owned local descriptor.
//!
//! The table is a fixed [`MAX_INFLIGHT_FDS`]-slot array. A client that
//! floods descriptors without redeeming them gets add failures once the
//! table is full; the server-side descriptor is closed on the spot.

use std::os::fd::{BorrowedFd, OwnedFd};

/// Slots per thread.
pub const MAX_INFLIGHT_FDS: usize = 16;

/// Miss behavior of [`InflightCache::take`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflightLookup {
    /// A miss is a miss. Correct when client and server have separate
    /// descriptor tables (the normal deployment).
    Strict,
    /// On a miss, duplicate the client-numbered descriptor locally and
    /// hand that out. Only sound when the client shares the server's
    /// descriptor table.
    DupLocal,
}

struct Slot {
    client: i32,
    server: OwnedFd,
}

/// Bounded map of client descriptor number -> owned server descriptor.
pub struct InflightCache {
    slots: [Option<Slot>; MAX_INFLIGHT_FDS],
}

impl InflightCache {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Store a (client, server) pair.
    ///
    /// An existing entry for the same client number is replaced, closing
    /// the old server descriptor. Returns the slot index used; a full
    /// table drops the server descriptor and reports failure.
    pub fn add(&mut self, client: i32, server: OwnedFd) -> Option<usize> {
        if client == -1 {
            return None;
        }
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(existing) = slot {
                if existing.client == client {
                    existing.server = server;
                    return Some(i);
                }
            }
        }
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Slot { client, server });
                return Some(i);
            }
        }
        None
    }

    /// Redeem a client descriptor number for the owned server descriptor.
    ///
    /// The entry is consumed. On a miss the [`InflightLookup::DupLocal`]
    /// strategy synthesizes a descriptor by duplicating the client number
    /// in the local table.
    pub fn take(&mut self, client: i32, lookup: InflightLookup) -> Option<OwnedFd> {
        if client == -1 {
            return None;
        }
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.client == client) {
                return slot.take().map(|s| s.server);
            }
        }
        match lookup {
            InflightLookup::Strict => None,
            InflightLookup::DupLocal => {
                // Safety: only reached when the host declared a shared
                // descriptor table, in which case `client` names a live
                // descriptor in this process for the duration of the call.
                let borrowed = unsafe { BorrowedFd::borrow_raw(client) };
                borrowed.try_clone_to_owned().ok()
            }
        }
    }

    /// Drop every cached descriptor.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InflightCache {
    fn default() -> Self {
        Self::new()
    }
}
