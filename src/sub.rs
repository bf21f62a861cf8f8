//! Per-peer notification subscription state. Entries are created lazily on
//! the first CCC descriptor write or connection event and removed when the
//! peer disconnects; they are scoped to the connection, not the service.

use std::collections::HashMap;
use std::hash::Hash;

use crate::{Cccd, Characteristic};

#[derive(Clone, Debug, Default)]
struct Entry {
    cccd: Cccd,
    /// Last value actually sent to this peer, used for change detection.
    last: Option<Vec<u8>>,
}

/// Notification subscription registry, owned by one service instance.
#[derive(Debug)]
pub(crate) struct SubscriptionRegistry<P> {
    peers: HashMap<P, HashMap<Characteristic, Entry>>,
}

impl<P: Clone + Eq + Hash> SubscriptionRegistry<P> {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Creates an empty entry set for a newly connected peer.
    #[inline]
    pub fn connect(&mut self, peer: P) {
        self.peers.entry(peer).or_default();
    }

    /// Drops all state for a disconnected peer.
    #[inline]
    pub fn disconnect(&mut self, peer: &P) {
        self.peers.remove(peer);
    }

    /// Drops all peers (service teardown).
    #[inline]
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Returns the peer's CCC descriptor value for a characteristic.
    #[inline]
    #[must_use]
    pub fn cccd(&self, peer: &P, chr: Characteristic) -> Cccd {
        (self.peers.get(peer))
            .and_then(|m| m.get(&chr))
            .map_or(Cccd::empty(), |e| e.cccd)
    }

    /// Stores the peer's CCC descriptor value for a characteristic.
    pub fn set_cccd(&mut self, peer: &P, chr: Characteristic, cccd: Cccd) {
        let e = (self.peers.entry(peer.clone()).or_default())
            .entry(chr)
            .or_default();
        e.cccd = cccd;
    }

    /// Returns whether the peer currently subscribes to notifications for a
    /// characteristic.
    #[inline]
    #[must_use]
    pub fn subscribed(&self, peer: &P, chr: Characteristic) -> bool {
        self.cccd(peer, chr).contains(Cccd::NOTIFY)
    }

    /// Records `val` as pending for notification to the peer. Returns `true`
    /// if the peer subscribes to the characteristic and the value differs
    /// from the last one sent, in which case `val` becomes the new
    /// last-notified value. Dedup is per `(peer, characteristic)`.
    #[must_use]
    pub fn note(&mut self, peer: &P, chr: Characteristic, val: &[u8]) -> bool {
        let Some(e) = self.peers.get_mut(peer).and_then(|m| m.get_mut(&chr)) else {
            return false;
        };
        if !e.cccd.contains(Cccd::NOTIFY) {
            return false;
        }
        if e.last.as_deref() == Some(val) {
            return false;
        }
        e.last = Some(val.to_vec());
        true
    }
}
