//! A peer: a set of replicas plus a stable identity for sync handshakes.

use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::keys::base32;
use crate::replica::Replica;
use crate::share::ShareAddress;
use crate::sync::SessionStatus;

/// Stable identifier a peer presents during the sync handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Generate a random peer id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        PeerId(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// A shortened form for logging.
    pub fn fmt_short(&self) -> String {
        base32::fmt_short(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.fmt_short())
    }
}

impl FromStr for PeerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PeerId(base32::parse_array(s)?))
    }
}

#[derive(Debug)]
struct PeerInner {
    peer_id: PeerId,
    replicas: RwLock<BTreeMap<ShareAddress, Replica>>,
    /// Signalled whenever the replica set changes, so attached sync
    /// coordinators re-negotiate common shares.
    shares_changed: Notify,
    next_connection_id: AtomicU64,
    sync_statuses:
        RwLock<BTreeMap<u64, tokio::sync::watch::Receiver<BTreeMap<ShareAddress, SessionStatus>>>>,
}

/// A set of replicas keyed by share address. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Default for Peer {
    fn default() -> Self {
        Self::new()
    }
}

impl Peer {
    /// Create an empty peer with a random id.
    pub fn new() -> Self {
        Peer {
            inner: Arc::new(PeerInner {
                peer_id: PeerId::random(),
                replicas: RwLock::new(BTreeMap::new()),
                shares_changed: Notify::new(),
                next_connection_id: AtomicU64::new(0),
                sync_statuses: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// The identity used during sync handshakes.
    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// Add a replica, keyed by its share address. Replaces any replica
    /// already held for the share and notifies attached syncers.
    pub fn add_replica(&self, replica: Replica) -> Option<Replica> {
        let prev = self
            .inner
            .replicas
            .write()
            .insert(replica.share().clone(), replica);
        self.inner.shares_changed.notify_waiters();
        prev
    }

    /// Remove the replica for a share, notifying attached syncers.
    pub fn remove_replica(&self, share: &ShareAddress) -> Option<Replica> {
        let removed = self.inner.replicas.write().remove(share);
        if removed.is_some() {
            self.inner.shares_changed.notify_waiters();
        }
        removed
    }

    /// The replica for a share, if held.
    pub fn replica(&self, share: &ShareAddress) -> Option<Replica> {
        self.inner.replicas.read().get(share).cloned()
    }

    /// Whether this peer holds the share.
    pub fn has_share(&self, share: &ShareAddress) -> bool {
        self.inner.replicas.read().contains_key(share)
    }

    /// All held share addresses, ascending.
    pub fn shares(&self) -> Vec<ShareAddress> {
        self.inner.replicas.read().keys().cloned().collect()
    }

    /// Wait until the replica set changes.
    pub async fn shares_changed(&self) {
        self.inner.shares_changed.notified().await;
    }

    pub(crate) fn register_syncer(
        &self,
        status: tokio::sync::watch::Receiver<BTreeMap<ShareAddress, SessionStatus>>,
    ) -> u64 {
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        self.inner.sync_statuses.write().insert(id, status);
        id
    }

    pub(crate) fn unregister_syncer(&self, id: u64) {
        self.inner.sync_statuses.write().remove(&id);
    }

    /// Snapshot of sync status per attached connection.
    pub fn sync_statuses(&self) -> BTreeMap<u64, BTreeMap<ShareAddress, SessionStatus>> {
        self.inner
            .sync_statuses
            .read()
            .iter()
            .map(|(id, rx)| (*id, rx.borrow().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryDriver;

    fn replica(addr: &str) -> Replica {
        Replica::new(
            ShareAddress::new(addr).unwrap(),
            Box::new(MemoryDriver::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_replica_registry() {
        let peer = Peer::new();
        assert!(peer.shares().is_empty());

        peer.add_replica(replica("+books.aaaaaa"));
        peer.add_replica(replica("+games.bbbbbb"));
        assert_eq!(peer.shares().len(), 2);

        let share = ShareAddress::new("+books.aaaaaa").unwrap();
        assert!(peer.has_share(&share));
        assert!(peer.replica(&share).is_some());

        peer.remove_replica(&share).unwrap();
        assert!(!peer.has_share(&share));
    }

    #[test]
    fn test_peer_ids_are_distinct() {
        assert_ne!(Peer::new().peer_id(), Peer::new().peer_id());
    }

    #[tokio::test]
    async fn test_shares_changed_notification() {
        let peer = Peer::new();
        let waiter = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.shares_changed().await })
        };
        tokio::task::yield_now().await;
        peer.add_replica(replica("+books.aaaaaa"));
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("notified")
            .unwrap();
    }
}
