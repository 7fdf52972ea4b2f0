//! Peer registry owned by the file server.
//!
//! One mutex guards the whole map. Critical sections never touch the network: broadcasters
//! take a [`PeerRegistry::snapshot`] and write outside the lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::peer::Peer;
use crate::transport::PeerHandler;

/// A `StoreAnnounce` waiting for its stream body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub key: String,
    pub size: u64,
}

struct Entry {
    peer: Arc<Peer>,
    announce: Option<Announce>,
}

#[derive(Clone, Default)]
pub struct PeerRegistry {
    entries: Arc<Mutex<HashMap<SocketAddr, Entry>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, peer: Arc<Peer>) -> Result<(), RegistryError> {
        let mut entries = self.lock();
        let addr = peer.addr();
        if entries.contains_key(&addr) {
            return Err(RegistryError::Duplicate(addr));
        }
        entries.insert(
            addr,
            Entry {
                peer,
                announce: None,
            },
        );
        Ok(())
    }

    /// Unregister; also drops any announce still waiting for its stream.
    pub fn remove(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        self.lock().remove(addr).map(|e| e.peer)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        self.lock().get(addr).map(|e| e.peer.clone())
    }

    /// All peers, ordered by address.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self.lock().values().map(|e| e.peer.clone()).collect();
        peers.sort_by_key(|p| p.addr());
        peers
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self.lock().keys().copied().collect();
        addrs.sort();
        addrs
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Record that the next stream from `addr` is the body for `announce`.
    /// At most one announce may be pending per peer.
    pub fn expect_stream(&self, addr: &SocketAddr, announce: Announce) -> Result<(), RegistryError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(addr)
            .ok_or(RegistryError::UnknownPeer(*addr))?;
        if let Some(pending) = &entry.announce {
            return Err(RegistryError::StreamPending {
                addr: *addr,
                key: pending.key.clone(),
            });
        }
        entry.announce = Some(announce);
        Ok(())
    }

    pub fn take_announce(&self, addr: &SocketAddr) -> Option<Announce> {
        self.lock().get_mut(addr).and_then(|e| e.announce.take())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PeerHandler for PeerRegistry {
    fn on_peer(&self, peer: Arc<Peer>) -> Result<(), RegistryError> {
        let addr = peer.addr();
        let outbound = peer.outbound();
        self.add(peer)?;
        tracing::info!(peer = %addr, outbound, "peer connected");
        Ok(())
    }

    fn on_peer_closed(&self, addr: SocketAddr) {
        if self.remove(&addr).is_some() {
            tracing::info!(peer = %addr, "peer disconnected");
        }
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.addrs())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("peer {0} already registered")]
    Duplicate(SocketAddr),
    #[error("peer {0} not registered")]
    UnknownPeer(SocketAddr),
    #[error("peer {addr} already has a pending stream for {key}")]
    StreamPending { addr: SocketAddr, key: String },
}
