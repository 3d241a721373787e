use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use cairn_types::ObjectId;

use crate::connection::Connection;

/// Where a given identifier lives.
#[derive(Clone, Debug)]
pub enum Owner {
    Local,
    Peer(Arc<Connection>),
}

/// Known peer connections keyed by node identifier.
///
/// Identifiers form a ring: the owner of an id is the node with the greatest
/// identifier not above it, wrapping around to the greatest identifier
/// overall.
#[derive(Default)]
pub struct Registry {
    peers: RwLock<BTreeMap<ObjectId, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer connection. Returns false if the peer is already
    /// known.
    pub fn insert(&self, conn: Arc<Connection>) -> bool {
        let mut peers = self.peers.write().expect("registry lock poisoned");
        if peers.contains_key(&conn.peer()) {
            return false;
        }
        info!(peer = %conn.peer(), addr = %conn.addr(), "peer registered");
        peers.insert(conn.peer(), conn);
        true
    }

    /// Drop `conn` if it is the registered connection for its peer.
    pub fn remove(&self, conn: &Arc<Connection>) {
        let mut peers = self.peers.write().expect("registry lock poisoned");
        if peers.get(&conn.peer()).is_some_and(|c| Arc::ptr_eq(c, conn)) {
            peers.remove(&conn.peer());
            debug!(peer = %conn.peer(), "peer removed");
        }
    }

    pub fn get(&self, peer: &ObjectId) -> Option<Arc<Connection>> {
        self.peers.read().expect("registry lock poisoned").get(peer).cloned()
    }

    pub fn contains(&self, peer: &ObjectId) -> bool {
        self.peers.read().expect("registry lock poisoned").contains_key(peer)
    }

    /// Peer that owns `target` when only peers are considered.
    pub fn closest(&self, target: &ObjectId) -> Option<Arc<Connection>> {
        let peers = self.peers.read().expect("registry lock poisoned");
        peers
            .range(..=*target)
            .next_back()
            .or_else(|| peers.iter().next_back())
            .map(|(_, conn)| Arc::clone(conn))
    }

    /// Owner of `target` among the peers and the local node `local`.
    pub fn route(&self, local: &ObjectId, target: &ObjectId) -> Owner {
        let peers = self.peers.read().expect("registry lock poisoned");
        let below = peers.range(..=*target).next_back();
        let peer = match below {
            Some((id, conn)) if local > target || id > local => Some(conn),
            Some(_) => None,
            None if local <= target => None,
            None => peers.iter().next_back().filter(|(id, _)| *id > local).map(|(_, c)| c),
        };
        match peer {
            Some(conn) => Owner::Peer(Arc::clone(conn)),
            None => Owner::Local,
        }
    }

    /// Snapshot of known peers.
    pub fn peers(&self) -> Vec<(ObjectId, SocketAddr)> {
        self.peers
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(|c| (c.peer(), c.addr()))
            .collect()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.peers.read().expect("registry lock poisoned").values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
