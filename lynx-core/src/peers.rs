//! Per-lynk swarm membership for the current session. Nothing here is persisted.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::lynk::Peer;

#[derive(Debug, Default)]
pub struct PeerDirectory {
    swarms: Mutex<HashMap<String, Vec<Peer>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Known peers in the order they were learned.
    pub fn peers_of(&self, lynk: &str) -> Vec<Peer> {
        self.lock().get(lynk).cloned().unwrap_or_default()
    }

    /// Set semantics on (ip, port). Returns true if the peer was new.
    pub fn add_if_absent(&self, lynk: &str, peer: Peer) -> bool {
        let mut swarms = self.lock();
        let peers = swarms.entry(lynk.to_string()).or_default();
        if peers.contains(&peer) {
            return false;
        }
        peers.push(peer);
        true
    }

    /// Forget the lynk's peers ahead of a fresh tracker reply.
    pub fn reset(&self, lynk: &str) {
        self.lock().remove(lynk);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Peer>>> {
        // A poisoned map still holds valid peer lists.
        self.swarms.lock().unwrap_or_else(|e| e.into_inner())
    }
}
