//! Peers that have announced themselves during this session.

use std::collections::BTreeSet;

pub struct PeerRegistry {
    self_id: String,
    online: BTreeSet<String>,
}

impl PeerRegistry {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            online: BTreeSet::new(),
        }
    }

    /// Record `peer` as online. Returns true the first time a peer is seen. Self is never added.
    pub fn mark_online(&mut self, peer: &str) -> bool {
        if peer == self.self_id {
            return false;
        }
        self.online.insert(peer.to_string())
    }

    /// Online peers in name order.
    pub fn list_online(&self) -> Vec<String> {
        self.online.iter().cloned().collect()
    }
}
