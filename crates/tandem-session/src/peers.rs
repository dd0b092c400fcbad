//! Connected collaborators

use std::fmt;

/// Liveness of a peer as seen from this side
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    /// Heard from within the last ping window
    Online,
    /// No traffic for two ping intervals
    Unresponsive,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Online => write!(f, "online"),
            PeerStatus::Unresponsive => write!(f, "unresponsive"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    pub username: String,
    pub status: PeerStatus,
}

/// Insertion-ordered peers, unique by id
#[derive(Clone, Debug, Default)]
pub struct PeerList {
    peers: Vec<Peer>,
}

impl PeerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. A repeated greeting refreshes the username and keeps the
    /// original position. Returns true if the peer is new.
    pub fn add(&mut self, id: &str, username: &str) -> bool {
        if let Some(peer) = self.peers.iter_mut().find(|p| p.id == id) {
            peer.username = username.to_string();
            peer.status = PeerStatus::Online;
            return false;
        }
        self.peers.push(Peer {
            id: id.to_string(),
            username: username.to_string(),
            status: PeerStatus::Online,
        });
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Peer> {
        let pos = self.peers.iter().position(|p| p.id == id)?;
        Some(self.peers.remove(pos))
    }

    pub fn set_status(&mut self, status: PeerStatus) {
        for peer in &mut self.peers {
            peer.status = status;
        }
    }

    pub fn get(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
