//! Peer directory: who else is on the LAN session.
//!
//! Records are keyed by the datagram source address. Liveness is purely
//! timestamp based: any message refreshes `last_seen`, and a periodic sweep
//! marks silent peers as left.
//!
//! ```text
//!   INVITE ──► Announced ──INVITE_ACCEPT / PEER_ANNOUNCE──► Active
//!                                                            │  ▲
//!                               PEER_LEAVE / sweep timeout   │  │ any message
//!                                                            ▼  │
//!                                                            Left
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Lifecycle of a peer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Seen advertising a session; not collaborating with us.
    Announced,
    Active,
    /// Departed or timed out. Kept so re-announces update in place.
    Left,
}

/// One known peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Source address of its datagrams.
    pub address: SocketAddr,
    pub display_name: String,
    pub last_seen: Instant,
    pub state: PeerState,
}

/// Liveness tracking for every peer heard from.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<SocketAddr, PeerRecord>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert `address` as an active collaborator. Returns whether the
    /// visible peer list changed.
    pub fn observe(&mut self, address: SocketAddr, display_name: &str, now: Instant) -> bool {
        match self.peers.get_mut(&address) {
            Some(record) => {
                let changed = record.state != PeerState::Active || record.display_name != display_name;
                record.state = PeerState::Active;
                record.display_name = display_name.to_string();
                record.last_seen = now;
                changed
            }
            None => {
                self.peers.insert(
                    address,
                    PeerRecord {
                        address,
                        display_name: display_name.to_string(),
                        last_seen: now,
                        state: PeerState::Active,
                    },
                );
                true
            }
        }
    }

    /// Record a session advertiser without activating it. Known records only
    /// get their timestamp and name refreshed.
    pub fn announce(&mut self, address: SocketAddr, display_name: &str, now: Instant) -> bool {
        match self.peers.get_mut(&address) {
            Some(record) => {
                let changed = record.display_name != display_name;
                record.display_name = display_name.to_string();
                record.last_seen = now;
                changed
            }
            None => {
                self.peers.insert(
                    address,
                    PeerRecord {
                        address,
                        display_name: display_name.to_string(),
                        last_seen: now,
                        state: PeerState::Announced,
                    },
                );
                true
            }
        }
    }

    /// Refresh a known record. A `Left` record comes back as `Active`.
    pub fn touch(&mut self, address: SocketAddr, now: Instant) -> bool {
        let Some(record) = self.peers.get_mut(&address) else {
            return false;
        };
        record.last_seen = now;
        if record.state == PeerState::Left {
            record.state = PeerState::Active;
            return true;
        }
        false
    }

    /// Mark a peer as departed.
    pub fn mark_left(&mut self, address: SocketAddr) -> bool {
        match self.peers.get_mut(&address) {
            Some(record) if record.state != PeerState::Left => {
                record.state = PeerState::Left;
                true
            }
            _ => false,
        }
    }

    /// Expire active peers silent for longer than `timeout`.
    pub fn sweep_expired(&mut self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
        let mut expired: Vec<SocketAddr> = self
            .peers
            .values_mut()
            .filter(|r| r.state == PeerState::Active)
            .filter(|r| now.saturating_duration_since(r.last_seen) > timeout)
            .map(|r| {
                r.state = PeerState::Left;
                r.address
            })
            .collect();
        expired.sort();
        expired
    }

    /// Addresses of active peers, sorted.
    pub fn active_peers(&self) -> Vec<SocketAddr> {
        let mut active: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|r| r.state == PeerState::Active)
            .map(|r| r.address)
            .collect();
        active.sort();
        active
    }

    /// All records, sorted by address.
    pub fn peers(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self.peers.values().cloned().collect();
        records.sort_by_key(|r| r.address);
        records
    }

    pub fn get(&self, address: &SocketAddr) -> Option<&PeerRecord> {
        self.peers.get(address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Forget everything (used when returning to solo mode).
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
