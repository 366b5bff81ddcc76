//! Session protocol engine.
//!
//! A synchronous state machine. It owns the replica, the peer directory and
//! the reassembly buffers, and turns inputs (datagrams, local edits, timer
//! ticks) into [`Outbound`] datagrams. It never touches a socket; the
//! transport sends whatever it returns.
//!
//! ```text
//!            share                    INVITE_ACCEPT
//!   Solo ───────────► Hosting ─────────────────────────┐
//!    │  ▲                                             ▼
//!    │  │ disconnect                           Collaborating ◄─┐
//!    │  └─────────────────────────────────────────────┤        │ CRDT_* / STATE_CHECK
//!    │                                                └────────┘ REQUEST_SNAPSHOT
//!    │ INVITE (accepted)                                 ▲
//!    └───────────► Joining ──── SNAPSHOT reassembled ────┘
//! ```
//!
//! Divergence is caught by periodic `STATE_CHECK` broadcasts carrying the
//! replica fingerprint. A mismatch pulls the peer's snapshot and merges it.
//!
//! Reference: Kleppmann, DDIA, Chapter 5 (Anti-Entropy)

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use lanpad_core::{ClientId, Fingerprint, Operation, RgaStore, Snapshot};

use crate::codec::{self, Reassembler};
use crate::collaborator::{
    Collaborator, ConflictResolution, HostInfo, JoinDecision, SessionStatus,
};
use crate::config::SessionConfig;
use crate::error::CollabError;
use crate::peers::PeerDirectory;
use crate::protocol::{Envelope, WireMessage};

/// Where the engine is in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Solo,
    Hosting,
    Joining,
    Collaborating,
}

impl SessionState {
    /// Whether edits are exchanged with peers in this state.
    pub fn is_shared(self) -> bool {
        matches!(self, SessionState::Hosting | SessionState::Collaborating)
    }
}

/// Destination of an outbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Broadcast,
    Peer(SocketAddr),
}

/// A datagram the transport should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub target: Target,
    pub envelope: Envelope,
}

/// Fingerprint and node count, as carried by `STATE_CHECK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StateDigest {
    hash: Fingerprint,
    count: u64,
}

#[derive(Debug, Clone, Copy)]
struct RepairRequest {
    peer: SocketAddr,
    requested_at: Instant,
}

/// The per-process session state machine.
pub struct SessionEngine {
    config: SessionConfig,
    /// Address advertised in INVITE / PEER_ANNOUNCE / REQUEST_SNAPSHOT.
    local_addr: SocketAddr,
    store: RgaStore,
    peers: PeerDirectory,
    reassembler: Reassembler,
    state: SessionState,
    collaborator: Box<dyn Collaborator>,
    /// Host being joined; only set while `Joining`.
    host: Option<HostInfo>,
    /// Remote operations that arrived before the join snapshot.
    join_buffer: Vec<Operation>,
    /// Outstanding desync repair.
    repair: Option<RepairRequest>,
    /// Hosts whose invitation was turned down; not asked again until reset.
    declined: HashSet<SocketAddr>,
}

impl SessionEngine {
    pub fn new(
        config: SessionConfig,
        local_addr: SocketAddr,
        collaborator: Box<dyn Collaborator>,
    ) -> Self {
        let store = RgaStore::new().with_pending_limit(config.pending_op_limit);
        Self {
            config,
            local_addr,
            store,
            peers: PeerDirectory::new(),
            reassembler: Reassembler::new(),
            state: SessionState::Solo,
            collaborator,
            host: None,
            join_buffer: Vec::new(),
            repair: None,
            declined: HashSet::new(),
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_id(&self) -> ClientId {
        self.store.client()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current visible text.
    pub fn text(&self) -> String {
        self.store.materialize()
    }

    pub fn store(&self) -> &RgaStore {
        &self.store
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.store.fingerprint()
    }

    /// Operations held back until the join snapshot arrives.
    pub fn buffered_len(&self) -> usize {
        self.join_buffer.len()
    }

    /// Whether a desync repair is waiting for its snapshot.
    pub fn is_repairing(&self) -> bool {
        self.repair.is_some()
    }

    // ─── User actions ───────────────────────────────────────────────

    /// Start hosting the current document.
    pub fn share(&mut self) -> Result<Vec<Outbound>, CollabError> {
        if self.state != SessionState::Solo {
            return Err(CollabError::InvalidState(self.state));
        }
        log::info!(
            "Sharing document as '{}' from {}",
            self.config.display_name,
            self.local_addr
        );
        self.set_state(SessionState::Hosting);
        Ok(vec![self.invite()])
    }

    /// Leave the session and return to solo editing. The text is kept.
    pub fn disconnect(&mut self) -> Vec<Outbound> {
        if self.state == SessionState::Solo {
            return Vec::new();
        }
        log::info!("Leaving session ({:?})", self.state);
        let leave = self.broadcast(WireMessage::PeerLeave {
            addr: self.local_addr,
        });
        self.reset_to_solo();
        vec![leave]
    }

    /// Insert `ch` at visible position `index`.
    pub fn local_insert_at(&mut self, index: usize, ch: char) -> Result<Vec<Outbound>, CollabError> {
        self.ensure_editable()?;
        let op = self.store.insert_at(index, ch)?;
        Ok(self.publish(vec![op]))
    }

    /// Delete the character at visible position `index`.
    pub fn local_delete_at(&mut self, index: usize) -> Result<Vec<Outbound>, CollabError> {
        self.ensure_editable()?;
        let op = self.store.delete_at(index)?;
        Ok(self.publish(vec![op]))
    }

    /// Replace the whole visible text, emitting the minimal prefix/suffix diff.
    pub fn replace_text(&mut self, text: &str) -> Result<Vec<Outbound>, CollabError> {
        self.ensure_editable()?;
        let ops = self.store.replace_text(text)?;
        Ok(self.publish(ops))
    }

    fn ensure_editable(&self) -> Result<(), CollabError> {
        match self.state {
            SessionState::Joining => Err(CollabError::InvalidState(self.state)),
            _ => Ok(()),
        }
    }

    fn publish(&self, ops: Vec<Operation>) -> Vec<Outbound> {
        if !self.state.is_shared() {
            return Vec::new();
        }
        ops.into_iter()
            .map(|op| self.broadcast(WireMessage::from(op)))
            .collect()
    }

    // ─── Inbound ────────────────────────────────────────────────────

    /// Decode and dispatch one datagram. Undecodable input is dropped.
    pub fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr, now: Instant) -> Vec<Outbound> {
        match Envelope::decode(bytes, self.config.framing) {
            Ok(envelope) => self.handle_envelope(envelope, from, now),
            Err(e) => {
                log::debug!("Dropping undecodable datagram from {from}: {e}");
                Vec::new()
            }
        }
    }

    /// Dispatch one decoded envelope.
    pub fn handle_envelope(&mut self, envelope: Envelope, from: SocketAddr, now: Instant) -> Vec<Outbound> {
        if envelope.sender == self.store.client() {
            log::trace!("Ignoring own {} looped back", envelope.message.kind());
            return Vec::new();
        }
        log::trace!("{} from {from}", envelope.message.kind());

        // A repeated PEER_LEAVE must not bring the departed record back.
        let leaving = matches!(envelope.message, WireMessage::PeerLeave { .. });
        if !leaving && self.peers.touch(from, now) {
            log::info!("Peer {from} is back");
            self.notify_peers();
        }

        match envelope.message {
            WireMessage::Invite { name, .. } => self.on_invite(name, from, now),
            WireMessage::InviteAccept { name, addr } => self.on_invite_accept(name, addr, from, now),
            WireMessage::PeerAnnounce { name, .. } => self.on_peer_announce(name, from, now),
            WireMessage::PeerLeave { .. } => {
                if self.peers.mark_left(from) {
                    log::info!("Peer {from} left");
                    self.notify_peers();
                }
                Vec::new()
            }
            message @ (WireMessage::CrdtInsert { .. } | WireMessage::CrdtDelete { .. }) => {
                if let Some(op) = message.into_operation() {
                    self.on_remote_operation(op);
                }
                Vec::new()
            }
            WireMessage::RequestSnapshot { .. } => self.on_snapshot_request(from),
            WireMessage::Snapshot { payload, .. } => {
                if !self.expects_snapshot_from(from, now) {
                    log::debug!("Ignoring unrequested SNAPSHOT from {from}");
                    return Vec::new();
                }
                match codec::decompress(&payload) {
                    Ok(bytes) => self.on_snapshot_bytes(&bytes, from, now),
                    Err(e) => {
                        log::debug!("Dropping SNAPSHOT from {from}: {e}");
                        Vec::new()
                    }
                }
            }
            WireMessage::Chunk(chunk) => {
                if !self.expects_snapshot_from(from, now) {
                    log::debug!("Ignoring unrequested CHUNK from {from}");
                    return Vec::new();
                }
                match self.reassembler.feed(from, chunk, now) {
                    Ok(Some(bytes)) => self.on_snapshot_bytes(&bytes, from, now),
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        log::debug!("Dropping CHUNK from {from}: {e}");
                        Vec::new()
                    }
                }
            }
            WireMessage::StateCheck { hash, count } => {
                self.on_state_check(StateDigest { hash, count }, from, now)
            }
        }
    }

    fn on_invite(&mut self, name: String, from: SocketAddr, now: Instant) -> Vec<Outbound> {
        if self.peers.announce(from, &name, now) {
            self.notify_peers();
        }
        if self.state != SessionState::Solo {
            log::debug!("Ignoring INVITE from {from} while {:?}", self.state);
            return Vec::new();
        }
        if self.declined.contains(&from) {
            return Vec::new();
        }

        let host = HostInfo {
            name,
            address: from,
        };
        if self.collaborator.on_join_request(&host) == JoinDecision::Decline {
            log::info!("Declined invite from '{}' at {from}", host.name);
            self.declined.insert(from);
            return Vec::new();
        }
        if self.collaborator.has_unsaved_changes()
            && self.collaborator.on_unsaved_conflict() == ConflictResolution::Cancel
        {
            log::info!("Join of '{}' cancelled to keep unsaved text", host.name);
            self.declined.insert(from);
            return Vec::new();
        }

        log::info!("Joining session hosted by '{}' at {from}", host.name);
        self.host = Some(host);
        self.join_buffer.clear();
        self.reassembler.clear();
        self.set_state(SessionState::Joining);
        self.join_requests()
    }

    fn on_invite_accept(
        &mut self,
        name: String,
        advertised: SocketAddr,
        from: SocketAddr,
        now: Instant,
    ) -> Vec<Outbound> {
        if !self.state.is_shared() {
            log::debug!("Ignoring INVITE_ACCEPT from {from} while {:?}", self.state);
            return Vec::new();
        }
        log::info!("'{name}' joined from {from} (advertised {advertised})");
        if self.peers.observe(from, &name, now) {
            self.notify_peers();
        }
        self.set_state(SessionState::Collaborating);
        self.snapshot_to(from)
    }

    fn on_peer_announce(&mut self, name: String, from: SocketAddr, now: Instant) -> Vec<Outbound> {
        if self.state == SessionState::Solo {
            log::debug!("Ignoring PEER_ANNOUNCE from {from} while Solo");
            return Vec::new();
        }
        let newcomer = self.peers.observe(from, &name, now);
        if newcomer {
            log::info!("Peer '{name}' at {from} is collaborating");
            self.notify_peers();
        }
        match self.state {
            SessionState::Hosting => {
                self.set_state(SessionState::Collaborating);
                Vec::new()
            }
            // Introduce ourselves so the newcomer's directory is complete.
            SessionState::Collaborating if newcomer => vec![self.send_to(
                from,
                WireMessage::PeerAnnounce {
                    name: self.config.display_name.clone(),
                    addr: self.local_addr,
                },
            )],
            _ => Vec::new(),
        }
    }

    fn on_remote_operation(&mut self, op: Operation) {
        match self.state {
            SessionState::Hosting | SessionState::Collaborating => {
                if self.store.apply_remote(op) {
                    self.notify_document();
                }
            }
            SessionState::Joining => {
                if self.join_buffer.len() < self.config.join_buffer_limit {
                    self.join_buffer.push(op);
                } else {
                    log::debug!("Join buffer full, dropping {}", op.id());
                }
            }
            SessionState::Solo => {
                log::debug!("Ignoring remote operation {} while Solo", op.id());
            }
        }
    }

    fn on_snapshot_request(&mut self, from: SocketAddr) -> Vec<Outbound> {
        if !self.state.is_shared() {
            log::debug!("Ignoring REQUEST_SNAPSHOT from {from} while {:?}", self.state);
            return Vec::new();
        }
        log::debug!("Sending snapshot to {from}");
        self.snapshot_to(from)
    }

    fn expects_snapshot_from(&self, from: SocketAddr, now: Instant) -> bool {
        match self.state {
            SessionState::Joining => self.host.as_ref().is_some_and(|h| h.address == from),
            SessionState::Hosting | SessionState::Collaborating => {
                self.repair_in_flight(now) && self.repair.is_some_and(|r| r.peer == from)
            }
            SessionState::Solo => false,
        }
    }

    fn on_snapshot_bytes(&mut self, bytes: &[u8], from: SocketAddr, now: Instant) -> Vec<Outbound> {
        let snapshot = match codec::deserialize_snapshot(bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::debug!("Dropping snapshot from {from}: {e}");
                return Vec::new();
            }
        };
        match self.state {
            SessionState::Joining => self.complete_join(snapshot, from, now),
            SessionState::Hosting | SessionState::Collaborating => {
                self.complete_repair(snapshot, from);
                Vec::new()
            }
            SessionState::Solo => Vec::new(),
        }
    }

    fn complete_join(&mut self, snapshot: Snapshot, from: SocketAddr, now: Instant) -> Vec<Outbound> {
        if let Err(e) = self.store.load_snapshot(snapshot) {
            log::warn!("Rejected join snapshot from {from}: {e}");
            return Vec::new();
        }
        let buffered = std::mem::take(&mut self.join_buffer);
        let replayed = buffered.len();
        for op in buffered {
            self.store.apply_remote(op);
        }

        let host_name = self.host.take().map(|h| h.name).unwrap_or_default();
        self.peers.observe(from, &host_name, now);
        self.reassembler.clear();
        self.set_state(SessionState::Collaborating);
        log::info!(
            "Joined '{host_name}': {} chars, {replayed} buffered ops replayed",
            self.store.len()
        );

        self.notify_document();
        self.notify_peers();
        vec![self.broadcast(WireMessage::PeerAnnounce {
            name: self.config.display_name.clone(),
            addr: self.local_addr,
        })]
    }

    fn complete_repair(&mut self, snapshot: Snapshot, from: SocketAddr) {
        self.repair = None;
        let changed = self.store.merge_snapshot(snapshot);
        log::info!("Merged repair snapshot from {from} (text changed: {changed})");
        if changed {
            self.notify_document();
        }
        self.collaborator
            .on_status(SessionStatus::Resynced { changed });
    }

    fn on_state_check(&mut self, remote: StateDigest, from: SocketAddr, now: Instant) -> Vec<Outbound> {
        if !self.state.is_shared() {
            log::debug!("Ignoring STATE_CHECK from {from} while {:?}", self.state);
            return Vec::new();
        }
        let local = self.fingerprinted();
        if local == remote {
            return Vec::new();
        }
        if self.repair_in_flight(now) {
            log::debug!("State mismatch with {from}; repair already in flight");
            return Vec::new();
        }

        log::info!(
            "State mismatch with {from}: local {}/{} vs remote {}/{}; requesting snapshot",
            local.hash,
            local.count,
            remote.hash,
            remote.count
        );
        self.repair = Some(RepairRequest {
            peer: from,
            requested_at: now,
        });
        self.collaborator
            .on_status(SessionStatus::Resyncing { peer: from });
        vec![self.send_to(
            from,
            WireMessage::RequestSnapshot {
                addr: self.local_addr,
            },
        )]
    }

    // ─── Timers ─────────────────────────────────────────────────────

    /// Periodic consistency and retransmission tick.
    pub fn on_check_tick(&mut self, now: Instant) -> Vec<Outbound> {
        if let Some(repair) = self.repair {
            if !self.repair_in_flight(now) {
                log::debug!("Repair request to {} expired", repair.peer);
                self.repair = None;
            }
        }

        match self.state {
            SessionState::Solo => Vec::new(),
            SessionState::Hosting if self.peers.active_peers().is_empty() => vec![self.invite()],
            SessionState::Joining => self.join_requests(),
            SessionState::Hosting | SessionState::Collaborating => {
                let local = self.fingerprinted();
                vec![
                    self.broadcast(WireMessage::StateCheck {
                        hash: local.hash,
                        count: local.count,
                    }),
                    // Keep the session discoverable for late joiners.
                    self.invite(),
                ]
            }
        }
    }

    /// Periodic liveness and buffer-expiry tick.
    pub fn on_sweep_tick(&mut self, now: Instant) {
        let expired = self.peers.sweep_expired(now, self.config.liveness_timeout);
        for address in &expired {
            log::info!("Peer {address} timed out");
        }
        if !expired.is_empty() {
            self.notify_peers();
        }

        let purged = self.reassembler.purge_expired(now, self.config.reassembly_ttl);
        if purged > 0 {
            log::debug!("Purged {purged} stale snapshot transfers");
        }

        if self.state == SessionState::Joining {
            let timeout = self.config.liveness_timeout;
            let host_silent = self
                .host
                .as_ref()
                .and_then(|host| self.peers.get(&host.address))
                .map_or(true, |record| {
                    now.saturating_duration_since(record.last_seen) > timeout
                });
            if host_silent {
                log::warn!("Host went silent before the join completed; back to solo");
                self.reset_to_solo();
            }
        }
    }

    // ─── Helpers ────────────────────────────────────────────────────

    fn repair_in_flight(&self, now: Instant) -> bool {
        self.repair.is_some_and(|r| {
            now.saturating_duration_since(r.requested_at) <= self.config.reassembly_ttl
        })
    }

    fn fingerprinted(&self) -> StateDigest {
        StateDigest {
            hash: self.store.fingerprint(),
            count: self.store.count() as u64,
        }
    }

    fn invite(&self) -> Outbound {
        self.broadcast(WireMessage::Invite {
            name: self.config.display_name.clone(),
            addr: self.local_addr,
        })
    }

    fn join_requests(&self) -> Vec<Outbound> {
        let Some(host) = &self.host else {
            return Vec::new();
        };
        vec![
            self.send_to(
                host.address,
                WireMessage::InviteAccept {
                    name: self.config.display_name.clone(),
                    addr: self.local_addr,
                },
            ),
            self.send_to(
                host.address,
                WireMessage::RequestSnapshot {
                    addr: self.local_addr,
                },
            ),
        ]
    }

    fn snapshot_to(&self, peer: SocketAddr) -> Vec<Outbound> {
        let budget = self.config.chunk_payload_budget();
        match codec::encode_snapshot(&self.store.snapshot(), budget) {
            Ok(messages) => messages
                .into_iter()
                .map(|m| self.send_to(peer, m))
                .collect(),
            Err(e) => {
                log::warn!("Failed to encode snapshot for {peer}: {e}");
                Vec::new()
            }
        }
    }

    fn reset_to_solo(&mut self) {
        self.host = None;
        self.join_buffer.clear();
        self.repair = None;
        self.reassembler.clear();
        self.declined.clear();
        let had_peers = !self.peers.is_empty();
        self.peers.clear();
        self.set_state(SessionState::Solo);
        if had_peers {
            self.notify_peers();
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        log::info!("Session {:?} -> {:?}", self.state, state);
        self.state = state;
        self.collaborator.on_status(SessionStatus::StateChanged(state));
    }

    fn notify_document(&mut self) {
        let text = self.store.materialize();
        self.collaborator.on_document_changed(&text);
    }

    fn notify_peers(&mut self) {
        let peers = self.peers.peers();
        self.collaborator.on_peer_list_changed(&peers);
    }

    fn broadcast(&self, message: WireMessage) -> Outbound {
        Outbound {
            target: Target::Broadcast,
            envelope: Envelope::new(self.store.client(), message),
        }
    }

    fn send_to(&self, peer: SocketAddr, message: WireMessage) -> Outbound {
        Outbound {
            target: Target::Peer(peer),
            envelope: Envelope::new(self.store.client(), message),
        }
    }
}
