//! Boundary between the session engine and whatever displays the document.
//!
//! The engine calls a [`Collaborator`] synchronously, from inside its lock,
//! whenever the visible text or the peer list changes and whenever it needs a
//! decision (joining a session, resolving unsaved local work).
//! [`ChannelCollaborator`] turns those calls into [`SessionEvent`]s on a tokio
//! channel for front-ends that run their own loop.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::peers::PeerRecord;
use crate::session::SessionState;

/// The session advertiser behind an `INVITE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub name: String,
    pub address: SocketAddr,
}

/// Answer to an invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    Accept,
    Decline,
}

/// What to do with unsaved local text when joining replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Persist the local text, then join.
    Save,
    /// Drop the local text and join.
    Discard,
    /// Stay solo.
    Cancel,
}

/// Non-blocking status updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    StateChanged(SessionState),
    /// A fingerprint mismatch with `peer` triggered a snapshot request.
    Resyncing { peer: SocketAddr },
    /// A repair snapshot was merged.
    Resynced { changed: bool },
}

/// Callbacks the session engine drives.
pub trait Collaborator: Send {
    /// The visible text changed because of remote activity or a join.
    fn on_document_changed(&mut self, text: &str);

    /// The peer directory changed.
    fn on_peer_list_changed(&mut self, peers: &[PeerRecord]);

    /// An invitation arrived while solo.
    fn on_join_request(&mut self, host: &HostInfo) -> JoinDecision;

    /// Local text is unsaved and a join is about to replace it.
    fn on_unsaved_conflict(&mut self) -> ConflictResolution {
        ConflictResolution::Cancel
    }

    fn has_unsaved_changes(&self) -> bool {
        false
    }

    fn on_status(&mut self, _status: SessionStatus) {}
}

/// Notifications emitted by [`ChannelCollaborator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    DocumentChanged(String),
    PeersChanged(Vec<PeerRecord>),
    /// An invitation arrived and was answered with the given decision.
    JoinRequested {
        host: HostInfo,
        decision: JoinDecision,
    },
    /// Unsaved text was resolved with the given choice.
    ConflictResolved(ConflictResolution),
    Status(SessionStatus),
}

/// Collaborator that forwards everything over an mpsc channel and answers
/// decisions with fixed policies.
pub struct ChannelCollaborator {
    tx: mpsc::Sender<SessionEvent>,
    join_policy: JoinDecision,
    conflict_policy: ConflictResolution,
    unsaved: Arc<AtomicBool>,
}

impl ChannelCollaborator {
    /// Create a collaborator and the receiving end of its event channel.
    pub fn new(
        join_policy: JoinDecision,
        conflict_policy: ConflictResolution,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let collaborator = Self {
            tx,
            join_policy,
            conflict_policy,
            unsaved: Arc::new(AtomicBool::new(false)),
        };
        (collaborator, rx)
    }

    /// Shared flag the front-end sets while it holds unsaved local text.
    pub fn unsaved_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.unsaved)
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            log::warn!("Dropping session event: {e}");
        }
    }
}

impl Collaborator for ChannelCollaborator {
    fn on_document_changed(&mut self, text: &str) {
        self.emit(SessionEvent::DocumentChanged(text.to_string()));
    }

    fn on_peer_list_changed(&mut self, peers: &[PeerRecord]) {
        self.emit(SessionEvent::PeersChanged(peers.to_vec()));
    }

    fn on_join_request(&mut self, host: &HostInfo) -> JoinDecision {
        self.emit(SessionEvent::JoinRequested {
            host: host.clone(),
            decision: self.join_policy,
        });
        self.join_policy
    }

    fn on_unsaved_conflict(&mut self) -> ConflictResolution {
        if self.conflict_policy != ConflictResolution::Cancel {
            self.unsaved.store(false, Ordering::SeqCst);
        }
        self.emit(SessionEvent::ConflictResolved(self.conflict_policy));
        self.conflict_policy
    }

    fn has_unsaved_changes(&self) -> bool {
        self.unsaved.load(Ordering::SeqCst)
    }

    fn on_status(&mut self, status: SessionStatus) {
        self.emit(SessionEvent::Status(status));
    }
}

// ───────────────────────────────────────────────────────────────────
// Network interface
// ───────────────────────────────────────────────────────────────────

/// Where this host lives on the LAN. Read once at session start.
pub trait NetworkInterface {
    /// Address advertised to peers.
    fn local_address(&self) -> IpAddr;
    /// Destination of broadcast datagrams.
    fn broadcast_address(&self) -> IpAddr;
}

/// Fixed addresses, e.g. from command-line flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticInterface {
    pub local: IpAddr,
    pub broadcast: IpAddr,
}

impl StaticInterface {
    pub fn new(local: IpAddr, broadcast: IpAddr) -> Self {
        Self { local, broadcast }
    }

    /// Loopback for single-machine testing.
    pub fn loopback() -> Self {
        Self::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        )
    }
}

impl Default for StaticInterface {
    fn default() -> Self {
        Self::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::BROADCAST),
        )
    }
}

impl NetworkInterface for StaticInterface {
    fn local_address(&self) -> IpAddr {
        self.local
    }

    fn broadcast_address(&self) -> IpAddr {
        self.broadcast
    }
}
