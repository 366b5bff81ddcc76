//! # lanpad-collab: Serverless LAN collaboration for lanpad
//!
//! Peers find each other by UDP broadcast, exchange CRDT operations
//! directly, and repair divergence by comparing fingerprints.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   UDP broadcast / unicast   ┌───────────────┐
//! │ SessionHandle │ ◄──────────────────────────► │ SessionHandle │
//! │  (peer A)     │    Envelope{sender, msg}     │  (peer B)     │
//! └──────┬────────┘                              └──────┬────────┘
//!        │                                              │
//!        ▼                                              ▼
//! ┌───────────────┐                              ┌───────────────┐
//! │ SessionEngine │── PeerDirectory              │ SessionEngine │
//! │               │── Reassembler                │               │
//! │               │── RgaStore                   │               │
//! └──────┬────────┘                              └───────────────┘
//!        │
//!        ▼
//!   Collaborator (document view, prompts)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: envelope, wire messages, binary/text framing
//! - [`codec`]: operation codec, snapshot compression, chunking and reassembly
//! - [`peers`]: peer directory with liveness
//! - [`collaborator`]: callbacks to the document view, network interface
//! - [`session`]: the protocol state machine
//! - [`transport`]: tokio UDP runtime
//! - [`config`]: session configuration

pub mod codec;
pub mod collaborator;
pub mod config;
pub mod error;
pub mod peers;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use codec::{decode_operation, encode_operation, encode_snapshot, Reassembler};
pub use collaborator::{
    ChannelCollaborator, Collaborator, ConflictResolution, HostInfo, JoinDecision,
    NetworkInterface, SessionEvent, SessionStatus, StaticInterface,
};
pub use config::{SessionConfig, DEFAULT_MAX_DATAGRAM, DEFAULT_PORT};
pub use error::CollabError;
pub use peers::{PeerDirectory, PeerRecord, PeerState};
pub use protocol::{Chunk, Envelope, Framing, ProtocolError, WireMessage};
pub use session::{Outbound, SessionEngine, SessionState, Target};
pub use transport::SessionHandle;
