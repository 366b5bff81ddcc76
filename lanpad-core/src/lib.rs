//! # lanpad-core: Text CRDT for serverless LAN editing
//!
//! A Replicated Growable Array over characters. Replicas exchange
//! [`Operation`]s in any order, any number of times, and converge on the
//! same text.
//!
//! ```text
//!  local edit ──► RgaStore::local_insert / local_delete ──► Operation ──► peers
//!                                                                          │
//!  view ◄── materialize() ◄── RgaStore::apply_remote ◄─────── Operation ◄──┘
//! ```
//!
//! ## Modules
//!
//! - [`id`]: `ClientId` and the totally ordered `Identifier`
//! - [`clock`]: Lamport clock
//! - [`op`]: `Element`, `Operation`, `Snapshot`
//! - [`rga`]: the store: insert, delete, merge, snapshot, fingerprint

pub mod clock;
pub mod error;
pub mod id;
pub mod op;
pub mod rga;

pub use clock::LamportClock;
pub use error::RgaError;
pub use id::{ClientId, Identifier};
pub use op::{Element, Operation, Snapshot};
pub use rga::{Fingerprint, RgaStore, DEFAULT_PENDING_LIMIT};
