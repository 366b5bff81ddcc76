//! Element identifiers.
//!
//! Every inserted character gets an [`Identifier`] made of a Lamport counter
//! and the id of the replica that created it. Identifiers are totally ordered:
//! counter first, then client id bytes. The derived `Ord` relies on the field
//! order below.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque per-process replica token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a fresh random client id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an explicit UUID (for testing and deterministic replicas).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Raw bytes, used for hashing.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell replicas apart in logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Globally unique id of one element: `(counter, client)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub counter: u64,
    pub client: ClientId,
}

impl Identifier {
    pub fn new(counter: u64, client: ClientId) -> Self {
        Self { counter, client }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.client)
    }
}
