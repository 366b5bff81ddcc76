//! CRDT operations and elements.

use serde::{Deserialize, Serialize};

use crate::id::Identifier;

/// One node of the sequence. Never removed, only tombstoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: Identifier,
    pub ch: char,
    pub deleted: bool,
    /// Element this one was inserted right after (`None` = document start).
    pub left_origin: Option<Identifier>,
}

/// An operation produced by a local edit or received from a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert {
        id: Identifier,
        ch: char,
        left_origin: Option<Identifier>,
    },
    Delete {
        id: Identifier,
    },
}

impl Operation {
    /// Identifier of the element the operation creates or removes.
    pub fn id(&self) -> Identifier {
        match self {
            Operation::Insert { id, .. } | Operation::Delete { id } => *id,
        }
    }

    /// The element this operation cannot be applied without.
    pub fn dependency(&self) -> Option<Identifier> {
        match self {
            Operation::Insert { left_origin, .. } => *left_origin,
            Operation::Delete { id } => Some(*id),
        }
    }
}

/// Full replica state, tombstones included, in sequence order.
pub type Snapshot = Vec<Element>;
