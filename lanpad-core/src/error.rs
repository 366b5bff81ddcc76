use thiserror::Error;

use crate::id::Identifier;

/// Contract violations by the caller of the RGA store.
///
/// None of these happen in correct operation: they mean the editing layer
/// referenced an element or position the store never had.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RgaError {
    #[error("Unknown insert origin: {0}")]
    UnknownOrigin(Identifier),
    #[error("Unknown element: {0}")]
    UnknownElement(Identifier),
    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("Snapshot element {0} appears before its origin")]
    InvalidSnapshot(Identifier),
    #[error("Lamport clock exhausted")]
    ClockExhausted,
}
