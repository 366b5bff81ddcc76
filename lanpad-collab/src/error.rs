use lanpad_core::RgaError;
use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::session::SessionState;

/// Errors surfaced to the caller of a session.
///
/// Network-side failures never reach here: they are logged and the session
/// keeps running. These are local problems the caller has to act on.
#[derive(Error, Debug)]
pub enum CollabError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Document error: {0}")]
    Document(#[from] RgaError),
    #[error("Operation not allowed while {0:?}")]
    InvalidState(SessionState),
    #[error("Session is shut down")]
    Closed,
}
