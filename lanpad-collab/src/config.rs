//! Session configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use lanpad_core::DEFAULT_PENDING_LIMIT;

use crate::protocol::Framing;

/// Default UDP port for both binding and broadcasting.
pub const DEFAULT_PORT: u16 = 5005;

/// Datagram size that survives typical LAN MTUs without IP fragmentation.
pub const DEFAULT_MAX_DATAGRAM: usize = 1200;

/// Envelope overhead reserved around a chunk payload under each framing.
const BINARY_CHUNK_OVERHEAD: usize = 96;
const TEXT_CHUNK_OVERHEAD: usize = 256;
const MIN_CHUNK_PAYLOAD: usize = 64;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name shown to other peers
    pub display_name: String,
    /// Address the UDP socket binds to
    pub bind_addr: IpAddr,
    /// Local port (0 lets the OS pick)
    pub port: u16,
    /// Port broadcasts are sent to; equal to `port` on a real LAN
    pub broadcast_port: u16,
    /// Wire framing; all peers of a session must agree
    pub framing: Framing,
    /// Largest datagram the session will emit
    pub max_datagram: usize,
    /// Interval between STATE_CHECK probes
    pub state_check_interval: Duration,
    /// Interval between liveness sweeps
    pub sweep_interval: Duration,
    /// Silence after which an active peer is considered gone
    pub liveness_timeout: Duration,
    /// Lifetime of an incomplete chunk transfer or an unanswered repair
    pub reassembly_ttl: Duration,
    /// Upper bound on a single receive wait
    pub recv_timeout: Duration,
    /// Operations parked while waiting on missing dependencies
    pub pending_op_limit: usize,
    /// Remote operations buffered while joining
    pub join_buffer_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: "anonymous".to_string(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            broadcast_port: DEFAULT_PORT,
            framing: Framing::Binary,
            max_datagram: DEFAULT_MAX_DATAGRAM,
            state_check_interval: Duration::from_secs(3),
            sweep_interval: Duration::from_secs(1),
            liveness_timeout: Duration::from_secs(15),
            reassembly_ttl: Duration::from_secs(10),
            recv_timeout: Duration::from_millis(250),
            pending_op_limit: DEFAULT_PENDING_LIMIT,
            join_buffer_limit: 10_000,
        }
    }
}

impl SessionConfig {
    /// Config with the given display name and defaults elsewhere.
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    /// Compressed snapshot bytes that fit in one datagram once enveloped.
    ///
    /// Text framing base64-encodes payloads, so only three quarters of the
    /// remaining room is usable.
    pub fn chunk_payload_budget(&self) -> usize {
        let budget = match self.framing {
            Framing::Binary => self.max_datagram.saturating_sub(BINARY_CHUNK_OVERHEAD),
            Framing::Text => self.max_datagram.saturating_sub(TEXT_CHUNK_OVERHEAD) / 4 * 3,
        };
        budget.max(MIN_CHUNK_PAYLOAD)
    }
}
