//! Operation and snapshot codec.
//!
//! Snapshots travel compressed. When the compressed bytes do not fit in one
//! datagram they are split into chunks that share a transfer id:
//!
//! ```text
//! Snapshot ──bincode──► bytes ──LZ4──► compressed
//!                                         │
//!                      fits? ─── yes ──► SNAPSHOT { transfer_id, payload }
//!                         │
//!                         no ──► CHUNK 0/n, CHUNK 1/n, … CHUNK n-1/n
//!
//! Receiver: Reassembler keyed by (source, transfer_id) ──► LZ4 ──► Snapshot
//! ```
//!
//! Reference: Kleppmann, DDIA, Chapter 4 (Encoding and Evolution)

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use lanpad_core::{Operation, Snapshot};
use uuid::Uuid;

use crate::protocol::{Chunk, Framing, ProtocolError, WireMessage};

/// Ceiling on a decompressed snapshot.
pub const MAX_SNAPSHOT_BYTES: usize = 64 * 1024 * 1024;

/// Ceiling on the number of chunks in one transfer.
pub const MAX_CHUNKS: u32 = 65_536;

/// Incomplete transfers kept at once; the oldest is evicted beyond this.
pub const MAX_CONCURRENT_TRANSFERS: usize = 16;

// ───────────────────────────────────────────────────────────────────
// Operations
// ───────────────────────────────────────────────────────────────────

/// Encode one operation as a bare `CRDT_INSERT` / `CRDT_DELETE` message.
pub fn encode_operation(op: &Operation, framing: Framing) -> Result<Vec<u8>, ProtocolError> {
    WireMessage::from(op.clone()).encode(framing)
}

/// Decode a bare operation message.
pub fn decode_operation(bytes: &[u8], framing: Framing) -> Result<Operation, ProtocolError> {
    let message = WireMessage::decode(bytes, framing)?;
    let got = message.kind();
    message
        .into_operation()
        .ok_or(ProtocolError::InvalidMessageType {
            expected: "CRDT_INSERT or CRDT_DELETE",
            got,
        })
}

// ───────────────────────────────────────────────────────────────────
// Snapshots
// ───────────────────────────────────────────────────────────────────

fn snapshot_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_SNAPSHOT_BYTES>()
}

/// Serialize a snapshot to uncompressed bytes.
pub fn serialize_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(snapshot, snapshot_config())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Deserialize uncompressed snapshot bytes.
pub fn deserialize_snapshot(bytes: &[u8]) -> Result<Snapshot, ProtocolError> {
    let (snapshot, _) = bincode::serde::decode_from_slice(bytes, snapshot_config())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(snapshot)
}

/// LZ4 block compression with the uncompressed size prepended.
pub fn compress(bytes: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(bytes)
}

/// Inverse of [`compress`]; refuses declared sizes above [`MAX_SNAPSHOT_BYTES`].
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let header: [u8; 4] = bytes
        .get(..4)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| ProtocolError::Decompression("missing size header".into()))?;
    let declared = u32::from_le_bytes(header) as usize;
    if declared > MAX_SNAPSHOT_BYTES {
        return Err(ProtocolError::TooLarge {
            size: declared,
            limit: MAX_SNAPSHOT_BYTES,
        });
    }
    lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| ProtocolError::Decompression(e.to_string()))
}

/// Encode a snapshot into the messages that carry it.
///
/// Returns a single `SNAPSHOT` when the compressed payload fits in
/// `max_payload` bytes, otherwise `CHUNK` messages in index order.
pub fn encode_snapshot(
    snapshot: &Snapshot,
    max_payload: usize,
) -> Result<Vec<WireMessage>, ProtocolError> {
    let compressed = compress(&serialize_snapshot(snapshot)?);
    let transfer_id = Uuid::new_v4();
    let max_payload = max_payload.max(1);

    if compressed.len() <= max_payload {
        return Ok(vec![WireMessage::Snapshot {
            transfer_id,
            payload: compressed,
        }]);
    }

    let total = compressed.len().div_ceil(max_payload);
    let total = u32::try_from(total)
        .ok()
        .filter(|t| *t <= MAX_CHUNKS)
        .ok_or(ProtocolError::TooLarge {
            size: compressed.len(),
            limit: MAX_CHUNKS as usize * max_payload,
        })?;

    Ok(compressed
        .chunks(max_payload)
        .enumerate()
        .map(|(index, part)| {
            WireMessage::Chunk(Chunk {
                transfer_id,
                index: index as u32,
                total,
                payload: part.to_vec(),
            })
        })
        .collect())
}

// ───────────────────────────────────────────────────────────────────
// Reassembly
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PendingTransfer {
    total: u32,
    parts: BTreeMap<u32, Vec<u8>>,
    bytes: usize,
    started: Instant,
}

/// Collects chunks per `(source, transfer_id)` until a transfer completes.
#[derive(Debug, Default)]
pub struct Reassembler {
    transfers: HashMap<(SocketAddr, Uuid), PendingTransfer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk.
    ///
    /// Returns the decompressed snapshot bytes once every index has arrived,
    /// `Ok(None)` while the transfer is incomplete. Duplicates are absorbed.
    pub fn feed(
        &mut self,
        source: SocketAddr,
        chunk: Chunk,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        if chunk.total == 0 || chunk.total > MAX_CHUNKS {
            return Err(ProtocolError::InvalidChunk(format!(
                "total {} outside 1..={MAX_CHUNKS}",
                chunk.total
            )));
        }
        if chunk.index >= chunk.total {
            return Err(ProtocolError::InvalidChunk(format!(
                "index {} out of range for total {}",
                chunk.index, chunk.total
            )));
        }

        let key = (source, chunk.transfer_id);
        if !self.transfers.contains_key(&key) {
            self.evict_if_full();
        }
        let transfer = self.transfers.entry(key).or_insert_with(|| PendingTransfer {
            total: chunk.total,
            parts: BTreeMap::new(),
            bytes: 0,
            started: now,
        });

        if transfer.total != chunk.total {
            self.transfers.remove(&key);
            return Err(ProtocolError::InvalidChunk(format!(
                "inconsistent total for transfer {}",
                chunk.transfer_id
            )));
        }
        if transfer.parts.contains_key(&chunk.index) {
            return Ok(None);
        }
        transfer.bytes += chunk.payload.len();
        if transfer.bytes > MAX_SNAPSHOT_BYTES {
            self.transfers.remove(&key);
            return Err(ProtocolError::TooLarge {
                size: chunk.payload.len(),
                limit: MAX_SNAPSHOT_BYTES,
            });
        }
        transfer.parts.insert(chunk.index, chunk.payload);

        if transfer.parts.len() < transfer.total as usize {
            return Ok(None);
        }

        let Some(done) = self.transfers.remove(&key) else {
            return Ok(None);
        };
        let mut compressed = Vec::with_capacity(done.bytes);
        for part in done.parts.into_values() {
            compressed.extend_from_slice(&part);
        }
        decompress(&compressed).map(Some)
    }

    /// Drop transfers older than `ttl`. Returns how many were dropped.
    pub fn purge_expired(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.transfers.len();
        self.transfers
            .retain(|_, t| now.saturating_duration_since(t.started) <= ttl);
        before - self.transfers.len()
    }

    pub fn clear(&mut self) {
        self.transfers.clear();
    }

    /// Incomplete transfers currently buffered.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    fn evict_if_full(&mut self) {
        if self.transfers.len() < MAX_CONCURRENT_TRANSFERS {
            return;
        }
        let oldest = self
            .transfers
            .iter()
            .min_by_key(|(_, t)| t.started)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            log::debug!("Evicting stale transfer {} from {}", key.1, key.0);
            self.transfers.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanpad_core::{ClientId, RgaStore};

    fn source() -> SocketAddr {
        "10.0.0.7:5005".parse().unwrap()
    }

    fn store_with(text: &str) -> RgaStore {
        let mut store = RgaStore::with_client(ClientId::new());
        store.replace_text(text).unwrap();
        store
    }

    /// Pseudo-random text so LZ4 cannot collapse it into one datagram.
    fn noisy_text(len: usize) -> String {
        let mut state: u32 = 0x2545_F491;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                char::from(b'!' + (state % 90) as u8)
            })
            .collect()
    }

    fn chunks_of(messages: Vec<WireMessage>) -> Vec<Chunk> {
        messages
            .into_iter()
            .map(|m| match m {
                WireMessage::Chunk(c) => c,
                other => panic!("expected CHUNK, got {}", other.kind()),
            })
            .collect()
    }

    #[test]
    fn test_operation_codec_roundtrip() {
        let mut store = store_with("ab");
        let op = store.insert_at(1, 'x').unwrap();
        for framing in [Framing::Binary, Framing::Text] {
            let bytes = encode_operation(&op, framing).unwrap();
            assert_eq!(decode_operation(&bytes, framing).unwrap(), op);
        }
    }

    #[test]
    fn test_decode_operation_rejects_other_kinds() {
        let msg = WireMessage::PeerLeave { addr: source() };
        let bytes = msg.encode(Framing::Binary).unwrap();
        assert!(matches!(
            decode_operation(&bytes, Framing::Binary),
            Err(ProtocolError::InvalidMessageType { got: "PEER_LEAVE", .. })
        ));
    }

    #[test]
    fn test_small_snapshot_is_single_message() {
        let store = store_with("hello");
        let messages = encode_snapshot(&store.snapshot(), 1104).unwrap();
        assert_eq!(messages.len(), 1);
        let WireMessage::Snapshot { payload, .. } = &messages[0] else {
            panic!("expected SNAPSHOT");
        };
        let bytes = decompress(payload).unwrap();
        assert_eq!(deserialize_snapshot(&bytes).unwrap(), store.snapshot());
    }

    #[test]
    fn test_chunk_reassembly_reverse_order() {
        let store = store_with(&noisy_text(3000));
        let snapshot = store.snapshot();
        let chunks = chunks_of(encode_snapshot(&snapshot, 200).unwrap());
        assert!(chunks.len() > 3);

        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        let mut result = None;
        for chunk in chunks.into_iter().rev() {
            result = reassembler.feed(source(), chunk, now).unwrap();
        }
        let bytes = result.expect("transfer should complete");
        assert_eq!(bytes, serialize_snapshot(&snapshot).unwrap());
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_duplicate_chunks_absorbed() {
        let store = store_with(&noisy_text(1000));
        let chunks = chunks_of(encode_snapshot(&store.snapshot(), 100).unwrap());
        let mut reassembler = Reassembler::new();
        let now = Instant::now();

        let first = chunks[0].clone();
        assert_eq!(reassembler.feed(source(), first.clone(), now).unwrap(), None);
        assert_eq!(reassembler.feed(source(), first, now).unwrap(), None);

        let mut result = None;
        for chunk in chunks.into_iter().skip(1) {
            result = reassembler.feed(source(), chunk, now).unwrap();
        }
        let snapshot = deserialize_snapshot(&result.unwrap()).unwrap();
        assert_eq!(snapshot, store.snapshot());
    }

    #[test]
    fn test_invalid_chunks_rejected() {
        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        let id = Uuid::new_v4();
        let chunk = |index, total| Chunk {
            transfer_id: id,
            index,
            total,
            payload: vec![1, 2, 3],
        };

        assert!(reassembler.feed(source(), chunk(0, 0), now).is_err());
        assert!(reassembler.feed(source(), chunk(3, 3), now).is_err());
        assert!(reassembler.feed(source(), chunk(0, MAX_CHUNKS + 1), now).is_err());

        assert_eq!(reassembler.feed(source(), chunk(0, 3), now).unwrap(), None);
        assert!(reassembler.feed(source(), chunk(1, 4), now).is_err());
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_transfers_keyed_by_source() {
        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        let id = Uuid::new_v4();
        let other: SocketAddr = "10.0.0.8:5005".parse().unwrap();
        let chunk = Chunk {
            transfer_id: id,
            index: 0,
            total: 2,
            payload: vec![9],
        };
        reassembler.feed(source(), chunk.clone(), now).unwrap();
        reassembler.feed(other, chunk, now).unwrap();
        assert_eq!(reassembler.len(), 2);
    }

    #[test]
    fn test_purge_expired() {
        let mut reassembler = Reassembler::new();
        let start = Instant::now();
        let chunk = Chunk {
            transfer_id: Uuid::new_v4(),
            index: 0,
            total: 2,
            payload: vec![1],
        };
        reassembler.feed(source(), chunk, start).unwrap();

        let ttl = Duration::from_secs(10);
        assert_eq!(reassembler.purge_expired(start + Duration::from_secs(5), ttl), 0);
        assert_eq!(reassembler.purge_expired(start + Duration::from_secs(11), ttl), 1);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_concurrent_transfers_bounded() {
        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        for i in 0..(MAX_CONCURRENT_TRANSFERS + 4) {
            let chunk = Chunk {
                transfer_id: Uuid::new_v4(),
                index: 0,
                total: 2,
                payload: vec![0],
            };
            reassembler
                .feed(source(), chunk, now + Duration::from_millis(i as u64))
                .unwrap();
        }
        assert_eq!(reassembler.len(), MAX_CONCURRENT_TRANSFERS);
    }

    #[test]
    fn test_decompress_refuses_oversized_header() {
        let mut bogus = ((MAX_SNAPSHOT_BYTES as u32) + 1).to_le_bytes().to_vec();
        bogus.extend_from_slice(&[0; 8]);
        assert!(matches!(decompress(&bogus), Err(ProtocolError::TooLarge { .. })));
        assert!(decompress(&[1, 2]).is_err());
    }
}
