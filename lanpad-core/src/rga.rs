//! Replicated Growable Array over characters.
//!
//! The store keeps every element ever inserted in one ordered `Vec`.
//! Deleting only sets a tombstone, so any identifier stays a valid insert
//! anchor for the whole session.
//!
//! ```text
//!   None ─► [h 1@a] ─► [e 2@a] ─► [x 3@b]† ─► [l 3@a] ─► …
//!                                    † tombstone: hidden, still an anchor
//! ```
//!
//! Integration rule: a new element goes right after its left origin, then
//! walks forward past every element whose identifier is greater than its own.
//! Because identifiers come from a Lamport clock, that walk skips exactly the
//! concurrent siblings that must sort first (and their subtrees), which makes
//! merge commutative, associative and idempotent.
//!
//! Reference: Roh et al., "Replicated abstract data types", JPDC 2011

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::LamportClock;
use crate::error::RgaError;
use crate::id::{ClientId, Identifier};
use crate::op::{Element, Operation, Snapshot};

/// Default cap on causally blocked remote operations.
pub const DEFAULT_PENDING_LIMIT: usize = 4096;

/// SHA-256 summary of the full element sequence, tombstones included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

enum Outcome {
    Applied { changed: bool },
    Blocked,
}

/// The character sequence CRDT of one replica.
#[derive(Debug, Clone)]
pub struct RgaStore {
    client: ClientId,
    clock: LamportClock,
    /// Document order, tombstones included.
    sequence: Vec<Element>,
    /// Membership index over `sequence`.
    known: HashSet<Identifier>,
    /// Remote operations whose origin or target has not arrived yet.
    pending: Vec<Operation>,
    pending_limit: usize,
}

impl RgaStore {
    /// Create an empty store with a fresh random client id.
    pub fn new() -> Self {
        Self::with_client(ClientId::new())
    }

    /// Create an empty store for an explicit client id.
    pub fn with_client(client: ClientId) -> Self {
        Self {
            client,
            clock: LamportClock::new(),
            sequence: Vec::new(),
            known: HashSet::new(),
            pending: Vec::new(),
            pending_limit: DEFAULT_PENDING_LIMIT,
        }
    }

    /// Override the cap on parked remote operations.
    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit.max(1);
        self
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Current Lamport counter.
    pub fn clock(&self) -> u64 {
        self.clock.current()
    }

    // ─── Local edits ────────────────────────────────────────────────

    /// Insert `ch` right after `after` (`None` = document start).
    pub fn local_insert(
        &mut self,
        after: Option<Identifier>,
        ch: char,
    ) -> Result<Operation, RgaError> {
        if let Some(origin) = after {
            if !self.known.contains(&origin) {
                return Err(RgaError::UnknownOrigin(origin));
            }
        }

        let counter = self.clock.tick().ok_or(RgaError::ClockExhausted)?;
        let id = Identifier::new(counter, self.client);
        self.integrate(Element {
            id,
            ch,
            deleted: false,
            left_origin: after,
        })?;

        Ok(Operation::Insert {
            id,
            ch,
            left_origin: after,
        })
    }

    /// Tombstone `id`. Deleting twice still yields a valid operation.
    pub fn local_delete(&mut self, id: Identifier) -> Result<Operation, RgaError> {
        let pos = self.position(id).ok_or(RgaError::UnknownElement(id))?;
        self.sequence[pos].deleted = true;
        Ok(Operation::Delete { id })
    }

    /// Insert at a visible character index.
    pub fn insert_at(&mut self, index: usize, ch: char) -> Result<Operation, RgaError> {
        let len = self.len();
        if index > len {
            return Err(RgaError::IndexOutOfBounds { index, len });
        }
        let after = if index == 0 { None } else { self.id_at(index - 1) };
        self.local_insert(after, ch)
    }

    /// Delete the visible character at `index`.
    pub fn delete_at(&mut self, index: usize) -> Result<Operation, RgaError> {
        let id = self.id_at(index).ok_or(RgaError::IndexOutOfBounds {
            index,
            len: self.len(),
        })?;
        self.local_delete(id)
    }

    /// Turn the visible text into `text`, returning the operations to send.
    ///
    /// Only the span between the common prefix and the common suffix is
    /// touched: its old characters are deleted, then the new ones inserted.
    pub fn replace_text(&mut self, text: &str) -> Result<Vec<Operation>, RgaError> {
        let visible = self.visible_ids();
        let old: Vec<char> = self.materialize().chars().collect();
        let new: Vec<char> = text.chars().collect();

        let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
        let max_suffix = old.len().min(new.len()) - prefix;
        let suffix = old
            .iter()
            .rev()
            .zip(new.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let mut ops = Vec::new();
        for id in &visible[prefix..old.len() - suffix] {
            ops.push(self.local_delete(*id)?);
        }

        let mut after = if prefix == 0 { None } else { Some(visible[prefix - 1]) };
        for ch in &new[prefix..new.len() - suffix] {
            let op = self.local_insert(after, *ch)?;
            after = Some(op.id());
            ops.push(op);
        }

        Ok(ops)
    }

    // ─── Remote merge ───────────────────────────────────────────────

    /// Apply a peer's operation. Returns whether the visible text changed.
    ///
    /// Duplicates are no-ops. An operation whose origin (insert) or target
    /// (delete) is still unknown is parked and retried after later inserts.
    /// An operation carrying the maximum counter is rejected: observing it
    /// would leave no room for another local identifier.
    pub fn apply_remote(&mut self, op: Operation) -> bool {
        let counter = op.id().counter;
        if !LamportClock::can_follow(counter) {
            log::debug!(
                "Rejecting remote operation {}: counter {counter} exhausts the clock",
                op.id()
            );
            return false;
        }
        self.clock.observe(counter);

        match self.try_apply(&op) {
            Outcome::Applied { changed } => {
                let drained = self.drain_pending();
                changed || drained
            }
            Outcome::Blocked => {
                self.park(op);
                false
            }
        }
    }

    /// Union a peer's snapshot into this replica without dropping anything.
    pub fn merge_snapshot(&mut self, snapshot: Snapshot) -> bool {
        let before = self.materialize();

        let mut tombstones = Vec::new();
        for element in snapshot {
            if element.deleted {
                tombstones.push(element.id);
            }
            self.apply_remote(Operation::Insert {
                id: element.id,
                ch: element.ch,
                left_origin: element.left_origin,
            });
        }
        for id in tombstones {
            self.apply_remote(Operation::Delete { id });
        }

        self.materialize() != before
    }

    fn try_apply(&mut self, op: &Operation) -> Outcome {
        match op {
            Operation::Insert { id, ch, left_origin } => {
                if self.known.contains(id) {
                    return Outcome::Applied { changed: false };
                }
                if let Some(origin) = left_origin {
                    if !self.known.contains(origin) {
                        return Outcome::Blocked;
                    }
                }
                match self.integrate(Element {
                    id: *id,
                    ch: *ch,
                    deleted: false,
                    left_origin: *left_origin,
                }) {
                    Ok(_) => Outcome::Applied { changed: true },
                    Err(_) => Outcome::Blocked,
                }
            }
            Operation::Delete { id } => match self.position(*id) {
                Some(pos) => {
                    let element = &mut self.sequence[pos];
                    let changed = !element.deleted;
                    element.deleted = true;
                    Outcome::Applied { changed }
                }
                None => Outcome::Blocked,
            },
        }
    }

    fn park(&mut self, op: Operation) {
        if self.pending.contains(&op) {
            return;
        }
        if self.pending.len() >= self.pending_limit {
            let dropped = self.pending.remove(0);
            log::warn!(
                "Pending queue full ({}), dropping blocked op on {}",
                self.pending_limit,
                dropped.id()
            );
        }
        log::debug!("Parking op {} until {:?} arrives", op.id(), op.dependency());
        self.pending.push(op);
    }

    /// Retry parked operations until no more progress is made.
    fn drain_pending(&mut self) -> bool {
        let mut changed = false;
        loop {
            let mut progressed = false;
            let parked = std::mem::take(&mut self.pending);
            for op in parked {
                match self.try_apply(&op) {
                    Outcome::Applied { changed: c } => {
                        changed |= c;
                        progressed = true;
                    }
                    Outcome::Blocked => self.pending.push(op),
                }
            }
            if !progressed {
                return changed;
            }
        }
    }

    /// Place `element` per the RGA rule and record it. Returns its index.
    fn integrate(&mut self, element: Element) -> Result<usize, RgaError> {
        let mut pos = match element.left_origin {
            None => 0,
            Some(origin) => self.position(origin).ok_or(RgaError::UnknownOrigin(origin))? + 1,
        };
        while pos < self.sequence.len() && self.sequence[pos].id > element.id {
            pos += 1;
        }
        self.known.insert(element.id);
        self.sequence.insert(pos, element);
        Ok(pos)
    }

    fn position(&self, id: Identifier) -> Option<usize> {
        if !self.known.contains(&id) {
            return None;
        }
        self.sequence.iter().position(|e| e.id == id)
    }

    // ─── Reads ──────────────────────────────────────────────────────

    /// Visible text in document order.
    pub fn materialize(&self) -> String {
        self.sequence
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.ch)
            .collect()
    }

    /// Identifiers of the visible characters, in order.
    pub fn visible_ids(&self) -> Vec<Identifier> {
        self.sequence
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.id)
            .collect()
    }

    /// Identifier of the visible character at `index`.
    pub fn id_at(&self, index: usize) -> Option<Identifier> {
        self.sequence
            .iter()
            .filter(|e| !e.deleted)
            .nth(index)
            .map(|e| e.id)
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.sequence.iter().filter(|e| !e.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: Identifier) -> bool {
        self.known.contains(&id)
    }

    /// All elements in order, tombstones included.
    pub fn elements(&self) -> &[Element] {
        &self.sequence
    }

    /// Number of parked remote operations.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // ─── Full state ─────────────────────────────────────────────────

    /// Whole sequence for join sync and desync repair.
    pub fn snapshot(&self) -> Snapshot {
        self.sequence.clone()
    }

    /// Replace local state with a peer's snapshot.
    ///
    /// Only for adopting authoritative state; normal merge goes through
    /// [`apply_remote`](Self::apply_remote).
    pub fn load_snapshot(&mut self, snapshot: Snapshot) -> Result<(), RgaError> {
        let mut known = HashSet::with_capacity(snapshot.len());
        let mut max_counter = 0;
        for element in &snapshot {
            if let Some(origin) = element.left_origin {
                if !known.contains(&origin) {
                    return Err(RgaError::InvalidSnapshot(element.id));
                }
            }
            if !known.insert(element.id) || !LamportClock::can_follow(element.id.counter) {
                return Err(RgaError::InvalidSnapshot(element.id));
            }
            max_counter = max_counter.max(element.id.counter);
        }

        self.sequence = snapshot;
        self.known = known;
        self.pending.clear();
        self.clock.observe(max_counter);
        Ok(())
    }

    /// Hash over ordered `(id, char, deleted)` tuples.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for element in &self.sequence {
            hasher.update(element.id.counter.to_be_bytes());
            hasher.update(element.id.client.as_bytes());
            hasher.update((element.ch as u32).to_be_bytes());
            hasher.update([element.deleted as u8]);
        }
        Fingerprint(hasher.finalize().into())
    }

    /// Number of elements, tombstones included.
    pub fn count(&self) -> usize {
        self.sequence.len()
    }
}

impl Default for RgaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn replica(n: u8) -> RgaStore {
        RgaStore::with_client(ClientId::from_uuid(Uuid::from_bytes([n; 16])))
    }

    fn type_text(store: &mut RgaStore, text: &str) -> Vec<Operation> {
        let mut after = store.visible_ids().last().copied();
        let mut ops = Vec::new();
        for ch in text.chars() {
            let op = store.local_insert(after, ch).unwrap();
            after = Some(op.id());
            ops.push(op);
        }
        ops
    }

    #[test]
    fn test_local_insert_and_materialize() {
        let mut store = replica(1);
        type_text(&mut store, "hello");
        assert_eq!(store.materialize(), "hello");
        assert_eq!(store.len(), 5);
        assert_eq!(store.count(), 5);
    }

    #[test]
    fn test_insert_after_unknown_origin_fails() {
        let mut store = replica(1);
        let ghost = Identifier::new(99, ClientId::new());
        assert_eq!(
            store.local_insert(Some(ghost), 'x'),
            Err(RgaError::UnknownOrigin(ghost))
        );
        assert!(store.is_empty());
        assert_eq!(store.clock(), 0);
    }

    #[test]
    fn test_delete_hides_but_keeps_anchor() {
        let mut store = replica(1);
        let ops = type_text(&mut store, "abc");
        let b = ops[1].id();

        store.local_delete(b).unwrap();
        assert_eq!(store.materialize(), "ac");
        assert_eq!(store.count(), 3);

        // Tombstoned element is still a valid origin.
        store.local_insert(Some(b), 'X').unwrap();
        assert_eq!(store.materialize(), "aXc");
    }

    #[test]
    fn test_double_delete_is_idempotent() {
        let mut store = replica(1);
        let ops = type_text(&mut store, "ab");
        let first = store.local_delete(ops[0].id()).unwrap();
        let second = store.local_delete(ops[0].id()).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.materialize(), "b");
    }

    #[test]
    fn test_delete_unknown_fails() {
        let mut store = replica(1);
        let ghost = Identifier::new(1, ClientId::new());
        assert_eq!(store.local_delete(ghost), Err(RgaError::UnknownElement(ghost)));
    }

    #[test]
    fn test_remote_insert_is_idempotent() {
        let mut a = replica(1);
        let mut b = replica(2);
        let ops = type_text(&mut a, "hi");

        for op in &ops {
            assert!(b.apply_remote(op.clone()));
        }
        let fp = b.fingerprint();
        for op in &ops {
            assert!(!b.apply_remote(op.clone()));
        }
        assert_eq!(b.materialize(), "hi");
        assert_eq!(b.fingerprint(), fp);
    }

    #[test]
    fn test_remote_delete_is_idempotent() {
        let mut a = replica(1);
        let mut b = replica(2);
        for op in type_text(&mut a, "xy") {
            b.apply_remote(op);
        }
        let del = a.delete_at(0).unwrap();
        assert!(b.apply_remote(del.clone()));
        assert!(!b.apply_remote(del));
        assert_eq!(b.materialize(), "y");
    }

    #[test]
    fn test_concurrent_inserts_order_by_descending_id() {
        let mut a = replica(1);
        let mut b = replica(2);

        let op_a = a.local_insert(None, 'A').unwrap();
        let op_b = b.local_insert(None, 'B').unwrap();

        a.apply_remote(op_b.clone());
        b.apply_remote(op_a.clone());

        // Same counter, client 2 > client 1, so B sorts first.
        assert_eq!(a.materialize(), "BA");
        assert_eq!(b.materialize(), "BA");
    }

    #[test]
    fn test_convergence_example() {
        let mut a = replica(1);
        let mut b = replica(2);

        let a_ops = type_text(&mut a, "ab");
        let b_ops = type_text(&mut b, "x");

        for op in b_ops {
            a.apply_remote(op);
        }
        for op in a_ops.into_iter().rev() {
            b.apply_remote(op);
        }

        assert_eq!(a.materialize(), b.materialize());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_remote_advances_clock() {
        let mut a = replica(1);
        let mut b = replica(2);
        for _ in 0..5 {
            a.insert_at(0, 'z').unwrap();
        }
        let last = a.insert_at(0, 'q').unwrap();
        b.apply_remote(last);
        assert_eq!(b.clock(), 6);
        let mine = b.local_insert(None, 'm').unwrap();
        assert_eq!(mine.id().counter, 7);
    }

    #[test]
    fn test_remote_max_counter_is_rejected() {
        let mut store = replica(1);
        let hostile = Identifier::new(u64::MAX, replica(2).client());

        assert!(!store.apply_remote(Operation::Insert {
            id: hostile,
            ch: 'x',
            left_origin: None,
        }));
        assert!(!store.apply_remote(Operation::Delete { id: hostile }));
        assert_eq!(store.clock(), 0);
        assert_eq!(store.pending_len(), 0);

        let op = store.local_insert(None, 'a').unwrap();
        assert_eq!(op.id().counter, 1);
        assert_eq!(store.materialize(), "a");
    }

    #[test]
    fn test_load_snapshot_rejects_max_counter() {
        let mut store = replica(1);
        let snapshot = vec![Element {
            id: Identifier::new(u64::MAX, replica(2).client()),
            ch: 'x',
            deleted: false,
            left_origin: None,
        }];
        assert!(matches!(
            store.load_snapshot(snapshot),
            Err(RgaError::InvalidSnapshot(_))
        ));
        assert_eq!(store.clock(), 0);
    }

    #[test]
    fn test_out_of_order_insert_is_parked_then_applied() {
        let mut a = replica(1);
        let mut b = replica(2);
        let ops = type_text(&mut a, "abc");

        assert!(!b.apply_remote(ops[2].clone()));
        assert!(!b.apply_remote(ops[1].clone()));
        assert_eq!(b.pending_len(), 2);

        assert!(b.apply_remote(ops[0].clone()));
        assert_eq!(b.pending_len(), 0);
        assert_eq!(b.materialize(), "abc");
    }

    #[test]
    fn test_delete_before_insert_is_parked() {
        let mut a = replica(1);
        let mut b = replica(2);
        let ins = a.local_insert(None, 'k').unwrap();
        let del = a.local_delete(ins.id()).unwrap();

        assert!(!b.apply_remote(del));
        b.apply_remote(ins);
        assert_eq!(b.pending_len(), 0);
        assert_eq!(b.materialize(), "");
        assert_eq!(b.fingerprint(), a.fingerprint());
    }

    #[test]
    fn test_pending_limit_drops_oldest() {
        let mut a = replica(1);
        let mut b = replica(2).with_pending_limit(2);
        let ops = type_text(&mut a, "abcd");
        for op in &ops[1..] {
            b.apply_remote(op.clone());
        }
        assert_eq!(b.pending_len(), 2);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut a = replica(1);
        type_text(&mut a, "snapshot");
        a.delete_at(3).unwrap();

        let mut b = replica(2);
        b.load_snapshot(a.snapshot()).unwrap();
        assert_eq!(b.materialize(), a.materialize());
        assert_eq!(b.fingerprint(), a.fingerprint());
        assert_eq!(b.count(), a.count());
        assert!(b.clock() >= a.clock());
    }

    #[test]
    fn test_load_snapshot_rejects_orphan() {
        let mut a = replica(1);
        type_text(&mut a, "ab");
        let mut snap = a.snapshot();
        snap.remove(0);

        let mut b = replica(2);
        assert!(matches!(
            b.load_snapshot(snap),
            Err(RgaError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn test_tombstones_change_fingerprint() {
        let mut a = replica(1);
        let ops = type_text(&mut a, "ab");
        let mut b = replica(2);
        b.load_snapshot(a.snapshot()).unwrap();

        // Insert and delete on one side: same text, different history.
        let extra = b.local_insert(Some(ops[1].id()), 'z').unwrap();
        b.local_delete(extra.id()).unwrap();

        assert_eq!(a.materialize(), b.materialize());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.count(), b.count());
    }

    #[test]
    fn test_merge_snapshot_keeps_local_elements() {
        let mut a = replica(1);
        type_text(&mut a, "base");
        let mut b = replica(2);
        b.load_snapshot(a.snapshot()).unwrap();

        a.delete_at(0).unwrap();
        b.insert_at(4, '!').unwrap();

        assert!(b.merge_snapshot(a.snapshot()));
        assert_eq!(b.materialize(), "ase!");
        assert!(!b.merge_snapshot(a.snapshot()));
    }

    #[test]
    fn test_position_helpers() {
        let mut store = replica(1);
        store.insert_at(0, 'b').unwrap();
        store.insert_at(0, 'a').unwrap();
        store.insert_at(2, 'c').unwrap();
        assert_eq!(store.materialize(), "abc");

        store.delete_at(1).unwrap();
        assert_eq!(store.materialize(), "ac");
        assert_eq!(
            store.insert_at(5, 'x'),
            Err(RgaError::IndexOutOfBounds { index: 5, len: 2 })
        );
        assert!(store.delete_at(2).is_err());
    }

    #[test]
    fn test_replace_text_minimal_diff() {
        let mut store = replica(1);
        store.replace_text("hello world").unwrap();
        assert_eq!(store.materialize(), "hello world");

        let ops = store.replace_text("hello there world").unwrap();
        assert_eq!(store.materialize(), "hello there world");
        assert!(ops.iter().all(|op| matches!(op, Operation::Insert { .. })));
        assert_eq!(ops.len(), 6);

        let ops = store.replace_text("help").unwrap();
        assert_eq!(store.materialize(), "help");
        assert!(!ops.is_empty());

        assert!(store.replace_text("help").unwrap().is_empty());
    }

    #[test]
    fn test_replace_text_replays_on_peer() {
        let mut a = replica(1);
        let mut b = replica(2);
        for op in a.replace_text("kitten").unwrap() {
            b.apply_remote(op);
        }
        for op in a.replace_text("sitting").unwrap() {
            b.apply_remote(op);
        }
        assert_eq!(b.materialize(), "sitting");
    }

    #[test]
    fn test_fingerprint_display() {
        let store = replica(1);
        assert_eq!(store.fingerprint().to_string().len(), 12);
    }
}
