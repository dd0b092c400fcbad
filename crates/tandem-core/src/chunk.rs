//! Chunk codec and partial-transfer registry
//!
//! Large payloads are split into fixed-size fragments before they go on the
//! channel. The receiving side collects fragments into a [`ChunkedTransfer`]
//! keyed by [`TransferKey`] and emits the payload once every slot is filled.
//! Fragments may arrive in any order and more than once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::ConfigError;
use crate::error::ProtocolError;
use crate::MAX_TRANSFER_CHUNKS;

/// Split a payload into ordered fragments of at most `max_fragment_size` bytes.
///
/// Fragment `i` is `payload[i * max .. (i + 1) * max]`. An empty payload
/// yields no fragments.
pub fn split(payload: &[u8], max_fragment_size: usize) -> Result<Vec<&[u8]>, ConfigError> {
    if max_fragment_size == 0 {
        return Err(ConfigError::InvalidFragmentSize("max_fragment_size"));
    }
    Ok(payload.chunks(max_fragment_size).collect())
}

/// Join a transfer's fragments if all of them have arrived.
pub fn reassemble(transfer: &ChunkedTransfer) -> Reassembly {
    transfer.reassemble()
}

/// Outcome of a reassembly attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    Complete(Vec<u8>),
    Incomplete { received: usize, total: usize },
}

/// What a chunked transfer carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    WorkspaceSnapshot,
    FileContent,
    Edit,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::WorkspaceSnapshot => write!(f, "workspace-snapshot"),
            TransferKind::FileContent => write!(f, "file-content"),
            TransferKind::Edit => write!(f, "edit"),
        }
    }
}

/// Identity of one in-flight transfer.
///
/// `target` is the file path for file and edit transfers, `None` for
/// workspace snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub kind: TransferKind,
    pub target: Option<String>,
}

impl TransferKey {
    pub fn workspace() -> Self {
        Self {
            kind: TransferKind::WorkspaceSnapshot,
            target: None,
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: TransferKind::FileContent,
            target: Some(path.into()),
        }
    }

    pub fn edit(path: impl Into<String>) -> Self {
        Self {
            kind: TransferKind::Edit,
            target: Some(path.into()),
        }
    }
}

/// Slots for one payload being reassembled.
///
/// Slots are filled lazily, so memory follows what has arrived rather than
/// the announced total.
#[derive(Debug, Clone)]
pub struct ChunkedTransfer {
    kind: TransferKind,
    total: u32,
    slots: BTreeMap<u32, Vec<u8>>,
    started_at: Instant,
}

impl ChunkedTransfer {
    pub fn new(kind: TransferKind, total_chunks: u32) -> Self {
        Self {
            kind,
            total: total_chunks,
            slots: BTreeMap::new(),
            started_at: Instant::now(),
        }
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn total_chunks(&self) -> usize {
        self.total as usize
    }

    pub fn received_count(&self) -> usize {
        self.slots.len()
    }

    /// Store a fragment. A repeated index overwrites the earlier copy.
    pub fn insert(&mut self, index: u32, fragment: Vec<u8>) -> Result<(), ProtocolError> {
        if index >= self.total {
            return Err(ProtocolError::ChunkOutOfRange {
                index,
                total: self.total,
            });
        }
        self.slots.insert(index, fragment);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.slots.len() == self.total as usize
    }

    pub fn reassemble(&self) -> Reassembly {
        if !self.is_complete() {
            return Reassembly::Incomplete {
                received: self.slots.len(),
                total: self.total as usize,
            };
        }
        let len = self.slots.values().map(Vec::len).sum();
        let mut payload = Vec::with_capacity(len);
        for fragment in self.slots.values() {
            payload.extend_from_slice(fragment);
        }
        Reassembly::Complete(payload)
    }

    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }
}

/// In-flight transfers keyed by (kind, target).
///
/// Completed transfers are removed the moment their payload is emitted; stale
/// ones are dropped by [`TransferRegistry::expire`].
#[derive(Debug)]
pub struct TransferRegistry {
    transfers: HashMap<TransferKey, ChunkedTransfer>,
    ttl: Duration,
}

impl TransferRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            transfers: HashMap::new(),
            ttl,
        }
    }

    /// Apply one fragment. Returns the payload when this fragment completes it.
    ///
    /// A fragment announcing a different total than the transfer in progress
    /// for the same key starts a fresh transfer. Totals above
    /// [`MAX_TRANSFER_CHUNKS`] are rejected.
    pub fn accept(
        &mut self,
        key: TransferKey,
        index: u32,
        total: u32,
        fragment: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        if total == 0 || total > MAX_TRANSFER_CHUNKS || index >= total {
            return Err(ProtocolError::ChunkOutOfRange { index, total });
        }

        let restart = self
            .transfers
            .get(&key)
            .is_some_and(|t| t.total_chunks() != total as usize);
        if restart {
            debug!("Restarting {} transfer {:?} with {} chunks", key.kind, key.target, total);
            self.transfers.remove(&key);
        }

        let transfer = self
            .transfers
            .entry(key.clone())
            .or_insert_with(|| ChunkedTransfer::new(key.kind, total));
        transfer.insert(index, fragment)?;

        match transfer.reassemble() {
            Reassembly::Complete(payload) => {
                self.transfers.remove(&key);
                Ok(Some(payload))
            }
            Reassembly::Incomplete { .. } => Ok(None),
        }
    }

    /// Drop transfers older than the configured lifetime. Returns how many.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.transfers.len();
        let ttl = self.ttl;
        self.transfers.retain(|_, t| t.age(now) < ttl);
        before - self.transfers.len()
    }

    /// Drop every partial transfer
    pub fn clear(&mut self) {
        self.transfers.clear();
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn get(&self, key: &TransferKey) -> Option<&ChunkedTransfer> {
        self.transfers.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer_from(fragments: &[&[u8]], order: &[usize]) -> ChunkedTransfer {
        let mut t = ChunkedTransfer::new(TransferKind::FileContent, fragments.len() as u32);
        for &i in order {
            t.insert(i as u32, fragments[i].to_vec()).unwrap();
        }
        t
    }

    #[test]
    fn test_split_sizes() {
        let payload: Vec<u8> = (0..=255).cycle().take(1000).collect();
        for max in [1, 7, 64, 999, 1000, 4096] {
            let fragments = split(&payload, max).unwrap();
            assert_eq!(fragments.len(), payload.len().div_ceil(max));
            assert!(fragments.iter().all(|f| f.len() <= max));
            assert_eq!(fragments.concat(), payload);
        }
    }

    #[test]
    fn test_split_empty_payload() {
        assert!(split(b"", 16).unwrap().is_empty());
    }

    #[test]
    fn test_split_rejects_zero() {
        assert!(matches!(
            split(b"abc", 0),
            Err(ConfigError::InvalidFragmentSize(_))
        ));
    }

    #[test]
    fn test_reassemble_out_of_order() {
        let payload = b"the quick brown fox jumps over the lazy dog";
        let fragments = split(payload, 5).unwrap();
        let n = fragments.len();

        let forward: Vec<usize> = (0..n).collect();
        let backward: Vec<usize> = (0..n).rev().collect();
        let interleaved: Vec<usize> = (0..n).step_by(2).chain((1..n).step_by(2)).collect();

        for order in [forward, backward, interleaved] {
            let t = transfer_from(&fragments, &order);
            assert_eq!(reassemble(&t), Reassembly::Complete(payload.to_vec()));
        }
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let fragments = split(b"abcdefgh", 3).unwrap();
        let t = transfer_from(&fragments, &[0, 1, 1, 0, 2, 2]);
        assert_eq!(t.received_count(), 3);
        assert_eq!(t.reassemble(), Reassembly::Complete(b"abcdefgh".to_vec()));
    }

    #[test]
    fn test_incomplete() {
        let fragments = split(b"abcdefgh", 3).unwrap();
        let t = transfer_from(&fragments, &[2, 0]);
        assert_eq!(
            t.reassemble(),
            Reassembly::Incomplete {
                received: 2,
                total: 3
            }
        );
    }

    #[test]
    fn test_insert_out_of_range() {
        let mut t = ChunkedTransfer::new(TransferKind::Edit, 2);
        assert_eq!(
            t.insert(2, vec![1]),
            Err(ProtocolError::ChunkOutOfRange { index: 2, total: 2 })
        );
    }

    #[test]
    fn test_registry_keys_do_not_collide() {
        let mut registry = TransferRegistry::new(Duration::from_secs(60));

        assert_eq!(registry.accept(TransferKey::file("a.txt"), 0, 2, b"aa".to_vec()), Ok(None));
        assert_eq!(registry.accept(TransferKey::file("b.txt"), 1, 2, b"BB".to_vec()), Ok(None));
        assert_eq!(registry.accept(TransferKey::edit("a.txt"), 0, 2, b"ee".to_vec()), Ok(None));
        assert_eq!(registry.len(), 3);

        let a = registry.accept(TransferKey::file("a.txt"), 1, 2, b"AA".to_vec());
        assert_eq!(a, Ok(Some(b"aaAA".to_vec())));
        assert_eq!(registry.len(), 2);

        let b = registry.accept(TransferKey::file("b.txt"), 0, 2, b"bb".to_vec());
        assert_eq!(b, Ok(Some(b"bbBB".to_vec())));
        assert!(registry.get(&TransferKey::edit("a.txt")).is_some());
    }

    #[test]
    fn test_registry_single_chunk() {
        let mut registry = TransferRegistry::new(Duration::from_secs(60));
        let done = registry.accept(TransferKey::workspace(), 0, 1, b"{}".to_vec());
        assert_eq!(done, Ok(Some(b"{}".to_vec())));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_restarts_on_new_total() {
        let mut registry = TransferRegistry::new(Duration::from_secs(60));
        registry
            .accept(TransferKey::workspace(), 0, 3, b"old".to_vec())
            .unwrap();
        registry
            .accept(TransferKey::workspace(), 0, 2, b"ne".to_vec())
            .unwrap();
        let done = registry.accept(TransferKey::workspace(), 1, 2, b"w".to_vec());
        assert_eq!(done, Ok(Some(b"new".to_vec())));
    }

    #[test]
    fn test_registry_rejects_bad_index() {
        let mut registry = TransferRegistry::new(Duration::from_secs(60));
        assert!(registry.accept(TransferKey::workspace(), 3, 3, vec![]).is_err());
        assert!(registry.accept(TransferKey::workspace(), 0, 0, vec![]).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_rejects_oversized_total() {
        let mut registry = TransferRegistry::new(Duration::from_secs(60));
        assert_eq!(
            registry.accept(TransferKey::workspace(), 0, u32::MAX, b"x".to_vec()),
            Err(ProtocolError::ChunkOutOfRange {
                index: 0,
                total: u32::MAX
            })
        );
        assert!(registry.is_empty());

        let at_limit = registry.accept(TransferKey::workspace(), 0, MAX_TRANSFER_CHUNKS, b"x".to_vec());
        assert_eq!(at_limit, Ok(None));
        assert_eq!(
            registry.get(&TransferKey::workspace()).map(ChunkedTransfer::received_count),
            Some(1)
        );
    }

    #[test]
    fn test_registry_expire_and_clear() {
        let mut registry = TransferRegistry::new(Duration::from_secs(60));
        registry
            .accept(TransferKey::file("x"), 0, 2, vec![1])
            .unwrap();
        assert_eq!(registry.expire(Instant::now()), 0);
        assert_eq!(registry.expire(Instant::now() + Duration::from_secs(120)), 1);
        assert!(registry.is_empty());

        registry
            .accept(TransferKey::file("y"), 0, 2, vec![1])
            .unwrap();
        registry.clear();
        assert!(registry.is_empty());
    }
}
