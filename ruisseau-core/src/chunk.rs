//! Chunking and reassembly: split files into fixed-size chunks, buffer received chunks per
//! transfer, assemble and verify against the whole-file hash.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::integrity;
use crate::protocol::CHUNK_SIZE;

/// Upper bound on slots reserved up front from a size hint. Hints come from the network.
const MAX_PRESIZE_CHUNKS: u64 = 8192;

/// Split `bytes` into consecutive chunks of `chunk_size`; only the last may be shorter.
/// A zero chunk size falls back to [`CHUNK_SIZE`].
pub fn split(bytes: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    let size = if chunk_size == 0 { CHUNK_SIZE } else { chunk_size };
    bytes.chunks(size).collect()
}

/// Number of chunks a file of `total_len` bytes splits into.
pub fn chunk_count(total_len: u64, chunk_size: usize) -> u64 {
    let size = if chunk_size == 0 { CHUNK_SIZE } else { chunk_size } as u64;
    total_len.div_ceil(size)
}

/// Chunk index for a chunk starting at `start_byte`, or `None` if the start is not aligned.
pub fn chunk_index(start_byte: u64, chunk_size: usize) -> Option<u64> {
    let size = if chunk_size == 0 { CHUNK_SIZE } else { chunk_size } as u64;
    (start_byte % size == 0).then_some(start_byte / size)
}

/// Chunks received so far for one file, keyed by index.
struct ReceiveBuffer {
    chunks: HashMap<u64, Vec<u8>>,
    max_index: Option<u64>,
    buffered_bytes: u64,
    /// Running digest over chunks `0..prefix_next`.
    prefix: Sha256,
    prefix_next: u64,
}

impl ReceiveBuffer {
    fn with_size_hint(size_hint: u64, chunk_size: usize) -> Self {
        let slots = chunk_count(size_hint, chunk_size).min(MAX_PRESIZE_CHUNKS);
        Self {
            chunks: HashMap::with_capacity(slots as usize),
            max_index: None,
            buffered_bytes: 0,
            prefix: Sha256::new(),
            prefix_next: 0,
        }
    }

    /// Store a chunk; a later chunk for the same index replaces the earlier one.
    fn insert(&mut self, index: u64, bytes: Vec<u8>) {
        if index < self.prefix_next {
            if self.chunks.get(&index).is_some_and(|old| *old == bytes) {
                return;
            }
            // Already folded into the running digest; start over.
            self.prefix = Sha256::new();
            self.prefix_next = 0;
        }
        let len = bytes.len() as u64;
        if let Some(old) = self.chunks.insert(index, bytes) {
            self.buffered_bytes -= old.len() as u64;
        }
        self.buffered_bytes += len;
        self.max_index = Some(self.max_index.map_or(index, |m| m.max(index)));
        while let Some(chunk) = self.chunks.get(&self.prefix_next) {
            self.prefix.update(chunk);
            self.prefix_next += 1;
        }
    }

    /// Indices are unique map keys, so `len == max + 1` means every index `0..=max` is present.
    fn is_complete(&self) -> bool {
        self.max_index
            .is_some_and(|max| self.chunks.len() as u64 == max + 1)
    }

    fn digest(&self) -> String {
        debug_assert_eq!(self.prefix_next, self.chunks.len() as u64);
        integrity::finish(self.prefix.clone())
    }

    fn into_bytes(self) -> Vec<u8> {
        let mut indexed: Vec<(u64, Vec<u8>)> = self.chunks.into_iter().collect();
        indexed.sort_unstable_by_key(|(i, _)| *i);
        let mut out = Vec::with_capacity(self.buffered_bytes as usize);
        for (_, chunk) in indexed {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

/// Outcome of an assembly attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Assembly {
    /// All chunks present and digest matched. The buffer has been released.
    Complete(Vec<u8>),
    /// Gap detected; keep receiving.
    Incomplete { received: usize, highest: Option<u64> },
    /// Every index present but the bytes hash to something else. Buffer kept.
    HashMismatch { actual: String },
    /// No buffer for this id (never started, already assembled, or abandoned).
    NotReceiving,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer {0} not initialized for receiving")]
    NotInitialized(String),
}

/// Snapshot of one in-flight transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub hash: String,
    pub received_chunks: usize,
    pub highest_index: Option<u64>,
    pub buffered_bytes: u64,
}

/// Active receive buffers keyed by content hash.
pub struct Transfers {
    buffers: HashMap<String, ReceiveBuffer>,
    chunk_size: usize,
}

impl Transfers {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            chunk_size: if chunk_size == 0 { CHUNK_SIZE } else { chunk_size },
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Prepare to receive `id`. No-op if already receiving. Returns true if a buffer was created.
    pub fn start_receiving(&mut self, id: &str, size_hint: u64) -> bool {
        let key = integrity::normalize_hash(id);
        if self.buffers.contains_key(&key) {
            return false;
        }
        let buffer = ReceiveBuffer::with_size_hint(size_hint, self.chunk_size);
        self.buffers.insert(key, buffer);
        true
    }

    /// Store chunk `index` of `id`, replacing any earlier chunk with that index.
    pub fn add_chunk(&mut self, id: &str, index: u64, bytes: Vec<u8>) -> Result<(), TransferError> {
        let key = integrity::normalize_hash(id);
        let buffer = self
            .buffers
            .get_mut(&key)
            .ok_or(TransferError::NotInitialized(key))?;
        buffer.insert(index, bytes);
        Ok(())
    }

    /// Assemble `id` if every chunk is present and the bytes hash to `expected_hash`.
    /// Safe to call after every chunk; failure leaves the buffer untouched.
    pub fn try_assemble(&mut self, id: &str, expected_hash: &str) -> Assembly {
        let key = integrity::normalize_hash(id);
        let Some(buffer) = self.buffers.get(&key) else {
            return Assembly::NotReceiving;
        };
        if !buffer.is_complete() {
            return Assembly::Incomplete {
                received: buffer.chunks.len(),
                highest: buffer.max_index,
            };
        }
        let actual = buffer.digest();
        if !integrity::same_hash(&actual, expected_hash) {
            return Assembly::HashMismatch { actual };
        }
        match self.buffers.remove(&key) {
            Some(buffer) => Assembly::Complete(buffer.into_bytes()),
            None => Assembly::NotReceiving,
        }
    }

    /// Drop the buffer for `id`. Returns true if one existed.
    pub fn abandon(&mut self, id: &str) -> bool {
        self.buffers.remove(&integrity::normalize_hash(id)).is_some()
    }

    pub fn progress(&self, id: &str) -> Option<TransferProgress> {
        let key = integrity::normalize_hash(id);
        self.buffers.get(&key).map(|b| TransferProgress {
            received_chunks: b.chunks.len(),
            highest_index: b.max_index,
            buffered_bytes: b.buffered_bytes,
            hash: key,
        })
    }

    /// Progress of every active transfer, sorted by hash.
    pub fn all_progress(&self) -> Vec<TransferProgress> {
        let mut out: Vec<TransferProgress> = self
            .buffers
            .keys()
            .filter_map(|k| self.progress(k))
            .collect();
        out.sort_by(|a, b| a.hash.cmp(&b.hash));
        out
    }
}

impl Default for Transfers {
    fn default() -> Self {
        Self::new(CHUNK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn file(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn split_chunks() {
        let data = file(100);
        let chunks = split(&data, 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], &data[0..30]);
        assert_eq!(chunks[3], &data[90..100]);
    }

    #[test]
    fn split_exact_multiple() {
        let data = file(90);
        let chunks = split(&data, 30);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 30));
    }

    #[test]
    fn split_zero_length() {
        assert!(split(&[], 30).is_empty());
        assert_eq!(chunk_count(0, 30), 0);
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        let data = file(CHUNK_SIZE * 2 + 1);
        assert_eq!(split(&data, 0).len(), 3);
        assert_eq!(chunk_count(data.len() as u64, 0), 3);
    }

    #[test]
    fn nine_thousand_bytes_make_three_chunks() {
        let data = file(9000);
        let sizes: Vec<usize> = split(&data, CHUNK_SIZE).iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4096, 4096, 808]);
    }

    #[test]
    fn index_from_start_byte() {
        assert_eq!(chunk_index(0, CHUNK_SIZE), Some(0));
        assert_eq!(chunk_index(8192, CHUNK_SIZE), Some(2));
        assert_eq!(chunk_index(100, CHUNK_SIZE), None);
    }

    #[test]
    fn assembles_out_of_order_with_duplicates() {
        let (a, b, c) = (b"aaaa".to_vec(), b"bbbb".to_vec(), b"cc".to_vec());
        let expected = integrity::digest(b"aaaabbbbcc");
        let mut t = Transfers::new(4);
        t.start_receiving("h1", 10);
        t.add_chunk("h1", 2, c).unwrap();
        t.add_chunk("h1", 1, b.clone()).unwrap();
        t.add_chunk("h1", 1, b).unwrap();
        assert!(matches!(
            t.try_assemble("h1", &expected),
            Assembly::Incomplete { received: 2, highest: Some(2) }
        ));
        t.add_chunk("h1", 0, a).unwrap();
        assert_eq!(
            t.try_assemble("h1", &expected),
            Assembly::Complete(b"aaaabbbbcc".to_vec())
        );
        assert!(t.progress("h1").is_none());
    }

    #[test]
    fn gap_is_never_complete() {
        let mut t = Transfers::new(4);
        t.start_receiving("gap", 0);
        t.add_chunk("gap", 0, b"aaaa".to_vec()).unwrap();
        t.add_chunk("gap", 2, b"cc".to_vec()).unwrap();
        for expected in [integrity::digest(b"aaaacc"), integrity::digest(b"aaaa????cc")] {
            assert!(matches!(
                t.try_assemble("gap", &expected),
                Assembly::Incomplete { .. }
            ));
        }
        assert!(t.progress("gap").is_some());
    }

    #[test]
    fn mismatch_keeps_buffer_for_retry() {
        let mut t = Transfers::new(4);
        t.start_receiving("m", 0);
        t.add_chunk("m", 0, b"good".to_vec()).unwrap();
        let wrong = integrity::digest(b"other");
        assert!(matches!(
            t.try_assemble("m", &wrong),
            Assembly::HashMismatch { .. }
        ));
        assert!(t.progress("m").is_some());
        let right = integrity::digest(b"good");
        assert_eq!(t.try_assemble("m", &right), Assembly::Complete(b"good".to_vec()));
    }

    #[test]
    fn assembling_twice_is_safe() {
        let mut t = Transfers::new(4);
        let expected = integrity::digest(b"xy");
        t.start_receiving("twice", 2);
        t.add_chunk("twice", 0, b"xy".to_vec()).unwrap();
        assert!(matches!(t.try_assemble("twice", &expected), Assembly::Complete(_)));
        assert_eq!(t.try_assemble("twice", &expected), Assembly::NotReceiving);
        assert_eq!(t.try_assemble("twice", &expected), Assembly::NotReceiving);
    }

    #[test]
    fn add_before_start_fails() {
        let mut t = Transfers::default();
        assert_eq!(
            t.add_chunk("abc", 0, vec![1]),
            Err(TransferError::NotInitialized("ABC".into()))
        );
    }

    #[test]
    fn start_is_idempotent_and_keeps_chunks() {
        let mut t = Transfers::new(4);
        assert!(t.start_receiving("s", 8));
        t.add_chunk("s", 0, b"abcd".to_vec()).unwrap();
        assert!(!t.start_receiving("S", 8));
        assert_eq!(t.progress("s").unwrap().received_chunks, 1);
        assert_eq!(t.all_progress().len(), 1);
    }

    #[test]
    fn overwrite_of_hashed_prefix_restarts_digest() {
        let mut t = Transfers::new(2);
        t.start_receiving("o", 4);
        t.add_chunk("o", 0, b"XX".to_vec()).unwrap();
        t.add_chunk("o", 1, b"cd".to_vec()).unwrap();
        // Corrupt first copy replaced by the good one.
        t.add_chunk("o", 0, b"ab".to_vec()).unwrap();
        assert_eq!(
            t.try_assemble("o", &integrity::digest(b"abcd")),
            Assembly::Complete(b"abcd".to_vec())
        );
    }

    #[test]
    fn progress_tracks_bytes() {
        let mut t = Transfers::new(4);
        t.start_receiving("p", 12);
        t.add_chunk("p", 1, b"bbbb".to_vec()).unwrap();
        t.add_chunk("p", 1, b"bb".to_vec()).unwrap();
        let p = t.progress("p").unwrap();
        assert_eq!(p.hash, "P");
        assert_eq!(p.buffered_bytes, 2);
        assert_eq!(p.highest_index, Some(1));
        assert!(t.abandon("p"));
        assert!(t.all_progress().is_empty());
    }

    proptest! {
        #[test]
        fn split_concat_roundtrip(
            bytes in proptest::collection::vec(any::<u8>(), 0..5000),
            chunk_size in 1usize..600,
        ) {
            let chunks = split(&bytes, chunk_size);
            prop_assert_eq!(chunks.len() as u64, chunk_count(bytes.len() as u64, chunk_size));
            for c in chunks.iter().take(chunks.len().saturating_sub(1)) {
                prop_assert_eq!(c.len(), chunk_size);
            }
            prop_assert_eq!(chunks.concat(), bytes);
        }

        #[test]
        fn any_arrival_order_assembles(
            bytes in proptest::collection::vec(any::<u8>(), 1..3000),
            order in proptest::collection::vec(any::<prop::sample::Index>(), 0..40),
        ) {
            let chunk_size = 64;
            let chunks = split(&bytes, chunk_size);
            let expected = integrity::digest(&bytes);
            let mut t = Transfers::new(chunk_size);
            t.start_receiving(&expected, bytes.len() as u64);
            // Random duplicates first, then every chunk in reverse.
            for idx in &order {
                let i = idx.index(chunks.len());
                t.add_chunk(&expected, i as u64, chunks[i].to_vec()).unwrap();
            }
            for (i, c) in chunks.iter().enumerate().rev() {
                t.add_chunk(&expected, i as u64, c.to_vec()).unwrap();
            }
            prop_assert_eq!(t.try_assemble(&expected, &expected), Assembly::Complete(bytes));
        }
    }
}
