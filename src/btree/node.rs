//! Tree nodes
//!
//! Nodes live in the tree's arena (`Vec<Node>`) and refer to each other by
//! `NodeId`. Only leaves hold payload.
//!
//! Leaf wire format:
//! ```text
//! ┌──────────────────────────────────────┐
//! │ version: u8 = 1                      │
//! │ entry_count: u32                     │
//! │ entries (entry_count times):         │
//! │   key: f64                           │
//! │   payload_len: u32                   │
//! │   payload: [u8; payload_len]         │
//! │ checksum: u32 (crc32 of the above)   │
//! └──────────────────────────────────────┘
//! ```

use crate::btree::codec::{ByteReader, ByteWriter, CHECKSUM_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{IndexKey, KeyRange};

/// Index of a node in the tree arena
pub type NodeId = u32;

/// Current leaf format version
pub const LEAF_VERSION: u8 = 1;

/// Encoded bytes per entry on top of the payload (key + length)
pub const LEAF_ENTRY_OVERHEAD: usize = 8 + 4;

/// Encoded bytes per leaf on top of its entries (version + count + checksum)
pub const LEAF_HEADER_OVERHEAD: usize = 1 + 4 + CHECKSUM_SIZE;

/// Separator keys and child references
#[derive(Debug, Clone, PartialEq)]
pub struct InternalNode {
    pub keys: Vec<IndexKey>,
    pub children: Vec<NodeId>,
}

impl InternalNode {
    /// Index of the child an insert of `key` descends into.
    ///
    /// Equal keys go right so duplicates keep insertion order.
    pub fn child_for_insert(&self, key: IndexKey) -> usize {
        self.keys.partition_point(|k| *k <= key)
    }

    /// Children whose separator bounds intersect `range`, in key order
    pub fn children_overlapping(&self, range: &KeyRange) -> impl Iterator<Item = NodeId> + '_ {
        let keys = &self.keys;
        let range = *range;
        self.children
            .iter()
            .enumerate()
            .filter(move |(i, _)| {
                let above_low = *i == keys.len() || keys[*i] >= range.low;
                let below_high = *i == 0 || keys[*i - 1] <= range.high;
                above_low && below_high
            })
            .map(|(_, id)| *id)
    }
}

/// Ordered (key, payload) pairs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeafNode {
    keys: Vec<IndexKey>,
    payloads: Vec<Vec<u8>>,
}

impl LeafNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<(IndexKey, Vec<u8>)>) -> Self {
        let (keys, payloads) = entries.into_iter().unzip();
        Self { keys, payloads }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[IndexKey] {
        &self.keys
    }

    pub fn entries(&self) -> impl Iterator<Item = (IndexKey, &[u8])> + '_ {
        self.keys
            .iter()
            .copied()
            .zip(self.payloads.iter().map(Vec::as_slice))
    }

    pub fn min_key(&self) -> Option<IndexKey> {
        self.keys.first().copied()
    }

    pub fn max_key(&self) -> Option<IndexKey> {
        self.keys.last().copied()
    }

    /// Insert after any existing entries with an equal key
    pub fn insert(&mut self, key: IndexKey, payload: Vec<u8>) {
        let pos = self.keys.partition_point(|k| *k <= key);
        self.keys.insert(pos, key);
        self.payloads.insert(pos, payload);
    }

    /// Move the upper half into a new leaf and return it
    pub fn split_off(&mut self) -> LeafNode {
        let mid = self.keys.len() / 2;
        LeafNode {
            keys: self.keys.split_off(mid),
            payloads: self.payloads.split_off(mid),
        }
    }

    /// True if at least one key falls in `range`
    pub fn contains_any(&self, range: &KeyRange) -> bool {
        let start = self.keys.partition_point(|k| *k < range.low);
        self.keys.get(start).is_some_and(|k| *k <= range.high)
    }

    /// Payloads whose key falls in `range`, in key order
    pub fn tuples_within(&self, range: &KeyRange) -> Vec<&[u8]> {
        let start = self.keys.partition_point(|k| *k < range.low);
        let end = self.keys.partition_point(|k| *k <= range.high);
        if start >= end {
            return Vec::new();
        }
        self.payloads[start..end].iter().map(Vec::as_slice).collect()
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.keys.clear();
        self.payloads.clear();
    }

    pub fn payload_bytes(&self) -> usize {
        self.payloads.iter().map(Vec::len).sum()
    }

    /// Size of `encode()` output without building it
    pub fn encoded_len(&self) -> usize {
        LEAF_HEADER_OVERHEAD + self.len() * LEAF_ENTRY_OVERHEAD + self.payload_bytes()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(self.encoded_len());
        w.put_u8(LEAF_VERSION);
        w.put_u32(self.keys.len() as u32);
        for (key, payload) in self.entries() {
            w.put_key(key);
            w.put_u32(payload.len() as u32);
            w.put_bytes(payload);
        }
        w.finish_with_checksum()
    }

    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        let mut r = ByteReader::checked(bytes, "leaf")?;

        let version = r.get_u8()?;
        if version != LEAF_VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported leaf version: {}",
                version
            )));
        }

        let count = r.get_count(LEAF_ENTRY_OVERHEAD)?;
        let mut keys = Vec::with_capacity(count);
        let mut payloads = Vec::with_capacity(count);

        for _ in 0..count {
            let key = r.get_key()?;
            if let Some(prev) = keys.last() {
                if key < *prev {
                    return Err(StorageError::Corruption(format!(
                        "leaf keys out of order: {} after {}",
                        key, prev
                    )));
                }
            }
            let len = r.get_u32()? as usize;
            keys.push(key);
            payloads.push(r.get_bytes(len)?.to_vec());
        }
        r.expect_end()?;

        Ok(Self { keys, payloads })
    }
}

/// A slot in the tree arena
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Internal(InternalNode),
    Leaf(LeafNode),
}
