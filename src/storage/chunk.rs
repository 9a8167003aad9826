//! Chunk layout
//!
//! A chunk is the sealed, immutable unit written by the index builder:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ template_len: u32                       │  offset 0 (BlockId of the template)
//! │ template: [u8; template_len]            │
//! ├─────────────────────────────────────────┤
//! │ LEAF SECTION                            │  starts at 4 + template_len
//! │   For each leaf, in key order:          │
//! │     leaf_len: u32                       │  BlockId of the leaf
//! │     leaf: [u8; leaf_len]                │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Leaf slots in the template carry offsets relative to the leaf section, so
//! the template can be encoded before the file position of the section is
//! known.

use crate::btree::codec::{read_length_prefix, to_u32, LENGTH_PREFIX, MAX_ADDRESSABLE};
use crate::btree::node::LeafNode;
use crate::btree::template::{LeafSlot, Template};
use crate::btree::tree::BTree;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::filesystem::ChunkFile;

/// Estimated on-disk bytes per entry on top of its payload: leaf entry header
/// plus an upper bound on its share of leaf and template overhead
pub const ENTRY_OVERHEAD_ESTIMATE: usize = 72;

/// Estimated fixed bytes per chunk (length prefix, template header, one leaf)
pub const CHUNK_OVERHEAD_ESTIMATE: usize = 128;

/// Upper bound on the bytes one tuple adds to a chunk
pub fn estimated_entry_size(payload_len: usize) -> usize {
    payload_len + ENTRY_OVERHEAD_ESTIMATE
}

/// Bounded append-only byte buffer for one chunk
#[derive(Debug)]
pub struct ChunkBuffer {
    file_name: String,
    capacity: usize,
    buf: Vec<u8>,
    sealed: bool,
}

impl ChunkBuffer {
    pub fn new(file_name: impl Into<String>, capacity: usize) -> Self {
        Self {
            file_name: file_name.into(),
            capacity,
            buf: Vec::new(),
            sealed: false,
        }
    }

    /// Lay out a template and a leaf section into a sealed chunk.
    ///
    /// `capacity` is clamped to what the u32 offsets of the format can
    /// address.
    pub fn assemble(
        file_name: impl Into<String>,
        capacity: usize,
        template: &[u8],
        leaves: &[u8],
    ) -> StorageResult<Self> {
        let mut chunk = Self::new(file_name, capacity.min(MAX_ADDRESSABLE));
        chunk.append(&to_u32(template.len())?.to_le_bytes())?;
        chunk.append(template)?;
        chunk.append(leaves)?;
        chunk.seal();
        Ok(chunk)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Append bytes; fails once sealed or when the capacity would be exceeded
    pub fn append(&mut self, bytes: &[u8]) -> StorageResult<()> {
        if self.sealed {
            return Err(StorageError::Closed(format!(
                "chunk {} is sealed",
                self.file_name
            )));
        }
        if bytes.len() > self.remaining() {
            return Err(StorageError::CapacityExceeded {
                needed: bytes.len(),
                available: self.remaining(),
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Absolute offsets inside a chunk file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    template_len: u32,
}

impl ChunkLayout {
    pub fn new(template_len: u32) -> Self {
        Self { template_len }
    }

    /// Read the layout from the first bytes of a chunk
    pub fn from_prefix(prefix: &[u8]) -> StorageResult<Self> {
        let len = read_length_prefix(prefix, "chunk header")?;
        Ok(Self::new(len as u32))
    }

    pub fn template_len(&self) -> u32 {
        self.template_len
    }

    /// File range of the template bytes (after its length prefix)
    pub fn template_range(&self) -> (u64, usize) {
        (LENGTH_PREFIX as u64, self.template_len as usize)
    }

    pub fn leaf_section_start(&self) -> u64 {
        LENGTH_PREFIX as u64 + self.template_len as u64
    }

    /// Absolute file offset of a leaf block's length prefix
    pub fn block_offset(&self, slot: &LeafSlot) -> u64 {
        self.leaf_section_start() + slot.offset as u64
    }

    /// Smallest byte window covering every slot, length prefixes included
    pub fn window(&self, slots: &[LeafSlot]) -> Option<LeafWindow> {
        let start = slots.iter().map(|s| self.block_offset(s)).min()?;
        let end = slots
            .iter()
            .map(|s| self.block_offset(s) + LENGTH_PREFIX as u64 + s.length as u64)
            .max()?;
        Some(LeafWindow {
            layout: *self,
            start,
            len: (end - start) as usize,
        })
    }
}

/// One contiguous read covering a run of leaf blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafWindow {
    layout: ChunkLayout,
    pub start: u64,
    pub len: usize,
}

impl LeafWindow {
    /// Slice one leaf's bytes out of the window buffer, checking its length prefix
    pub fn leaf_bytes<'a>(&self, window: &'a [u8], slot: &LeafSlot) -> StorageResult<&'a [u8]> {
        let block = self.layout.block_offset(slot);
        if block < self.start {
            return Err(StorageError::Corruption(format!(
                "leaf at {} lies before window start {}",
                block, self.start
            )));
        }

        let rel = (block - self.start) as usize;
        let prefix = window.get(rel..).ok_or_else(|| {
            StorageError::Corruption(format!("leaf at {} lies past the window", block))
        })?;
        let stored = read_length_prefix(prefix, "leaf block")?;
        if stored != slot.length as usize {
            return Err(StorageError::Corruption(format!(
                "leaf at {} has length {} but template says {}",
                block, stored, slot.length
            )));
        }

        let body_start = rel + LENGTH_PREFIX;
        window
            .get(body_start..body_start + stored)
            .ok_or_else(|| StorageError::Corruption(format!("leaf at {} is truncated", block)))
    }
}

/// Read and decode a chunk's template
pub fn load_template(file: &mut ChunkFile) -> StorageResult<(ChunkLayout, Template)> {
    let layout = ChunkLayout::from_prefix(&file.read_bytes(0, LENGTH_PREFIX)?)?;
    let (offset, len) = layout.template_range();
    let template = Template::decode(&file.read_bytes(offset, len)?)?;
    Ok((layout, template))
}

/// Reattach a complete tree from a chunk file
pub fn load_tree(file: &mut ChunkFile) -> StorageResult<BTree> {
    let (layout, template) = load_template(file)?;
    let slots = template.leaf_slots();
    let Some(window) = layout.window(&slots) else {
        return BTree::from_template(&template, Vec::new());
    };

    let buf = file.read_bytes(window.start, window.len)?;
    let leaves = slots
        .iter()
        .map(|slot| LeafNode::decode(window.leaf_bytes(&buf, slot)?))
        .collect::<StorageResult<Vec<_>>>()?;
    BTree::from_template(&template, leaves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::filesystem::FileSystemHandler;
    use crate::storage::types::{IndexKey, KeyRange};

    fn tree(n: usize) -> BTree {
        let mut tree = BTree::new(4);
        for i in 0..n {
            let key = ((i * 37) % 101) as f64;
            tree.insert(IndexKey(key), format!("payload-{}", i).into_bytes());
        }
        tree
    }

    fn chunk_of(tree: &BTree) -> (Vec<u8>, Template) {
        let template = tree.serialize_template().unwrap();
        let leaves = tree.serialize_leaves().unwrap();
        let chunk = ChunkBuffer::assemble("chunk-0", 1 << 20, &template, &leaves).unwrap();
        (chunk.into_bytes(), Template::decode(&template).unwrap())
    }

    #[test]
    fn test_buffer_is_bounded() {
        let mut chunk = ChunkBuffer::new("c", 8);
        chunk.append(&[1, 2, 3, 4, 5]).unwrap();
        let err = chunk.append(&[6, 7, 8, 9]).unwrap_err();
        assert!(matches!(
            err,
            StorageError::CapacityExceeded {
                needed: 4,
                available: 3
            }
        ));
        assert_eq!(chunk.len(), 5);

        chunk.seal();
        assert!(matches!(chunk.append(&[1]), Err(StorageError::Closed(_))));
    }

    #[test]
    fn test_assemble_layout() {
        let t = tree(60);
        let (bytes, template) = chunk_of(&t);
        let layout = ChunkLayout::from_prefix(&bytes).unwrap();

        let (start, len) = layout.template_range();
        let decoded = Template::decode(&bytes[start as usize..start as usize + len]).unwrap();
        assert_eq!(decoded, template);

        let last = template.leaf_slots().last().copied().unwrap();
        let end = layout.block_offset(&last) as usize + LENGTH_PREFIX + last.length as usize;
        assert_eq!(end, bytes.len());
        assert!(layout.block_offset(&template.leaf_slots()[0]) > 0);
    }

    #[test]
    fn test_window_covers_exactly_the_looked_up_leaves() {
        let t = tree(200);
        let (bytes, template) = chunk_of(&t);
        let layout = ChunkLayout::from_prefix(&bytes).unwrap();

        for (a, b) in [(0.0, 100.0), (10.0, 20.0), (55.5, 56.5), (99.0, 99.0)] {
            let range = KeyRange::new(a, b);
            let slots = template.leaf_slots_overlapping(&range);
            let expected = t.range_lookup(&range);
            assert_eq!(slots.len(), expected.len());

            let window = layout.window(&slots).unwrap();
            let buf = &bytes[window.start as usize..window.start as usize + window.len];
            for (slot, leaf) in slots.iter().zip(expected) {
                let body = window.leaf_bytes(buf, slot).unwrap();
                assert_eq!(&LeafNode::decode(body).unwrap(), leaf);
            }
        }
    }

    #[test]
    fn test_window_detects_length_mismatch() {
        let t = tree(40);
        let (mut bytes, template) = chunk_of(&t);
        let layout = ChunkLayout::from_prefix(&bytes).unwrap();
        let slot = template.leaf_slots()[0];

        let at = layout.block_offset(&slot) as usize;
        bytes[at] = bytes[at].wrapping_add(1);

        let window = layout.window(&[slot]).unwrap();
        let buf = &bytes[window.start as usize..window.start as usize + window.len];
        assert!(window.leaf_bytes(buf, &slot).unwrap_err().is_corruption());
    }

    #[test]
    fn test_load_tree_from_file() {
        let t = tree(150);
        let (bytes, _) = chunk_of(&t);
        let fs = FileSystemHandler::memory();
        fs.write_chunk("chunk-0", &bytes).unwrap();

        let mut file = fs.open_for_read("chunk-0").unwrap();
        let restored = load_tree(&mut file).unwrap();
        assert_eq!(restored.len(), t.len());
        let a: Vec<_> = restored.entries().collect();
        let b: Vec<_> = t.entries().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_empty_tree() {
        let t = BTree::new(4);
        let (bytes, _) = chunk_of(&t);
        let fs = FileSystemHandler::memory();
        fs.write_chunk("empty", &bytes).unwrap();

        let restored = load_tree(&mut fs.open_for_read("empty").unwrap()).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn test_truncated_chunk_is_corruption() {
        let (bytes, _) = chunk_of(&tree(50));
        let fs = FileSystemHandler::memory();
        fs.write_chunk("short", &bytes[..bytes.len() - 10]).unwrap();

        let err = load_tree(&mut fs.open_for_read("short").unwrap()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_empty_window() {
        assert!(ChunkLayout::new(10).window(&[]).is_none());
    }
}
