//! Tree templates
//!
//! A template is the shape of a sealed tree with the payload stripped out:
//! separator keys, child references and, in place of each leaf, a `LeafSlot`
//! saying where the leaf's bytes live in the chunk and which keys it spans.
//! Given a key range, the template alone is enough to compute which leaf
//! blocks must be read.
//!
//! Wire format:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ magic: [u8; 4] = "CDXT"                      │
//! │ version: u8 = 1                              │
//! │ order: u32                                   │
//! │ tuple_count: u64                             │
//! │ node_count: u32                              │
//! │ root: u32                                    │
//! │ nodes (node_count times):                    │
//! │   tag 0 (internal):                          │
//! │     key_count: u32, keys: [f64],             │
//! │     children: [u32; key_count + 1]           │
//! │   tag 1 (leaf slot):                         │
//! │     offset: u32, length: u32,                │
//! │     entry_count: u32, min: f64, max: f64     │
//! │ checksum: u32 (crc32 of the above)           │
//! └──────────────────────────────────────────────┘
//! ```

use crate::btree::codec::{ByteReader, ByteWriter};
use crate::btree::node::{InternalNode, NodeId};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{IndexKey, KeyRange};
use serde::Serialize;

const TEMPLATE_MAGIC: [u8; 4] = *b"CDXT";

/// Current template format version
pub const TEMPLATE_VERSION: u8 = 1;

const TAG_INTERNAL: u8 = 0;
const TAG_LEAF: u8 = 1;

/// Encoded size of a leaf slot including its tag
pub const LEAF_SLOT_SIZE: usize = 1 + 4 + 4 + 4 + 8 + 8;

/// Location and key span of one serialized leaf
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LeafSlot {
    /// Offset of the leaf's length prefix, relative to the start of the leaf section
    pub offset: u32,
    /// Length of the leaf bytes, excluding the length prefix
    pub length: u32,
    /// Number of entries in the leaf
    pub entry_count: u32,
    pub min_key: IndexKey,
    pub max_key: IndexKey,
}

impl LeafSlot {
    /// True if the leaf holds keys and its span intersects `range`
    pub fn overlaps(&self, range: &KeyRange) -> bool {
        self.entry_count > 0 && self.min_key <= range.high && self.max_key >= range.low
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateNode {
    Internal(InternalNode),
    Leaf(LeafSlot),
}

/// Payload-free tree shape of a sealed chunk
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    order: usize,
    tuple_count: u64,
    nodes: Vec<TemplateNode>,
    root: NodeId,
}

/// Summary used by diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct TemplateSummary {
    pub order: usize,
    pub tuple_count: u64,
    pub depth: usize,
    pub internal_nodes: usize,
    pub leaves: Vec<LeafSlot>,
}

impl Template {
    pub(crate) fn from_parts(
        order: usize,
        tuple_count: u64,
        nodes: Vec<TemplateNode>,
        root: NodeId,
    ) -> Self {
        Self {
            order,
            tuple_count,
            nodes,
            root,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn tuple_count(&self) -> u64 {
        self.tuple_count
    }

    pub(crate) fn nodes(&self) -> &[TemplateNode] {
        &self.nodes
    }

    pub(crate) fn root(&self) -> NodeId {
        self.root
    }

    /// Node ids of the leaf slots in key (and storage) order
    pub(crate) fn leaf_ids(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            match &self.nodes[id as usize] {
                TemplateNode::Internal(node) => stack.extend(node.children.iter().rev()),
                TemplateNode::Leaf(_) => out.push(id),
            }
        }
        out
    }

    /// All leaf slots in storage order
    pub fn leaf_slots(&self) -> Vec<LeafSlot> {
        self.leaf_ids()
            .into_iter()
            .filter_map(|id| match &self.nodes[id as usize] {
                TemplateNode::Leaf(slot) => Some(*slot),
                TemplateNode::Internal(_) => None,
            })
            .collect()
    }

    /// Slots of the leaves whose key span intersects `range`, ascending.
    ///
    /// Only subtrees whose separator bounds intersect the range are visited,
    /// so the cost is proportional to the depth plus the number of hits.
    pub fn leaf_slots_overlapping(&self, range: &KeyRange) -> Vec<LeafSlot> {
        let mut out = Vec::new();
        if range.is_empty() {
            return out;
        }

        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            match &self.nodes[id as usize] {
                TemplateNode::Internal(node) => {
                    let hits: Vec<NodeId> = node.children_overlapping(range).collect();
                    stack.extend(hits.into_iter().rev());
                }
                TemplateNode::Leaf(slot) => {
                    if slot.overlaps(range) {
                        out.push(*slot);
                    }
                }
            }
        }
        out
    }

    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut id = self.root;
        while let TemplateNode::Internal(node) = &self.nodes[id as usize] {
            depth += 1;
            id = node.children[0];
        }
        depth
    }

    pub fn summary(&self) -> TemplateSummary {
        TemplateSummary {
            order: self.order,
            tuple_count: self.tuple_count,
            depth: self.depth(),
            internal_nodes: self
                .nodes
                .iter()
                .filter(|n| matches!(n, TemplateNode::Internal(_)))
                .count(),
            leaves: self.leaf_slots(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(32 + self.nodes.len() * LEAF_SLOT_SIZE);
        w.put_bytes(&TEMPLATE_MAGIC);
        w.put_u8(TEMPLATE_VERSION);
        w.put_u32(self.order as u32);
        w.put_u64(self.tuple_count);
        w.put_u32(self.nodes.len() as u32);
        w.put_u32(self.root);

        for node in &self.nodes {
            match node {
                TemplateNode::Internal(internal) => {
                    w.put_u8(TAG_INTERNAL);
                    w.put_u32(internal.keys.len() as u32);
                    for key in &internal.keys {
                        w.put_key(*key);
                    }
                    for child in &internal.children {
                        w.put_u32(*child);
                    }
                }
                TemplateNode::Leaf(slot) => {
                    w.put_u8(TAG_LEAF);
                    w.put_u32(slot.offset);
                    w.put_u32(slot.length);
                    w.put_u32(slot.entry_count);
                    w.put_key(slot.min_key);
                    w.put_key(slot.max_key);
                }
            }
        }

        w.finish_with_checksum()
    }

    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        let mut r = ByteReader::checked(bytes, "template")?;

        let magic = r.get_bytes(4)?;
        if magic != TEMPLATE_MAGIC {
            return Err(StorageError::Corruption(format!(
                "invalid template magic: {:?}",
                magic
            )));
        }

        let version = r.get_u8()?;
        if version != TEMPLATE_VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported template version: {}",
                version
            )));
        }

        let order = r.get_u32()? as usize;
        let tuple_count = r.get_u64()?;
        let node_count = r.get_count(1)?;
        let root = r.get_u32()?;

        let mut nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let node = match r.get_u8()? {
                TAG_INTERNAL => {
                    let key_count = r.get_count(8 + 4)?;
                    let mut keys = Vec::with_capacity(key_count);
                    for _ in 0..key_count {
                        keys.push(r.get_key()?);
                    }
                    let mut children = Vec::with_capacity(key_count + 1);
                    for _ in 0..=key_count {
                        children.push(r.get_u32()?);
                    }
                    TemplateNode::Internal(InternalNode { keys, children })
                }
                TAG_LEAF => TemplateNode::Leaf(LeafSlot {
                    offset: r.get_u32()?,
                    length: r.get_u32()?,
                    entry_count: r.get_u32()?,
                    min_key: r.get_key()?,
                    max_key: r.get_key()?,
                }),
                tag => {
                    return Err(StorageError::Corruption(format!(
                        "unknown template node tag: {}",
                        tag
                    )))
                }
            };
            nodes.push(node);
        }
        r.expect_end()?;

        let template = Self {
            order,
            tuple_count,
            nodes,
            root,
        };
        template.validate()?;
        Ok(template)
    }

    /// Check that the node graph is a tree rooted at `root` covering every node
    fn validate(&self) -> StorageResult<()> {
        let count = self.nodes.len();
        if (self.root as usize) >= count {
            return Err(StorageError::Corruption(format!(
                "template root {} out of range ({} nodes)",
                self.root, count
            )));
        }

        let mut seen = vec![false; count];
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let idx = id as usize;
            if idx >= count || seen[idx] {
                return Err(StorageError::Corruption(format!(
                    "template node {} is out of range or referenced twice",
                    id
                )));
            }
            seen[idx] = true;
            if let TemplateNode::Internal(node) = &self.nodes[idx] {
                stack.extend(node.children.iter().copied());
            }
        }

        if seen.iter().any(|s| !s) {
            return Err(StorageError::Corruption(
                "template contains unreachable nodes".into(),
            ));
        }

        let mut expected = 0u32;
        for slot in self.leaf_slots() {
            if slot.offset != expected {
                return Err(StorageError::Corruption(format!(
                    "leaf slot offset {} breaks contiguity (expected {})",
                    slot.offset, expected
                )));
            }
            expected = slot
                .offset
                .checked_add(4)
                .and_then(|v| v.checked_add(slot.length))
                .ok_or_else(|| StorageError::Corruption("leaf offsets overflow".into()))?;
        }

        Ok(())
    }
}
