//! In-memory B+tree keyed by `IndexKey`
//!
//! Nodes are stored in an arena (`Vec<Node>`) and internal nodes refer to
//! their children by index, so cloning a tree is a plain structural copy.
//!
//! Invariants:
//! - keys inside a leaf are sorted; equal keys keep insertion order
//! - every key under child `i` of an internal node lies in
//!   `[keys[i - 1], keys[i]]` (both ends inclusive, because duplicates of a
//!   separator may sit on either side of it)
//! - a node overflows when it holds more than `order` keys

use crate::btree::node::{InternalNode, LeafNode, Node, NodeId};
use crate::btree::template::{LeafSlot, Template, TemplateNode};
use crate::btree::codec::{next_block_offset, to_u32, LENGTH_PREFIX};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{IndexKey, KeyRange};

/// Smallest accepted branching order
pub const MIN_ORDER: usize = 3;

#[derive(Debug, Clone)]
pub struct BTree {
    order: usize,
    nodes: Vec<Node>,
    root: NodeId,
    len: u64,
    splits: u64,
}

impl BTree {
    /// Create an empty tree; orders below `MIN_ORDER` are raised to it
    pub fn new(order: usize) -> Self {
        Self {
            order: order.max(MIN_ORDER),
            nodes: vec![Node::Leaf(LeafNode::new())],
            root: 0,
            len: 0,
            splits: 0,
        }
    }

    pub(crate) fn from_arena(order: usize, nodes: Vec<Node>, root: NodeId, len: u64) -> Self {
        Self {
            order: order.max(MIN_ORDER),
            nodes,
            root,
            len,
            splits: 0,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Number of entries
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Leaf splits since construction or the last `reset_split_count`
    pub fn split_count(&self) -> u64 {
        self.splits
    }

    pub fn reset_split_count(&mut self) {
        self.splits = 0;
    }

    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut id = self.root;
        while let Node::Internal(node) = &self.nodes[id as usize] {
            depth += 1;
            id = node.children[0];
        }
        depth
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_ids().len()
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        (self.nodes.len() - 1) as NodeId
    }

    /// Insert a payload under `key`. Duplicates are kept as distinct entries.
    pub fn insert(&mut self, key: IndexKey, payload: Vec<u8>) {
        let order = self.order;
        let mut path: Vec<(NodeId, usize)> = Vec::new();
        let mut id = self.root;

        while let Node::Internal(node) = &self.nodes[id as usize] {
            let idx = node.child_for_insert(key);
            path.push((id, idx));
            id = node.children[idx];
        }

        let Node::Leaf(leaf) = &mut self.nodes[id as usize] else {
            unreachable!("descent always ends at a leaf");
        };
        leaf.insert(key, payload);
        self.len += 1;
        if leaf.len() <= order {
            return;
        }

        self.splits += 1;
        let (mut separator, mut new_child) = self.split_leaf(id);

        while let Some((parent, idx)) = path.pop() {
            let Node::Internal(node) = &mut self.nodes[parent as usize] else {
                unreachable!("path only records internal nodes");
            };
            node.keys.insert(idx, separator);
            node.children.insert(idx + 1, new_child);
            if node.keys.len() <= order {
                return;
            }
            (separator, new_child) = self.split_internal(parent);
        }

        let old_root = self.root;
        self.root = self.alloc(Node::Internal(InternalNode {
            keys: vec![separator],
            children: vec![old_root, new_child],
        }));
    }

    fn split_leaf(&mut self, id: NodeId) -> (IndexKey, NodeId) {
        let Node::Leaf(leaf) = &mut self.nodes[id as usize] else {
            unreachable!("split_leaf called on an internal node");
        };
        let right = leaf.split_off();
        let separator = right.keys()[0];
        (separator, self.alloc(Node::Leaf(right)))
    }

    fn split_internal(&mut self, id: NodeId) -> (IndexKey, NodeId) {
        let Node::Internal(node) = &mut self.nodes[id as usize] else {
            unreachable!("split_internal called on a leaf");
        };
        let mid = node.keys.len() / 2;
        let right_keys = node.keys.split_off(mid + 1);
        let separator = node.keys.pop().unwrap_or(right_keys[0]);
        let right_children = node.children.split_off(mid + 1);
        let right = InternalNode {
            keys: right_keys,
            children: right_children,
        };
        (separator, self.alloc(Node::Internal(right)))
    }

    /// Leaf node ids in key order
    fn leaf_ids(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            match &self.nodes[id as usize] {
                Node::Internal(node) => stack.extend(node.children.iter().rev()),
                Node::Leaf(_) => out.push(id),
            }
        }
        out
    }

    /// All leaves in key order
    pub fn leaves(&self) -> Vec<&LeafNode> {
        self.leaf_ids()
            .into_iter()
            .filter_map(|id| match &self.nodes[id as usize] {
                Node::Leaf(leaf) => Some(leaf),
                Node::Internal(_) => None,
            })
            .collect()
    }

    /// Every entry in key order
    pub fn entries(&self) -> impl Iterator<Item = (IndexKey, &[u8])> + '_ {
        self.leaves().into_iter().flat_map(LeafNode::entries)
    }

    /// Leaves holding at least one key in `range`, each once, in ascending
    /// key order. The result is contiguous in leaf (storage) order.
    pub fn range_lookup(&self, range: &KeyRange) -> Vec<&LeafNode> {
        let mut out = Vec::new();
        if range.is_empty() {
            return out;
        }

        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            match &self.nodes[id as usize] {
                Node::Internal(node) => {
                    let hits: Vec<NodeId> = node.children_overlapping(range).collect();
                    stack.extend(hits.into_iter().rev());
                }
                Node::Leaf(leaf) => {
                    if leaf.contains_any(range) {
                        out.push(leaf);
                    }
                }
            }
        }
        out
    }

    /// Payloads with keys in `range`, in key order
    pub fn search_range(&self, range: &KeyRange) -> Vec<&[u8]> {
        self.range_lookup(range)
            .into_iter()
            .flat_map(|leaf| leaf.tuples_within(range))
            .collect()
    }

    /// All payloads stored under exactly `key`
    pub fn point_search(&self, key: IndexKey) -> Vec<&[u8]> {
        self.search_range(&KeyRange {
            low: key,
            high: key,
        })
    }

    /// Drop every payload while keeping the tree shape
    pub fn clear_payload(&mut self) {
        for node in &mut self.nodes {
            if let Node::Leaf(leaf) = node {
                leaf.clear();
            }
        }
        self.len = 0;
    }

    /// Slots the leaves will occupy in the leaf section, in storage order.
    ///
    /// Fails with `CapacityExceeded` once an offset no longer fits the u32
    /// the chunk format stores it in.
    fn leaf_slots(&self) -> StorageResult<Vec<(NodeId, LeafSlot)>> {
        let mut offset = 0u32;
        let mut slots = Vec::new();
        for id in self.leaf_ids() {
            let Node::Leaf(leaf) = &self.nodes[id as usize] else {
                continue;
            };
            let length = to_u32(leaf.encoded_len())?;
            slots.push((
                id,
                LeafSlot {
                    offset,
                    length,
                    entry_count: to_u32(leaf.len())?,
                    min_key: leaf.min_key().unwrap_or(IndexKey::MAX),
                    max_key: leaf.max_key().unwrap_or(IndexKey::MIN),
                },
            ));
            offset = next_block_offset(offset, length)?;
        }
        Ok(slots)
    }

    /// Payload-free shape of the tree with leaf locations filled in
    pub fn template(&self) -> StorageResult<Template> {
        let mut slot_of: Vec<Option<LeafSlot>> = vec![None; self.nodes.len()];
        for (id, slot) in self.leaf_slots()? {
            slot_of[id as usize] = Some(slot);
        }

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (node, slot) in self.nodes.iter().zip(slot_of) {
            nodes.push(match (node, slot) {
                (Node::Internal(internal), _) => TemplateNode::Internal(internal.clone()),
                (Node::Leaf(_), Some(slot)) => TemplateNode::Leaf(slot),
                (Node::Leaf(leaf), None) => TemplateNode::Leaf(LeafSlot {
                    offset: 0,
                    length: to_u32(leaf.encoded_len())?,
                    entry_count: 0,
                    min_key: IndexKey::MAX,
                    max_key: IndexKey::MIN,
                }),
            });
        }

        Ok(Template::from_parts(self.order, self.len, nodes, self.root))
    }

    /// Encoded template bytes
    pub fn serialize_template(&self) -> StorageResult<Vec<u8>> {
        Ok(self.template()?.encode())
    }

    /// Leaf section bytes: each leaf as `[u32 length][leaf bytes]`, in key order
    pub fn serialize_leaves(&self) -> StorageResult<Vec<u8>> {
        let leaves = self.leaves();
        let total: usize = leaves
            .iter()
            .map(|l| LENGTH_PREFIX + l.encoded_len())
            .sum();
        to_u32(total)?;
        let mut out = Vec::with_capacity(total);
        for leaf in leaves {
            let bytes = leaf.encode();
            out.extend_from_slice(&to_u32(bytes.len())?.to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    /// Size of the chunk this tree serializes to
    pub fn serialized_len(&self) -> StorageResult<usize> {
        let leaves: usize = self
            .leaves()
            .iter()
            .map(|l| LENGTH_PREFIX + l.encoded_len())
            .sum();
        Ok(LENGTH_PREFIX + self.serialize_template()?.len() + leaves)
    }

    /// Reattach decoded leaves (in storage order) to a template
    pub fn from_template(template: &Template, leaves: Vec<LeafNode>) -> StorageResult<Self> {
        let leaf_ids = template.leaf_ids();
        if leaf_ids.len() != leaves.len() {
            return Err(StorageError::Corruption(format!(
                "template has {} leaf slots but {} leaves were supplied",
                leaf_ids.len(),
                leaves.len()
            )));
        }

        let mut by_node: Vec<Option<LeafNode>> = vec![None; template.nodes().len()];
        for (id, leaf) in leaf_ids.into_iter().zip(leaves) {
            by_node[id as usize] = Some(leaf);
        }

        let mut len = 0u64;
        let mut nodes = Vec::with_capacity(by_node.len());
        for (node, leaf) in template.nodes().iter().zip(by_node) {
            match (node, leaf) {
                (TemplateNode::Internal(internal), _) => {
                    nodes.push(Node::Internal(internal.clone()))
                }
                (TemplateNode::Leaf(slot), Some(leaf)) => {
                    if leaf.len() != slot.entry_count as usize {
                        return Err(StorageError::Corruption(format!(
                            "leaf at offset {} has {} entries, template says {}",
                            slot.offset,
                            leaf.len(),
                            slot.entry_count
                        )));
                    }
                    len += leaf.len() as u64;
                    nodes.push(Node::Leaf(leaf));
                }
                (TemplateNode::Leaf(slot), None) => {
                    return Err(StorageError::Corruption(format!(
                        "no leaf supplied for slot at offset {}",
                        slot.offset
                    )))
                }
            }
        }

        Ok(Self::from_arena(template.order(), nodes, template.root(), len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(key: f64, seq: usize) -> Vec<u8> {
        format!("{}:{}", key, seq).into_bytes()
    }

    fn build(keys: &[f64], order: usize) -> BTree {
        let mut tree = BTree::new(order);
        for (i, k) in keys.iter().enumerate() {
            tree.insert(IndexKey(*k), payload(*k, i));
        }
        tree
    }

    /// Deterministic pseudo-random key sequence
    fn scrambled(n: usize) -> Vec<f64> {
        (0..n).map(|i| ((i * 7919) % 1009) as f64).collect()
    }

    #[test]
    fn test_insert_keeps_sorted_order() {
        let keys = scrambled(500);
        let tree = build(&keys, 4);

        assert_eq!(tree.len(), 500);
        assert!(tree.depth() > 1);
        let collected: Vec<IndexKey> = tree.entries().map(|(k, _)| k).collect();
        let mut expected: Vec<IndexKey> = keys.iter().map(|k| IndexKey(*k)).collect();
        expected.sort();
        assert_eq!(collected, expected);
    }

    #[test]
    fn test_leaves_respect_order() {
        let tree = build(&scrambled(300), 5);
        for leaf in tree.leaves() {
            assert!(leaf.len() <= 5);
        }
        assert!(tree.split_count() > 0);
    }

    #[test]
    fn test_duplicates_preserved() {
        let keys = vec![5.0; 40];
        let tree = build(&keys, 3);
        let found = tree.point_search(IndexKey(5.0));
        assert_eq!(found.len(), 40);
        // Insertion order survives splits
        for (i, p) in found.iter().enumerate() {
            assert_eq!(*p, payload(5.0, i).as_slice());
        }
        assert!(tree.point_search(IndexKey(4.0)).is_empty());
    }

    #[test]
    fn test_range_lookup_exact_leaves() {
        let keys = scrambled(400);
        let tree = build(&keys, 4);
        let all_leaves = tree.leaves();

        for (a, b) in [(0.0, 1008.0), (100.0, 200.0), (17.5, 17.9), (999.0, 2000.0), (-5.0, 0.0)] {
            let range = KeyRange::new(a, b);
            let hits = tree.range_lookup(&range);

            let expected: Vec<&LeafNode> = all_leaves
                .iter()
                .copied()
                .filter(|l| l.contains_any(&range))
                .collect();
            assert_eq!(hits, expected, "range [{}, {}]", a, b);

            // Contiguous in storage order
            if let Some(first) = hits.first() {
                let start = all_leaves
                    .iter()
                    .position(|l| std::ptr::eq(*l, *first))
                    .unwrap();
                for (i, leaf) in hits.iter().enumerate() {
                    assert!(std::ptr::eq(*leaf, all_leaves[start + i]));
                }
            }

            let mut expected_keys: Vec<IndexKey> = keys
                .iter()
                .map(|k| IndexKey(*k))
                .filter(|k| range.contains(*k))
                .collect();
            expected_keys.sort();
            assert_eq!(tree.search_range(&range).len(), expected_keys.len());
        }
    }

    #[test]
    fn test_empty_range_is_empty() {
        let tree = build(&[1.0, 2.0, 3.0], 4);
        assert!(tree.range_lookup(&KeyRange::new(3.0, 1.0)).is_empty());
        assert!(tree.range_lookup(&KeyRange::new(10.0, 20.0)).is_empty());
        assert!(BTree::new(4).range_lookup(&KeyRange::full()).is_empty());
    }

    #[test]
    fn test_clone_is_independent() {
        let original = build(&scrambled(100), 4);
        let mut copy = original.clone();
        copy.insert(IndexKey(5000.0), b"extra".to_vec());
        copy.clear_payload();

        assert_eq!(original.len(), 100);
        assert_eq!(original.entries().count(), 100);
        assert!(copy.is_empty());
    }

    #[test]
    fn test_clear_payload_keeps_shape() {
        let mut tree = build(&scrambled(200), 4);
        let depth = tree.depth();
        let leaves = tree.leaf_count();

        tree.clear_payload();
        assert!(tree.is_empty());
        assert_eq!(tree.depth(), depth);
        assert_eq!(tree.leaf_count(), leaves);
        assert!(tree.search_range(&KeyRange::full()).is_empty());

        // Cleared shape still accepts inserts
        tree.insert(IndexKey(3.0), b"x".to_vec());
        assert_eq!(tree.point_search(IndexKey(3.0)), vec![&b"x"[..]]);
    }

    #[test]
    fn test_serialize_and_reattach_roundtrip() {
        let keys = scrambled(250);
        let tree = build(&keys, 6);

        let template = Template::decode(&tree.serialize_template().unwrap()).unwrap();
        let leaf_bytes = tree.serialize_leaves().unwrap();

        let mut leaves = Vec::new();
        for slot in template.leaf_slots() {
            let start = slot.offset as usize;
            let len = u32::from_le_bytes(leaf_bytes[start..start + 4].try_into().unwrap());
            assert_eq!(len, slot.length);
            let body = &leaf_bytes[start + 4..start + 4 + len as usize];
            leaves.push(LeafNode::decode(body).unwrap());
        }

        let restored = BTree::from_template(&template, leaves).unwrap();
        assert_eq!(restored.len(), tree.len());
        for key in &keys {
            assert_eq!(
                restored.point_search(IndexKey(*key)),
                tree.point_search(IndexKey(*key))
            );
        }
    }

    #[test]
    fn test_from_template_rejects_wrong_leaf_count() {
        let tree = build(&scrambled(50), 4);
        let template = tree.template().unwrap();
        assert!(BTree::from_template(&template, Vec::new())
            .unwrap_err()
            .is_corruption());
    }

    #[test]
    fn test_minimum_order_enforced() {
        let tree = build(&scrambled(30), 1);
        assert_eq!(tree.order(), MIN_ORDER);
        assert_eq!(tree.len(), 30);
    }
}
