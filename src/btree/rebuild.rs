//! Balanced bottom-up rebuild
//!
//! Heavy skew in insertion order leaves a tree with many half-empty leaves
//! and more depth than needed. `bulk_rebuild` reads every entry of a tree in
//! key order and packs it into a fresh tree, one level at a time.
//!
//! ```text
//! level 2:              [ r ]
//!                     /       \
//! level 1:      [ a  b ]     [ c  d ]
//!              /   |   \     /  |   \
//! leaves:    L0   L1   L2  L3   L4   L5   (each ~75% of order)
//! ```

use crate::btree::node::{InternalNode, LeafNode, Node, NodeId};
use crate::btree::tree::{BTree, MIN_ORDER};
use crate::storage::types::IndexKey;

/// Leaves and internal nodes are filled to this share of the order, leaving
/// room for inserts when the rebuilt tree is reused as a template
pub const REBUILD_FILL_PERCENT: usize = 75;

/// Rebuild a balanced tree with the same order from `source`'s entries.
///
/// The source is left untouched.
pub fn bulk_rebuild(source: &BTree) -> BTree {
    let entries: Vec<(IndexKey, Vec<u8>)> = source
        .entries()
        .map(|(key, payload)| (key, payload.to_vec()))
        .collect();
    bulk_load(source.order(), entries)
}

/// Build a tree from entries already sorted by key
pub fn bulk_load(order: usize, entries: Vec<(IndexKey, Vec<u8>)>) -> BTree {
    let order = order.max(MIN_ORDER);
    if entries.is_empty() {
        return BTree::new(order);
    }

    let fill = (order * REBUILD_FILL_PERCENT / 100).max(2);
    let len = entries.len() as u64;
    let mut nodes: Vec<Node> = Vec::new();

    // (node id, smallest key in the subtree)
    let mut level: Vec<(NodeId, IndexKey)> = Vec::new();
    let mut entries = entries.into_iter();
    for size in even_groups(len as usize, fill) {
        let chunk: Vec<(IndexKey, Vec<u8>)> = entries.by_ref().take(size).collect();
        let min = chunk[0].0;
        nodes.push(Node::Leaf(LeafNode::from_entries(chunk)));
        level.push(((nodes.len() - 1) as NodeId, min));
    }

    // An internal node with `fill` keys has `fill + 1` children
    while level.len() > 1 {
        let mut next = Vec::new();
        let mut members = level.into_iter();
        for size in even_groups(members.len(), fill + 1) {
            let group: Vec<(NodeId, IndexKey)> = members.by_ref().take(size).collect();
            let min = group[0].1;
            let node = InternalNode {
                keys: group.iter().skip(1).map(|(_, k)| *k).collect(),
                children: group.iter().map(|(id, _)| *id).collect(),
            };
            nodes.push(Node::Internal(node));
            next.push(((nodes.len() - 1) as NodeId, min));
        }
        level = next;
    }

    let root = level[0].0;
    BTree::from_arena(order, nodes, root, len)
}

/// Split `n` items into the fewest groups of at most `cap`, sizes differing by at most one
fn even_groups(n: usize, cap: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let groups = n.div_ceil(cap);
    let base = n / groups;
    let extra = n % groups;
    (0..groups)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::KeyRange;

    fn skewed_tree(n: usize, order: usize) -> BTree {
        let mut tree = BTree::new(order);
        // Ascending inserts leave every left leaf half full
        for i in 0..n {
            tree.insert(IndexKey(i as f64), (i as u32).to_le_bytes().to_vec());
        }
        tree
    }

    #[test]
    fn test_even_groups() {
        assert_eq!(even_groups(10, 4), vec![4, 3, 3]);
        assert_eq!(even_groups(5, 4), vec![3, 2]);
        assert_eq!(even_groups(4, 4), vec![4]);
        assert!(even_groups(0, 4).is_empty());
    }

    #[test]
    fn test_rebuild_preserves_entries() {
        let source = skewed_tree(1000, 8);
        let rebuilt = bulk_rebuild(&source);

        assert_eq!(rebuilt.len(), source.len());
        assert_eq!(rebuilt.order(), source.order());
        let a: Vec<(IndexKey, Vec<u8>)> = source.entries().map(|(k, p)| (k, p.to_vec())).collect();
        let b: Vec<(IndexKey, Vec<u8>)> = rebuilt.entries().map(|(k, p)| (k, p.to_vec())).collect();
        assert_eq!(a, b);
        // Source untouched
        assert_eq!(source.len(), 1000);
    }

    #[test]
    fn test_rebuild_packs_leaves() {
        let source = skewed_tree(1000, 8);
        let rebuilt = bulk_rebuild(&source);

        assert!(rebuilt.leaf_count() < source.leaf_count());
        assert!(rebuilt.depth() <= source.depth());
        for leaf in rebuilt.leaves() {
            assert!(leaf.len() <= 8);
        }
    }

    #[test]
    fn test_rebuilt_tree_supports_lookup_and_insert() {
        let mut rebuilt = bulk_rebuild(&skewed_tree(300, 4));
        let hits = rebuilt.search_range(&KeyRange::new(10.0, 19.0));
        assert_eq!(hits.len(), 10);

        rebuilt.insert(IndexKey(15.0), b"dup".to_vec());
        assert_eq!(rebuilt.point_search(IndexKey(15.0)).len(), 2);
        assert_eq!(rebuilt.len(), 301);
    }

    #[test]
    fn test_rebuild_empty_and_duplicates() {
        let empty = bulk_rebuild(&BTree::new(4));
        assert!(empty.is_empty());

        let mut dups = BTree::new(3);
        for i in 0..20u8 {
            dups.insert(IndexKey(1.0), vec![i]);
        }
        let rebuilt = bulk_rebuild(&dups);
        let found = rebuilt.point_search(IndexKey(1.0));
        assert_eq!(found.len(), 20);
        assert_eq!(found[7], &[7u8][..]);
    }
}
