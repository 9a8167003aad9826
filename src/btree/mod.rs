//! Ordered index
//!
//! An arena-backed B+tree keyed by `IndexKey`, plus the codecs that split a
//! sealed tree into a payload-free template and a flat run of leaf blocks.
//!
//! ```text
//!          BTree (in memory)
//!               │
//!      ┌────────┴─────────┐
//!      ▼                  ▼
//!  Template            Leaf blocks
//!  (shape + slots)     [len][leaf][len][leaf]...
//! ```

pub mod codec;
pub mod node;
pub mod rebuild;
pub mod template;
pub mod tree;

pub use node::{InternalNode, LeafNode, Node, NodeId};
pub use rebuild::{bulk_load, bulk_rebuild};
pub use template::{LeafSlot, Template, TemplateSummary};
pub use tree::BTree;
