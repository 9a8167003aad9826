//! Core data types shared by the index, scan and coordination layers
//!
//! - `IndexKey`: the totally ordered secondary index attribute
//! - `KeyRange` / `TimestampRange`: inclusive query and chunk bounds
//! - `ChunkMetadata`: what a sealed chunk announces about itself
//! - `BlockId`: cache address of a template or leaf inside a chunk file

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// The secondary index attribute
///
/// Wraps an `f64` and orders it with `f64::total_cmp`, so every value
/// (including signed zeros) has a place in the total order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexKey(pub f64);

impl IndexKey {
    pub fn new(value: f64) -> Self {
        Self(value)
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Smallest representable key
    pub const MIN: IndexKey = IndexKey(f64::NEG_INFINITY);

    /// Largest representable key
    pub const MAX: IndexKey = IndexKey(f64::INFINITY);
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl From<f64> for IndexKey {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl From<i64> for IndexKey {
    fn from(value: i64) -> Self {
        Self(value as f64)
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inclusive range of index keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub low: IndexKey,
    pub high: IndexKey,
}

impl KeyRange {
    pub fn new(low: impl Into<IndexKey>, high: impl Into<IndexKey>) -> Self {
        Self {
            low: low.into(),
            high: high.into(),
        }
    }

    /// The whole key space
    pub fn full() -> Self {
        Self {
            low: IndexKey::MIN,
            high: IndexKey::MAX,
        }
    }

    /// True when no key can satisfy the range
    pub fn is_empty(&self) -> bool {
        self.low > self.high
    }

    pub fn contains(&self, key: IndexKey) -> bool {
        self.low <= key && key <= self.high
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.low <= other.high && other.low <= self.high
    }
}

/// An inclusive range of timestamps in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampRange {
    pub start: i64,
    pub end: i64,
}

impl TimestampRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Every timestamp
    pub fn all() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }

    pub fn overlaps(&self, other: &TimestampRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Running min/max tracker used while a chunk accumulates tuples
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    key: Option<KeyRange>,
    time: Option<TimestampRange>,
}

impl Default for Bounds {
    fn default() -> Self {
        Self::new()
    }
}

impl Bounds {
    pub fn new() -> Self {
        Self {
            key: None,
            time: None,
        }
    }

    pub fn observe(&mut self, key: IndexKey, timestamp: i64) {
        self.key = Some(match self.key {
            Some(r) => KeyRange {
                low: r.low.min(key),
                high: r.high.max(key),
            },
            None => KeyRange {
                low: key,
                high: key,
            },
        });
        self.time = Some(match self.time {
            Some(r) => TimestampRange {
                start: r.start.min(timestamp),
                end: r.end.max(timestamp),
            },
            None => TimestampRange {
                start: timestamp,
                end: timestamp,
            },
        });
    }

    pub fn key_range(&self) -> Option<KeyRange> {
        self.key
    }

    pub fn timestamp_range(&self) -> Option<TimestampRange> {
        self.time
    }
}

/// Metadata announced when a chunk is sealed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Unique chunk file name
    pub file_name: String,
    /// Min/max index key in the chunk
    pub key_range: KeyRange,
    /// Min/max timestamp in the chunk
    pub timestamp_range: TimestampRange,
    /// Number of tuples in the chunk
    pub tuple_count: u64,
}

impl ChunkMetadata {
    /// Check whether a query over both ranges has to touch this chunk
    pub fn overlaps(&self, keys: &KeyRange, times: &TimestampRange) -> bool {
        self.key_range.overlaps(keys) && self.timestamp_range.overlaps(times)
    }
}

/// Cache address of a decoded block: offset 0 is the template, any other
/// offset is the absolute file offset of a leaf block's length prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub file_name: Arc<str>,
    pub offset: u64,
}

impl BlockId {
    pub fn new(file_name: impl Into<Arc<str>>, offset: u64) -> Self {
        Self {
            file_name: file_name.into(),
            offset,
        }
    }

    pub fn template(file_name: impl Into<Arc<str>>) -> Self {
        Self::new(file_name, 0)
    }

    pub fn is_template(&self) -> bool {
        self.offset == 0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.file_name, self.offset)
    }
}
