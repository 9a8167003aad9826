//! Chunk scanner
//!
//! Runs one sub-query against one chunk file:
//!
//! ```text
//! open file
//!   │
//!   ▼
//! template ── cache hit? ──▶ BlockId(file, 0)
//!   │ miss: read [len][template], decode, cache
//!   ▼
//! leaf slots overlapping the key range (from the template alone)
//!   │
//!   ▼
//! all leaves cached? ── yes ──▶ skip the read
//!   │ no
//!   ▼
//! ONE read: first slot's length prefix .. end of last slot
//!   │ decode each missing leaf, cache it at BlockId(file, offset)
//!   ▼
//! keys in range → decode tuple → timestamp + predicate → re-encode
//! ```

use crate::btree::node::LeafNode;
use crate::btree::template::{LeafSlot, Template};
use crate::cache::{CacheEntry, SharedBlockCache};
use crate::query::error::{QueryError, QueryResult};
use crate::query::subquery::{QueryId, SubQuery};
use crate::storage::chunk::{load_template, ChunkLayout};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::filesystem::{ChunkFile, FileSystemHandler};
use crate::storage::tuple::DataSchema;
use crate::storage::types::BlockId;
use serde::Serialize;
use std::sync::{Arc, MutexGuard};
use std::time::Instant;

/// Per-stage timings and counters of one file scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FileScanMetrics {
    pub file_open_us: u64,
    pub template_read_us: u64,
    pub leaf_read_us: u64,
    pub filter_us: u64,
    pub total_us: u64,
    pub template_cached: bool,
    /// Leaves decoded from disk
    pub leaves_read: usize,
    /// Leaves served from the cache
    pub leaves_cached: usize,
    pub bytes_read: u64,
    /// Tuples with keys in range
    pub tuples_examined: usize,
    /// Tuples that also passed the timestamp and predicate filters
    pub tuples_returned: usize,
}

/// Tuples matched in one chunk
#[derive(Debug, Clone, Serialize)]
pub struct SubQueryResult {
    pub query_id: QueryId,
    pub file_name: String,
    /// Encoded tuples in ascending key order
    pub tuples: Vec<Vec<u8>>,
    pub metrics: FileScanMetrics,
}

fn micros(since: Instant) -> u64 {
    since.elapsed().as_micros() as u64
}

pub struct ChunkScanner {
    fs: FileSystemHandler,
    cache: SharedBlockCache,
    schema: DataSchema,
}

impl ChunkScanner {
    pub fn new(fs: FileSystemHandler, cache: SharedBlockCache, schema: DataSchema) -> Self {
        Self { fs, cache, schema }
    }

    pub fn cache(&self) -> &SharedBlockCache {
        &self.cache
    }

    pub fn schema(&self) -> &DataSchema {
        &self.schema
    }

    fn lock_cache(&self) -> StorageResult<MutexGuard<'_, crate::cache::BlockCache>> {
        self.cache
            .lock()
            .map_err(|e| StorageError::Lock(e.to_string()))
    }

    /// Scan one chunk; errors carry the query id and file name
    pub fn scan(&self, sub: &SubQuery) -> QueryResult<SubQueryResult> {
        self.scan_file(sub)
            .map_err(|e| QueryError::from_storage(sub.query_id, &sub.file_name, e))
    }

    fn scan_file(&self, sub: &SubQuery) -> StorageResult<SubQueryResult> {
        let started = Instant::now();
        let mut metrics = FileScanMetrics::default();
        let mut result = SubQueryResult {
            query_id: sub.query_id,
            file_name: sub.file_name.clone(),
            tuples: Vec::new(),
            metrics,
        };
        if sub.key_range.is_empty() || sub.timestamp_range.start > sub.timestamp_range.end {
            return Ok(result);
        }

        let stage = Instant::now();
        let mut file = self.fs.open_for_read(&sub.file_name)?;
        metrics.file_open_us = micros(stage);

        let stage = Instant::now();
        let (layout, template) = self.template(&mut file, &mut metrics)?;
        metrics.template_read_us = micros(stage);

        let stage = Instant::now();
        let slots = template.leaf_slots_overlapping(&sub.key_range);
        let leaves = self.leaves(&mut file, layout, &slots, &mut metrics)?;
        metrics.leaf_read_us = micros(stage);
        file.close();

        let stage = Instant::now();
        for leaf in &leaves {
            for payload in leaf.tuples_within(&sub.key_range) {
                metrics.tuples_examined += 1;
                let tuple = self.schema.deserialize_tuple(payload)?;
                let timestamp = self.schema.timestamp(&tuple)?;
                if sub.accepts(&self.schema, timestamp, &tuple) {
                    result.tuples.push(self.schema.serialize_tuple(&tuple)?);
                }
            }
        }
        metrics.tuples_returned = result.tuples.len();
        metrics.filter_us = micros(stage);

        metrics.total_us = micros(started);
        result.metrics = metrics;

        tracing::debug!(
            query_id = sub.query_id,
            file = %sub.file_name,
            leaves = leaves.len(),
            cached = metrics.leaves_cached,
            returned = metrics.tuples_returned,
            "Sub-query scanned"
        );
        Ok(result)
    }

    fn template(
        &self,
        file: &mut ChunkFile,
        metrics: &mut FileScanMetrics,
    ) -> StorageResult<(ChunkLayout, Arc<Template>)> {
        let id = BlockId::template(file.name());
        if let Some((template, length)) = self.lock_cache()?.get_template(&id) {
            metrics.template_cached = true;
            return Ok((ChunkLayout::new(length), template));
        }

        let (layout, template) = load_template(file)?;
        metrics.bytes_read += layout.leaf_section_start();

        let template = Arc::new(template);
        self.lock_cache()?.put(
            id,
            CacheEntry::Template {
                template: template.clone(),
                length: layout.template_len(),
            },
        );
        Ok((layout, template))
    }

    fn leaves(
        &self,
        file: &mut ChunkFile,
        layout: ChunkLayout,
        slots: &[LeafSlot],
        metrics: &mut FileScanMetrics,
    ) -> StorageResult<Vec<Arc<LeafNode>>> {
        let file_name: Arc<str> = Arc::from(file.name());
        let ids: Vec<BlockId> = slots
            .iter()
            .map(|slot| BlockId::new(file_name.clone(), layout.block_offset(slot)))
            .collect();

        let mut found: Vec<Option<Arc<LeafNode>>> = {
            let mut cache = self.lock_cache()?;
            ids.iter().map(|id| cache.get_leaf(id)).collect()
        };
        metrics.leaves_cached = found.iter().filter(|l| l.is_some()).count();

        if metrics.leaves_cached < slots.len() {
            if let Some(window) = layout.window(slots) {
                let buf = file.read_bytes(window.start, window.len)?;
                metrics.bytes_read += window.len as u64;

                for ((slot, id), entry) in slots.iter().zip(&ids).zip(found.iter_mut()) {
                    if entry.is_some() {
                        continue;
                    }
                    let leaf = LeafNode::decode(window.leaf_bytes(&buf, slot)?)?;
                    if leaf.len() != slot.entry_count as usize {
                        return Err(StorageError::Corruption(format!(
                            "leaf {} has {} entries, template says {}",
                            id,
                            leaf.len(),
                            slot.entry_count
                        )));
                    }
                    let leaf = Arc::new(leaf);
                    self.lock_cache()?
                        .put(id.clone(), CacheEntry::Leaf(leaf.clone()));
                    *entry = Some(leaf);
                    metrics.leaves_read += 1;
                }
            }
        }

        Ok(found.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::tree::BTree;
    use crate::cache::BlockCache;
    use crate::query::subquery::{Operator, Predicate};
    use crate::storage::chunk::ChunkBuffer;
    use crate::storage::filesystem::MemoryFileSystem;
    use crate::storage::tuple::{DataTuple, FieldType, FieldValue};
    use crate::storage::types::{IndexKey, KeyRange, TimestampRange};

    fn schema() -> DataSchema {
        DataSchema::new("key", "ts")
            .field("key", FieldType::Double)
            .field("ts", FieldType::Int)
            .field("tag", FieldType::Text)
    }

    fn tuple(key: f64, ts: i64) -> DataTuple {
        let tag = if (key as i64) % 2 == 0 { "even" } else { "odd" };
        DataTuple::new(vec![
            FieldValue::Double(key),
            FieldValue::Int(ts),
            FieldValue::Text(tag.into()),
        ])
    }

    /// Chunk with keys 0..n, timestamps 1000 + key
    fn setup(n: usize, cache_capacity: usize) -> (ChunkScanner, MemoryFileSystem, Vec<DataTuple>) {
        let schema = schema();
        let mut tree = BTree::new(4);
        let mut tuples = Vec::new();
        for i in (0..n).rev() {
            let t = tuple(i as f64, 1000 + i as i64);
            tree.insert(IndexKey(i as f64), schema.serialize_tuple(&t).unwrap());
            tuples.push(t);
        }
        tuples.reverse();

        let chunk = ChunkBuffer::assemble(
            "chunk-a",
            1 << 20,
            &tree.serialize_template().unwrap(),
            &tree.serialize_leaves().unwrap(),
        )
        .unwrap();

        let memory = MemoryFileSystem::default();
        let fs = FileSystemHandler::Memory(memory.clone());
        fs.write_chunk("chunk-a", chunk.as_bytes()).unwrap();
        let scanner = ChunkScanner::new(fs, BlockCache::shared(cache_capacity), schema);
        (scanner, memory, tuples)
    }

    fn keys(scanner: &ChunkScanner, result: &SubQueryResult) -> Vec<f64> {
        result
            .tuples
            .iter()
            .map(|b| {
                let t = scanner.schema().deserialize_tuple(b).unwrap();
                scanner.schema().index_value(&t).unwrap().0
            })
            .collect()
    }

    #[test]
    fn test_key_range_scan() {
        let (scanner, _, _) = setup(100, 64);
        let sub = SubQuery::new(1, "chunk-a", KeyRange::new(10.0, 25.0));
        let result = scanner.scan(&sub).unwrap();

        let expected: Vec<f64> = (10..=25).map(|k| k as f64).collect();
        assert_eq!(keys(&scanner, &result), expected);
        assert_eq!(result.query_id, 1);
        assert!(!result.metrics.template_cached);
        assert!(result.metrics.leaves_read > 0);
        assert_eq!(result.metrics.tuples_returned, 16);
    }

    #[test]
    fn test_filters_are_exact() {
        let (scanner, _, tuples) = setup(60, 64);
        let sub = SubQuery::new(2, "chunk-a", KeyRange::new(5.0, 50.0))
            .with_timestamps(TimestampRange::new(1010, 1040))
            .with_predicate(Predicate::new().text("tag", Operator::Eq, "even"));
        let result = scanner.scan(&sub).unwrap();

        let schema = schema();
        let expected: Vec<Vec<u8>> = tuples
            .iter()
            .filter(|t| {
                let key = schema.index_value(t).unwrap();
                let ts = schema.timestamp(t).unwrap();
                sub.key_range.contains(key) && sub.accepts(&schema, ts, t)
            })
            .map(|t| schema.serialize_tuple(t).unwrap())
            .collect();
        assert_eq!(result.tuples, expected);
        assert_eq!(keys(&scanner, &result).first(), Some(&10.0));
        assert_eq!(keys(&scanner, &result).last(), Some(&40.0));
        assert_eq!(result.metrics.tuples_examined, 46);
    }

    #[test]
    fn test_second_scan_served_from_cache() {
        let (scanner, _, _) = setup(100, 64);
        let sub = SubQuery::new(3, "chunk-a", KeyRange::new(30.0, 60.0));
        let first = scanner.scan(&sub).unwrap();
        let second = scanner.scan(&sub).unwrap();

        assert_eq!(first.tuples, second.tuples);
        assert!(second.metrics.template_cached);
        assert_eq!(second.metrics.leaves_read, 0);
        assert_eq!(second.metrics.bytes_read, 0);
        assert_eq!(second.metrics.leaves_cached, first.metrics.leaves_read);
    }

    #[test]
    fn test_small_cache_still_correct() {
        let (scanner, _, _) = setup(100, 2);
        for _ in 0..3 {
            let result = scanner
                .scan(&SubQuery::new(4, "chunk-a", KeyRange::full()))
                .unwrap();
            assert_eq!(result.tuples.len(), 100);
        }
        assert!(scanner.cache().lock().unwrap().len() <= 2);
    }

    #[test]
    fn test_empty_ranges() {
        let (scanner, _, _) = setup(20, 8);
        let inverted = SubQuery::new(5, "chunk-a", KeyRange::new(9.0, 3.0));
        assert!(scanner.scan(&inverted).unwrap().tuples.is_empty());

        let outside = SubQuery::new(5, "chunk-a", KeyRange::new(500.0, 600.0));
        let result = scanner.scan(&outside).unwrap();
        assert!(result.tuples.is_empty());
        assert_eq!(result.metrics.leaves_read, 0);
    }

    #[test]
    fn test_missing_file_is_tagged() {
        let (scanner, _, _) = setup(10, 8);
        let err = scanner
            .scan(&SubQuery::new(6, "nope", KeyRange::full()))
            .unwrap_err();
        assert!(matches!(err, QueryError::FileNotFound { query_id: 6, .. }));
    }

    #[test]
    fn test_corrupt_leaf_is_distinct_from_io() {
        let (scanner, memory, _) = setup(50, 8);
        let fs = FileSystemHandler::Memory(memory.clone());
        let mut bytes = fs.open_for_read("chunk-a").unwrap().read_all().unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xff;
        memory.overwrite("chunk-a", bytes).unwrap();

        let err = scanner
            .scan(&SubQuery::new(7, "chunk-a", KeyRange::full()))
            .unwrap_err();
        assert!(err.is_corruption());
        assert!(!err.is_retryable());
        assert_eq!(err.query_id(), Some(7));
    }

    #[test]
    fn test_corrupt_template_is_not_cached() {
        let (scanner, memory, _) = setup(20, 8);
        let fs = FileSystemHandler::Memory(memory.clone());
        let mut bytes = fs.open_for_read("chunk-a").unwrap().read_all().unwrap();
        bytes[6] ^= 0x01;
        memory.overwrite("chunk-a", bytes).unwrap();

        let sub = SubQuery::new(8, "chunk-a", KeyRange::full());
        assert!(scanner.scan(&sub).unwrap_err().is_corruption());
        assert!(scanner.cache().lock().unwrap().is_empty());
    }
}
