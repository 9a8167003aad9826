//! Registry of sealed chunks and range query decomposition

use crate::query::subquery::{RangeQuery, SubQuery};
use crate::storage::types::ChunkMetadata;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct ChunkCatalog {
    chunks: BTreeMap<String, ChunkMetadata>,
}

impl ChunkCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an announced chunk. Returns false if the file was already known.
    pub fn record(&mut self, metadata: ChunkMetadata) -> bool {
        if self.chunks.contains_key(&metadata.file_name) {
            return false;
        }
        self.chunks.insert(metadata.file_name.clone(), metadata);
        true
    }

    pub fn get(&self, file_name: &str) -> Option<&ChunkMetadata> {
        self.chunks.get(file_name)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &ChunkMetadata> {
        self.chunks.values()
    }

    pub fn total_tuples(&self) -> u64 {
        self.chunks.values().map(|c| c.tuple_count).sum()
    }

    /// One sub-query per chunk whose key and timestamp ranges both overlap
    /// the query, ordered by the chunk's lowest key
    pub fn plan(&self, query: &RangeQuery) -> Vec<SubQuery> {
        if query.key_range.is_empty() || query.timestamp_range.start > query.timestamp_range.end {
            return Vec::new();
        }

        let mut candidates: Vec<&ChunkMetadata> = self
            .chunks
            .values()
            .filter(|c| c.overlaps(&query.key_range, &query.timestamp_range))
            .collect();
        candidates.sort_by(|a, b| {
            a.key_range
                .low
                .cmp(&b.key_range.low)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });

        tracing::debug!(
            query_id = query.query_id,
            candidates = candidates.len(),
            chunks = self.chunks.len(),
            "Range query planned"
        );

        candidates
            .into_iter()
            .map(|c| query.for_file(c.file_name.clone()))
            .collect()
    }
}
