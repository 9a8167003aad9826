//! Index builder
//!
//! Owns the active chunk: an in-memory `BTree` fed by the worker pool, plus
//! the running key/timestamp bounds of everything submitted to it.
//!
//! ```text
//!            tuple arrives
//!                 │
//!   ┌─────────────▼──────────────┐   count ≥ threshold
//!   │        ACCUMULATING        │   or byte budget full
//!   │ submit → workers → BTree   ├───────────────┐
//!   └─────────────▲──────────────┘               │
//!                 │                      ┌───────▼────────┐
//!                 │   fresh/reused tree  │    SEALING     │
//!                 └──────────────────────┤ drain workers  │
//!                                        │ serialize      │
//!                                        │ write chunk    │
//!                                        │ clear payload  │
//!                                        └────────────────┘
//! ```
//!
//! The arriving tuple that triggers a seal becomes the first tuple of the
//! next chunk. A failed write leaves the tree and its payload in place and
//! does not consume the chunk id, so the next seal writes the same data.

use crate::btree::rebuild::bulk_rebuild;
use crate::btree::tree::BTree;
use crate::btree::codec::MAX_ADDRESSABLE;
use crate::config::IndexConfig;
use crate::ingest::worker::{IndexedTuple, WorkerPool};
use crate::storage::chunk::{estimated_entry_size, ChunkBuffer, CHUNK_OVERHEAD_ESTIMATE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::filesystem::FileSystemHandler;
use crate::storage::tuple::{DataSchema, DataTuple};
use crate::storage::types::{Bounds, ChunkMetadata, IndexKey};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// Starting tree of each new chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplatePolicy {
    /// Start from an empty tree
    #[default]
    Fresh,
    /// Keep the previous chunk's shape with its payload cleared
    Reuse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderState {
    Accumulating,
    Sealing,
}

/// Result of a successful seal
#[derive(Debug, Clone, Serialize)]
pub struct SealedChunk {
    pub metadata: ChunkMetadata,
    /// Largest timestamp in the chunk
    pub watermark: i64,
    /// Size of the written chunk
    pub bytes: usize,
    pub leaf_count: usize,
    pub depth: usize,
    /// Leaf splits per 100 tuples while the chunk accumulated
    pub split_percentage: f64,
    /// The next chunk starts from a bulk-rebuilt template
    pub rebuilt_template: bool,
}

/// What happened to one ingested tuple
#[derive(Debug)]
pub enum IngestOutcome {
    Accepted,
    /// The previous chunk was sealed; the tuple opened the next one
    Sealed(SealedChunk),
    /// The tuple was logged and skipped
    Rejected(StorageError),
}

pub struct IndexBuilder {
    config: IndexConfig,
    schema: DataSchema,
    fs: FileSystemHandler,
    file_prefix: String,
    next_chunk_id: u64,
    tree: Arc<Mutex<BTree>>,
    workers: Option<WorkerPool>,
    bounds: Bounds,
    tuple_count: usize,
    estimated_bytes: usize,
    state: BuilderState,
    chunks_sealed: u64,
    tuples_rejected: u64,
}

impl IndexBuilder {
    /// Create a builder and start its workers on the current tokio runtime.
    ///
    /// Chunk files are named `{file_prefix}-{id:06}`; the prefix must be
    /// unique per builder so block ids never collide across builders.
    pub fn new(
        config: IndexConfig,
        schema: DataSchema,
        fs: FileSystemHandler,
        file_prefix: impl Into<String>,
    ) -> Self {
        let tree = Arc::new(Mutex::new(BTree::new(config.btree_order)));
        let workers = WorkerPool::start(
            tree.clone(),
            config.indexing_workers,
            config.ingest_queue_capacity,
        );

        Self {
            config,
            schema,
            fs,
            file_prefix: file_prefix.into(),
            next_chunk_id: 0,
            tree,
            workers: Some(workers),
            bounds: Bounds::new(),
            tuple_count: 0,
            estimated_bytes: CHUNK_OVERHEAD_ESTIMATE,
            state: BuilderState::Accumulating,
            chunks_sealed: 0,
            tuples_rejected: 0,
        }
    }

    pub fn schema(&self) -> &DataSchema {
        &self.schema
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    /// Tuples accepted into the active chunk
    pub fn active_tuple_count(&self) -> usize {
        self.tuple_count
    }

    pub fn chunks_sealed(&self) -> u64 {
        self.chunks_sealed
    }

    pub fn tuples_rejected(&self) -> u64 {
        self.tuples_rejected
    }

    /// Name the next sealed chunk will be written under
    pub fn next_file_name(&self) -> String {
        format!("{}-{:06}", self.file_prefix, self.next_chunk_id)
    }

    fn lock_tree(&self) -> std::sync::MutexGuard<'_, BTree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn restart_workers(&mut self) {
        self.workers = Some(WorkerPool::start(
            self.tree.clone(),
            self.config.indexing_workers,
            self.config.ingest_queue_capacity,
        ));
    }

    async fn stop_workers(&mut self) -> StorageResult<()> {
        match self.workers.take() {
            Some(pool) => pool.drain().await,
            None => Ok(()),
        }
    }

    fn reject(&mut self, error: StorageError) -> IngestOutcome {
        self.tuples_rejected += 1;
        tracing::warn!(error = %error, "Tuple rejected");
        IngestOutcome::Rejected(error)
    }

    /// Accept one tuple, sealing the active chunk first if it is full.
    ///
    /// Malformed or oversized tuples are rejected without affecting the
    /// stream. An `Err` means a seal failed; the tuple was not accepted.
    pub async fn ingest(&mut self, tuple: &DataTuple) -> StorageResult<IngestOutcome> {
        let key = match self.schema.index_value(tuple) {
            Ok(key) => key,
            Err(e) => return Ok(self.reject(e)),
        };
        let timestamp = match self.schema.timestamp(tuple) {
            Ok(ts) => ts,
            Err(e) => return Ok(self.reject(e)),
        };
        let payload = match self.schema.serialize_tuple(tuple) {
            Ok(bytes) => bytes,
            Err(e) => return Ok(self.reject(e)),
        };
        self.ingest_encoded(key, timestamp, payload).await
    }

    /// Accept a tuple that is already encoded
    pub async fn ingest_encoded(
        &mut self,
        key: IndexKey,
        timestamp: i64,
        payload: Vec<u8>,
    ) -> StorageResult<IngestOutcome> {
        if key.0.is_nan() {
            return Ok(self.reject(StorageError::MalformedTuple("index value is NaN".into())));
        }
        let size = estimated_entry_size(payload.len());
        let limit = self.config.chunk_byte_limit;
        if CHUNK_OVERHEAD_ESTIMATE + size > limit {
            return Ok(self.reject(StorageError::CapacityExceeded {
                needed: CHUNK_OVERHEAD_ESTIMATE + size,
                available: limit,
            }));
        }

        let full = self.tuple_count >= self.config.chunk_tuple_threshold
            || self.estimated_bytes + size > limit;

        let mut sealed = None;
        if full && self.tuple_count > 0 {
            sealed = Some(self.seal().await?);
        }
        if self.tuple_count == 0 && self.estimated_bytes + size > limit {
            // The reused template alone leaves no room
            self.discard_template();
        }

        let workers = self
            .workers
            .as_ref()
            .ok_or_else(|| StorageError::Closed("index builder is shut down".into()))?;
        workers.submit(IndexedTuple { key, payload }).await?;

        self.bounds.observe(key, timestamp);
        self.tuple_count += 1;
        self.estimated_bytes += size;

        Ok(match sealed {
            Some(chunk) => IngestOutcome::Sealed(chunk),
            None => IngestOutcome::Accepted,
        })
    }

    /// Seal the active chunk if it holds any tuples
    pub async fn flush(&mut self) -> StorageResult<Option<SealedChunk>> {
        if self.tuple_count == 0 {
            return Ok(None);
        }
        self.seal().await.map(Some)
    }

    /// Payloads in the active (unsealed) chunk stored under `key`
    pub async fn search_active(&mut self, key: IndexKey) -> StorageResult<Vec<Vec<u8>>> {
        // Make every submitted tuple visible first
        self.stop_workers().await?;
        let found = self
            .lock_tree()
            .point_search(key)
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect();
        self.restart_workers();
        Ok(found)
    }

    /// Seal whatever is pending and stop the workers
    pub async fn shutdown(mut self) -> StorageResult<Option<SealedChunk>> {
        let sealed = self.flush().await?;
        self.stop_workers().await?;
        Ok(sealed)
    }

    fn discard_template(&mut self) {
        *self.lock_tree() = BTree::new(self.config.btree_order);
        self.estimated_bytes = CHUNK_OVERHEAD_ESTIMATE;
        tracing::debug!("Dropped reused template that exceeds the chunk byte limit");
    }

    async fn seal(&mut self) -> StorageResult<SealedChunk> {
        self.state = BuilderState::Sealing;
        let result = self.seal_inner().await;
        if result.is_err() {
            self.restart_workers();
        }
        self.state = BuilderState::Accumulating;
        result
    }

    async fn seal_inner(&mut self) -> StorageResult<SealedChunk> {
        // Join, not just signal: nothing may mutate the tree past this point
        self.stop_workers().await?;

        let (Some(key_range), Some(timestamp_range)) =
            (self.bounds.key_range(), self.bounds.timestamp_range())
        else {
            return Err(StorageError::Closed("no tuples to seal".into()));
        };

        let mut file_name = self.next_file_name();
        let (chunk, leaf_count, depth, split_percentage) = {
            let tree = self.lock_tree();
            // Rotation keeps chunks near the byte limit by estimate; a chunk
            // that lands past it is still written, up to the format's cap
            let chunk = ChunkBuffer::assemble(
                file_name.as_str(),
                MAX_ADDRESSABLE,
                &tree.serialize_template()?,
                &tree.serialize_leaves()?,
            )?;
            if chunk.len() > self.config.chunk_byte_limit {
                tracing::warn!(
                    file = %file_name,
                    bytes = chunk.len(),
                    limit = self.config.chunk_byte_limit,
                    "Chunk exceeds the configured byte limit"
                );
            }
            let split_percentage = if tree.is_empty() {
                0.0
            } else {
                tree.split_count() as f64 * 100.0 / tree.len() as f64
            };
            (chunk, tree.leaf_count(), tree.depth(), split_percentage)
        };

        // Names left by an earlier builder with the same prefix are skipped
        loop {
            match self.fs.write_chunk(&file_name, chunk.as_bytes()) {
                Ok(()) => break,
                Err(StorageError::AlreadyExists(_)) => {
                    tracing::warn!(file = %file_name, "Chunk name taken, trying the next id");
                    self.next_chunk_id += 1;
                    file_name = self.next_file_name();
                }
                Err(e) => {
                    tracing::error!(file = %file_name, error = %e, "Failed to write chunk");
                    return Err(e);
                }
            }
        }

        let rebuilt_template = self.prepare_next_tree(split_percentage);

        let metadata = ChunkMetadata {
            file_name: file_name.clone(),
            key_range,
            timestamp_range,
            tuple_count: self.tuple_count as u64,
        };
        let sealed = SealedChunk {
            metadata,
            watermark: timestamp_range.end,
            bytes: chunk.len(),
            leaf_count,
            depth,
            split_percentage,
            rebuilt_template,
        };

        tracing::info!(
            file = %file_name,
            tuples = self.tuple_count,
            bytes = sealed.bytes,
            keys = %format!("[{}, {}]", key_range.low, key_range.high),
            split_percentage,
            "Chunk sealed"
        );

        self.next_chunk_id += 1;
        self.chunks_sealed += 1;
        self.bounds = Bounds::new();
        self.tuple_count = 0;
        self.restart_workers();

        Ok(sealed)
    }

    /// Clear the sealed tree per the template policy; returns true if rebuilt
    fn prepare_next_tree(&mut self, split_percentage: f64) -> bool {
        let order = self.config.btree_order;
        let policy = self.config.template_policy;
        let rebuild_above = self.config.rebuild_split_percent;

        let mut tree = self.lock_tree();
        let rebuilt = match policy {
            TemplatePolicy::Fresh => {
                *tree = BTree::new(order);
                false
            }
            TemplatePolicy::Reuse if split_percentage > rebuild_above => {
                let mut next = bulk_rebuild(&tree);
                next.clear_payload();
                *tree = next;
                true
            }
            TemplatePolicy::Reuse => {
                tree.clear_payload();
                tree.reset_split_count();
                false
            }
        };

        let base = match policy {
            TemplatePolicy::Fresh => Ok(0),
            TemplatePolicy::Reuse => tree.serialized_len(),
        };
        drop(tree);
        match base {
            Ok(base) => self.estimated_bytes = CHUNK_OVERHEAD_ESTIMATE + base,
            Err(e) => {
                tracing::warn!(error = %e, "Reused template is not serializable");
                self.discard_template();
            }
        }
        rebuilt
    }
}
