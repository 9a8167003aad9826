//! Query executor
//!
//! Single-consumer scan pipeline with bounded admission:
//!
//! ```text
//! submit() ──▶ [admission queue, bounded] ──▶ worker ──▶ [result slot, 1] ──▶ next_result()
//!                                               ▲                                   │
//!                                               └────── gate (1 permit) ◀── acknowledge()
//! ```
//!
//! The worker takes a gate permit before each dequeue and never returns it;
//! only `acknowledge()` adds one back. At most one sub-query is in flight,
//! and a slow consumer eventually fills the admission queue, which blocks
//! `submit()`.

use crate::cache::{BlockCache, CacheStats, SharedBlockCache};
use crate::config::QueryConfig;
use crate::query::error::{QueryError, QueryResult};
use crate::query::scanner::{ChunkScanner, SubQueryResult};
use crate::query::subquery::SubQuery;
use crate::storage::filesystem::FileSystemHandler;
use crate::storage::tuple::DataSchema;
use std::sync::{Arc, PoisonError};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

pub struct QueryExecutor {
    sender: Option<mpsc::Sender<SubQuery>>,
    results: mpsc::Receiver<QueryResult<SubQueryResult>>,
    gate: Arc<Semaphore>,
    awaiting_ack: bool,
    scanner: Arc<ChunkScanner>,
    handle: Option<JoinHandle<Vec<SubQuery>>>,
}

impl QueryExecutor {
    /// Start an executor with its own block cache
    pub fn start(config: QueryConfig, fs: FileSystemHandler, schema: DataSchema) -> Self {
        let cache = BlockCache::shared(config.cache_capacity);
        Self::with_cache(config, fs, schema, cache)
    }

    /// Start an executor over a cache that other executors may share
    pub fn with_cache(
        config: QueryConfig,
        fs: FileSystemHandler,
        schema: DataSchema,
        cache: SharedBlockCache,
    ) -> Self {
        let (sender, queue) = mpsc::channel(config.subquery_queue_capacity.max(1));
        let (result_tx, results) = mpsc::channel(1);
        let gate = Arc::new(Semaphore::new(1));
        let scanner = Arc::new(ChunkScanner::new(fs, cache, schema));

        let handle = tokio::spawn(run(scanner.clone(), queue, gate.clone(), result_tx));

        tracing::debug!(
            queue_capacity = config.subquery_queue_capacity,
            cache_capacity = config.cache_capacity,
            "Query executor started"
        );

        Self {
            sender: Some(sender),
            results,
            gate,
            awaiting_ack: false,
            scanner,
            handle: Some(handle),
        }
    }

    /// Admit a sub-query; waits while the admission queue is full
    pub async fn submit(&self, sub: SubQuery) -> QueryResult<()> {
        let sender = self.sender.as_ref().ok_or(QueryError::Closed)?;
        sender.send(sub).await.map_err(|_| QueryError::Closed)
    }

    /// Wait for the next sub-query outcome, in admission order.
    ///
    /// The worker stays parked until `acknowledge()` is called.
    pub async fn next_result(&mut self) -> QueryResult<SubQueryResult> {
        match self.results.recv().await {
            Some(outcome) => {
                self.awaiting_ack = true;
                outcome
            }
            None => Err(QueryError::Closed),
        }
    }

    /// Release the worker to pick up the next sub-query
    pub fn acknowledge(&mut self) {
        if self.awaiting_ack {
            self.awaiting_ack = false;
            self.gate.add_permits(1);
        }
    }

    /// Submit one sub-query and wait for its outcome
    pub async fn execute(&mut self, sub: SubQuery) -> QueryResult<SubQueryResult> {
        self.submit(sub).await?;
        let outcome = self.next_result().await;
        self.acknowledge();
        outcome
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.scanner
            .cache()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats()
    }

    /// Stop admitting sub-queries and wait for the worker to exit.
    ///
    /// Returns every outcome the caller has not received yet, in admission
    /// order: a finished result still waiting in the result slot, then a
    /// `Cancelled` error for each sub-query that was never scanned.
    pub async fn shutdown(mut self) -> Vec<QueryResult<SubQueryResult>> {
        self.sender = None;
        self.gate.close();

        let mut undelivered = Vec::new();
        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(pending) => {
                    while let Ok(outcome) = self.results.try_recv() {
                        undelivered.push(outcome);
                    }
                    undelivered.extend(pending.into_iter().map(|sub| {
                        Err(QueryError::Cancelled {
                            query_id: sub.query_id,
                            file: sub.file_name,
                        })
                    }));
                }
                Err(e) => tracing::warn!(error = %e, "Query worker ended abnormally"),
            }
        }
        self.results.close();

        tracing::debug!(cancelled = undelivered.len(), "Query executor stopped");
        undelivered
    }
}

impl Drop for QueryExecutor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Scan sub-queries until the gate closes; returns the ones left unscanned
async fn run(
    scanner: Arc<ChunkScanner>,
    mut queue: mpsc::Receiver<SubQuery>,
    gate: Arc<Semaphore>,
    results: mpsc::Sender<QueryResult<SubQueryResult>>,
) -> Vec<SubQuery> {
    loop {
        match gate.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => break,
        }
        let Some(sub) = queue.recv().await else {
            break;
        };

        let query_id = sub.query_id;
        let file = sub.file_name.clone();
        let scan = scanner.clone();
        let outcome = match tokio::task::spawn_blocking(move || scan.scan(&sub)).await {
            Ok(outcome) => outcome,
            Err(e) => Err(QueryError::Internal {
                query_id,
                reason: e.to_string(),
            }),
        };

        match &outcome {
            Ok(result) => tracing::debug!(
                query_id,
                file = %file,
                tuples = result.tuples.len(),
                total_us = result.metrics.total_us,
                "Sub-query completed"
            ),
            Err(e) if e.is_corruption() => {
                tracing::error!(query_id, file = %file, error = %e, "Chunk is corrupt")
            }
            Err(e) => tracing::warn!(query_id, file = %file, error = %e, "Sub-query failed"),
        }

        if results.send(outcome).await.is_err() {
            break;
        }
    }

    queue.close();
    let mut pending = Vec::new();
    while let Ok(sub) = queue.try_recv() {
        pending.push(sub);
    }
    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::ingest::IndexBuilder;
    use crate::query::subquery::{Operator, Predicate};
    use crate::storage::filesystem::MemoryFileSystem;
    use crate::storage::tuple::{DataTuple, FieldType, FieldValue};
    use crate::storage::types::{KeyRange, TimestampRange};
    use std::time::Duration;
    use tokio::time::timeout;

    fn schema() -> DataSchema {
        DataSchema::new("key", "ts")
            .field("key", FieldType::Double)
            .field("ts", FieldType::Int)
            .field("sensor", FieldType::Text)
    }

    fn tuple(key: f64, ts: i64, sensor: &str) -> DataTuple {
        DataTuple::new(vec![
            FieldValue::Double(key),
            FieldValue::Int(ts),
            FieldValue::Text(sensor.into()),
        ])
    }

    fn keys(result: &SubQueryResult) -> Vec<f64> {
        let schema = schema();
        result
            .tuples
            .iter()
            .map(|b| {
                let t = schema.deserialize_tuple(b).unwrap();
                schema.index_value(&t).unwrap().0
            })
            .collect()
    }

    async fn sealed_chunk(fs: &FileSystemHandler, tuples: &[DataTuple], threshold: usize) -> String {
        let config = IndexConfig {
            btree_order: 4,
            chunk_tuple_threshold: threshold,
            ..IndexConfig::default()
        };
        let mut builder = IndexBuilder::new(config, schema(), fs.clone(), "exec");
        for t in tuples {
            builder.ingest(t).await.unwrap();
        }
        let sealed = builder.flush().await.unwrap().unwrap();
        builder.shutdown().await.unwrap();
        sealed.metadata.file_name
    }

    fn query_config(queue: usize) -> QueryConfig {
        QueryConfig {
            cache_capacity: 64,
            subquery_queue_capacity: queue,
        }
    }

    #[tokio::test]
    async fn test_scenario_five_keys() {
        let fs = FileSystemHandler::memory();
        let tuples: Vec<_> = [5.0, 1.0, 9.0, 3.0, 7.0]
            .iter()
            .map(|k| tuple(*k, 10, "a"))
            .collect();
        let file = sealed_chunk(&fs, &tuples, 5).await;

        let mut executor = QueryExecutor::start(query_config(4), fs, schema());
        let result = executor
            .execute(SubQuery::new(42, file.clone(), KeyRange::new(2.0, 8.0)))
            .await
            .unwrap();

        assert_eq!(result.query_id, 42);
        assert_eq!(result.file_name, file);
        assert_eq!(keys(&result), vec![3.0, 5.0, 7.0]);
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_filters_on_timestamp_and_predicate() {
        let fs = FileSystemHandler::memory();
        let tuples: Vec<_> = (0..40)
            .map(|i| tuple(i as f64, 100 + i, if i % 3 == 0 { "north" } else { "south" }))
            .collect();
        let file = sealed_chunk(&fs, &tuples, 100).await;

        let mut executor = QueryExecutor::start(query_config(4), fs, schema());
        let sub = SubQuery::new(1, file, KeyRange::new(0.0, 39.0))
            .with_timestamps(TimestampRange::new(110, 130))
            .with_predicate(Predicate::new().text("sensor", Operator::Eq, "north"));
        let result = executor.execute(sub).await.unwrap();

        assert_eq!(keys(&result), vec![12.0, 15.0, 18.0, 21.0, 24.0, 27.0, 30.0]);
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeat_query_hits_cache() {
        let fs = FileSystemHandler::memory();
        let tuples: Vec<_> = (0..50).map(|i| tuple(i as f64, i, "a")).collect();
        let file = sealed_chunk(&fs, &tuples, 100).await;

        let mut executor = QueryExecutor::start(query_config(4), fs, schema());
        let sub = SubQuery::new(7, file, KeyRange::new(10.0, 20.0));
        let first = executor.execute(sub.clone()).await.unwrap();
        let misses = executor.cache_stats().misses;
        let second = executor.execute(sub).await.unwrap();

        assert_eq!(first.tuples, second.tuples);
        assert!(second.metrics.template_cached);
        assert_eq!(second.metrics.leaves_read, 0);
        let stats = executor.cache_stats();
        assert_eq!(stats.misses, misses);
        assert!(stats.hits > 0);
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_results_follow_admission_order() {
        let fs = FileSystemHandler::memory();
        let tuples: Vec<_> = (0..20).map(|i| tuple(i as f64, i, "a")).collect();
        let file = sealed_chunk(&fs, &tuples, 100).await;

        let mut executor = QueryExecutor::start(query_config(8), fs, schema());
        for id in 0..3u64 {
            let low = id as f64 * 5.0;
            executor
                .submit(SubQuery::new(id, file.clone(), KeyRange::new(low, low + 1.0)))
                .await
                .unwrap();
        }
        for id in 0..3u64 {
            let result = executor.next_result().await.unwrap();
            assert_eq!(result.query_id, id);
            assert_eq!(keys(&result), vec![id as f64 * 5.0, id as f64 * 5.0 + 1.0]);
            executor.acknowledge();
        }
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unacknowledged_result_applies_backpressure() {
        let fs = FileSystemHandler::memory();
        let tuples: Vec<_> = (0..10).map(|i| tuple(i as f64, i, "a")).collect();
        let file = sealed_chunk(&fs, &tuples, 100).await;
        let sub = |id| SubQuery::new(id, file.clone(), KeyRange::full());

        let mut executor = QueryExecutor::start(query_config(2), fs, schema());
        executor.submit(sub(0)).await.unwrap();
        assert_eq!(executor.next_result().await.unwrap().query_id, 0);

        // The worker is parked on the gate, so the queue fills up
        executor.submit(sub(1)).await.unwrap();
        executor.submit(sub(2)).await.unwrap();
        let blocked = timeout(Duration::from_millis(100), executor.submit(sub(3))).await;
        assert!(blocked.is_err());

        executor.acknowledge();
        timeout(Duration::from_secs(5), executor.submit(sub(3)))
            .await
            .expect("queue drained after acknowledge")
            .unwrap();

        for id in 1..=3 {
            assert_eq!(executor.next_result().await.unwrap().query_id, id);
            executor.acknowledge();
        }
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_files_are_distinct() {
        let memory = MemoryFileSystem::default();
        let fs = FileSystemHandler::Memory(memory.clone());
        let tuples: Vec<_> = (0..30).map(|i| tuple(i as f64, i, "a")).collect();
        let file = sealed_chunk(&fs, &tuples, 100).await;

        let mut bytes = fs.open_for_read(&file).unwrap().read_all().unwrap();
        let mid = bytes.len() - 8;
        bytes[mid] ^= 0x5a;
        memory.overwrite(&file, bytes).unwrap();

        let mut executor = QueryExecutor::start(query_config(4), fs, schema());

        let missing = executor
            .execute(SubQuery::new(11, "absent", KeyRange::full()))
            .await
            .unwrap_err();
        assert!(matches!(missing, QueryError::FileNotFound { query_id: 11, .. }));
        assert!(!missing.is_corruption());

        let corrupt = executor
            .execute(SubQuery::new(12, file, KeyRange::full()))
            .await
            .unwrap_err();
        assert!(corrupt.is_corruption());
        assert_eq!(corrupt.query_id(), Some(12));

        // A failed sub-query does not wedge the pipeline
        let again = executor
            .execute(SubQuery::new(13, "absent", KeyRange::full()))
            .await
            .unwrap_err();
        assert_eq!(again.query_id(), Some(13));
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_chunk_on_local_disk() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystemHandler::local(dir.path()).unwrap();
        let tuples: Vec<_> = (0..25).map(|i| tuple(i as f64 * 2.0, i, "a")).collect();
        let file = sealed_chunk(&fs, &tuples, 100).await;

        let mut executor = QueryExecutor::start(query_config(4), fs, schema());
        let result = executor
            .execute(SubQuery::new(5, file, KeyRange::new(9.0, 15.0)))
            .await
            .unwrap();
        assert_eq!(keys(&result), vec![10.0, 12.0, 14.0]);
        assert!(result.metrics.bytes_read > 0);
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_reports_queued_subqueries() {
        let fs = FileSystemHandler::memory();
        let tuples: Vec<_> = (0..10).map(|i| tuple(i as f64, i, "a")).collect();
        let file = sealed_chunk(&fs, &tuples, 100).await;
        let sub = |id| SubQuery::new(id, file.clone(), KeyRange::full());

        let mut executor = QueryExecutor::start(query_config(4), fs, schema());
        executor.submit(sub(0)).await.unwrap();
        assert_eq!(executor.next_result().await.unwrap().query_id, 0);

        // Parked behind the unacknowledged result
        executor.submit(sub(1)).await.unwrap();
        executor.submit(sub(2)).await.unwrap();

        let undelivered = executor.shutdown().await;
        assert_eq!(undelivered.len(), 2);
        for (outcome, id) in undelivered.into_iter().zip([1, 2]) {
            let err = outcome.unwrap_err();
            assert!(matches!(err, QueryError::Cancelled { .. }));
            assert_eq!(err.query_id(), Some(id));
            assert!(err.to_string().contains(&file));
        }
    }

    #[tokio::test]
    async fn test_shutdown_of_idle_executor_reports_nothing() {
        let mut executor = QueryExecutor::start(query_config(4), FileSystemHandler::memory(), schema());
        let missing = executor
            .execute(SubQuery::new(1, "absent", KeyRange::full()))
            .await;
        assert!(missing.is_err());
        assert!(executor.shutdown().await.is_empty());
    }

    #[tokio::test]
    async fn test_closed_executor_rejects_subqueries() {
        let mut executor = QueryExecutor::start(query_config(1), FileSystemHandler::memory(), schema());
        executor.sender = None;
        let err = executor
            .execute(SubQuery::new(1, "x", KeyRange::full()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Closed));
    }
}
