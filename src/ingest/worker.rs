//! Indexing workers
//!
//! Tuples flow through a bounded channel into a small pool of tokio tasks
//! that insert them, in batches, into the shared active tree:
//!
//! ```text
//! IndexBuilder::ingest ──▶ mpsc (bounded) ──▶ worker 0 ─┐
//!                                        └──▶ worker 1 ─┼─▶ Mutex<BTree>
//!                                        └──▶ worker n ─┘
//! ```
//!
//! `drain` closes the channel and joins every worker, so once it returns
//! every submitted tuple is in the tree and nothing else mutates it.

use crate::btree::tree::BTree;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::IndexKey;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Maximum tuples a worker inserts per lock acquisition
pub const WORKER_BATCH: usize = 256;

/// A tuple reduced to what the tree stores
#[derive(Debug, Clone)]
pub struct IndexedTuple {
    pub key: IndexKey,
    pub payload: Vec<u8>,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<IndexedTuple>>>;

pub struct WorkerPool {
    sender: mpsc::Sender<IndexedTuple>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks on the current tokio runtime
    pub fn start(tree: Arc<Mutex<BTree>>, workers: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|id| tokio::spawn(run_worker(id, receiver.clone(), tree.clone())))
            .collect();

        Self { sender, handles }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Queue a tuple, waiting while the channel is full
    pub async fn submit(&self, tuple: IndexedTuple) -> StorageResult<()> {
        self.sender
            .send(tuple)
            .await
            .map_err(|_| StorageError::Closed("indexing workers have stopped".into()))
    }

    /// Close the queue and wait until every worker has inserted its last batch
    pub async fn drain(self) -> StorageResult<()> {
        drop(self.sender);
        for handle in self.handles {
            handle
                .await
                .map_err(|e| StorageError::Closed(format!("indexing worker failed: {}", e)))?;
        }
        Ok(())
    }
}

async fn run_worker(id: usize, receiver: SharedReceiver, tree: Arc<Mutex<BTree>>) {
    let mut batch = Vec::with_capacity(WORKER_BATCH);
    let mut inserted = 0u64;

    loop {
        let received = {
            let mut rx = receiver.lock().await;
            rx.recv_many(&mut batch, WORKER_BATCH).await
        };
        if received == 0 {
            break;
        }

        let mut tree = tree.lock().unwrap_or_else(PoisonError::into_inner);
        for tuple in batch.drain(..) {
            tree.insert(tuple.key, tuple.payload);
        }
        inserted += received as u64;
    }

    tracing::debug!(worker = id, inserted, "Indexing worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(key: f64) -> IndexedTuple {
        IndexedTuple {
            key: IndexKey(key),
            payload: key.to_le_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_drain_inserts_everything() {
        let tree = Arc::new(Mutex::new(BTree::new(8)));
        let pool = WorkerPool::start(tree.clone(), 3, 16);
        assert_eq!(pool.worker_count(), 3);

        for i in 0..1000 {
            pool.submit(tuple((i % 97) as f64)).await.unwrap();
        }
        pool.drain().await.unwrap();

        let tree = tree.lock().unwrap();
        assert_eq!(tree.len(), 1000);
        let keys: Vec<IndexKey> = tree.entries().map(|(k, _)| k).collect();
        assert!(keys.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_single_worker_keeps_duplicate_order() {
        let tree = Arc::new(Mutex::new(BTree::new(4)));
        let pool = WorkerPool::start(tree.clone(), 1, 4);
        for i in 0..50u8 {
            pool.submit(IndexedTuple {
                key: IndexKey(1.0),
                payload: vec![i],
            })
            .await
            .unwrap();
        }
        pool.drain().await.unwrap();

        let tree = tree.lock().unwrap();
        let found = tree.point_search(IndexKey(1.0));
        let expected: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i]).collect();
        let found: Vec<Vec<u8>> = found.into_iter().map(|p| p.to_vec()).collect();
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn test_empty_pool_drains() {
        let tree = Arc::new(Mutex::new(BTree::new(4)));
        WorkerPool::start(tree.clone(), 2, 4).drain().await.unwrap();
        assert!(tree.lock().unwrap().is_empty());
    }
}
