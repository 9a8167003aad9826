//! Benchmarks for the chunk index
//!
//! Run with: cargo bench

use chunkdex::btree::{bulk_rebuild, BTree};
use chunkdex::cache::BlockCache;
use chunkdex::config::QueryConfig;
use chunkdex::query::{ChunkScanner, QueryExecutor, SubQuery};
use chunkdex::storage::chunk::ChunkBuffer;
use chunkdex::storage::*;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tempfile::tempdir;

fn schema() -> DataSchema {
    DataSchema::new("key", "ts")
        .field("key", FieldType::Double)
        .field("ts", FieldType::Int)
        .field("tag", FieldType::Text)
}

/// Keys in a scrambled but deterministic order
fn create_test_entries(count: usize) -> Vec<(IndexKey, Vec<u8>)> {
    let schema = schema();
    (0..count)
        .map(|i| {
            let key = ((i * 7919) % count) as f64;
            let tuple = DataTuple::new(vec![
                FieldValue::Double(key),
                FieldValue::Int(i as i64 * 1000),
                FieldValue::Text("bench".into()),
            ]);
            (IndexKey(key), schema.serialize_tuple(&tuple).unwrap())
        })
        .collect()
}

fn build_tree(entries: &[(IndexKey, Vec<u8>)], order: usize) -> BTree {
    let mut tree = BTree::new(order);
    for (key, payload) in entries {
        tree.insert(*key, payload.clone());
    }
    tree
}

fn write_chunk(fs: &FileSystemHandler, name: &str, tree: &BTree) {
    let chunk = ChunkBuffer::assemble(
        name,
        usize::MAX,
        &tree.serialize_template().unwrap(),
        &tree.serialize_leaves().unwrap(),
    )
    .unwrap();
    fs.write_chunk(name, chunk.as_bytes()).unwrap();
}

fn bench_btree(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree");

    for size in [1000, 10000] {
        let entries = create_test_entries(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("insert_{}", size), |b| {
            b.iter(|| build_tree(black_box(&entries), 64))
        });

        let tree = build_tree(&entries, 64);

        group.bench_function(format!("serialize_{}", size), |b| {
            b.iter(|| {
                let template = tree.serialize_template().unwrap();
                let leaves = tree.serialize_leaves().unwrap();
                black_box((template, leaves))
            })
        });

        group.bench_function(format!("bulk_rebuild_{}", size), |b| {
            b.iter(|| bulk_rebuild(black_box(&tree)))
        });

        let range = KeyRange::new(size as f64 * 0.25, size as f64 * 0.5);
        group.bench_function(format!("range_lookup_{}", size), |b| {
            b.iter(|| tree.range_lookup(black_box(&range)).len())
        });
    }

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");

    let dir = tempdir().unwrap();
    let fs = FileSystemHandler::local(dir.path()).unwrap();
    let tree = build_tree(&create_test_entries(10000), 64);
    write_chunk(&fs, "bench-000000", &tree);

    let sub = SubQuery::new(1, "bench-000000", KeyRange::new(2500.0, 3500.0));

    group.bench_function("cold_cache", |b| {
        b.iter(|| {
            // Fresh cache every iteration: template and leaves come from disk
            let scanner = ChunkScanner::new(fs.clone(), BlockCache::shared(1024), schema());
            scanner.scan(black_box(&sub)).unwrap()
        })
    });

    let warm = ChunkScanner::new(fs.clone(), BlockCache::shared(1024), schema());
    warm.scan(&sub).unwrap();
    group.bench_function("warm_cache", |b| {
        b.iter(|| warm.scan(black_box(&sub)).unwrap())
    });

    group.finish();
}

fn bench_executor(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("executor");

    group.bench_function("execute_warm", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let fs = FileSystemHandler::memory();
                let tree = build_tree(&create_test_entries(10000), 64);
                write_chunk(&fs, "bench-000000", &tree);

                let mut executor = QueryExecutor::start(QueryConfig::default(), fs, schema());
                let sub = SubQuery::new(1, "bench-000000", KeyRange::new(100.0, 600.0));
                executor.execute(sub.clone()).await.unwrap();

                let start = std::time::Instant::now();

                for _ in 0..iters {
                    let _ = executor.execute(black_box(sub.clone())).await.unwrap();
                }

                let elapsed = start.elapsed();
                executor.shutdown().await;
                elapsed
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_btree, bench_scan, bench_executor);
criterion_main!(benches);
