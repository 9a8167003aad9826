//! chunkdex CLI
//!
//! - `demo`: ingest synthetic tuples across partitions, rebalance on skew,
//!   then answer range queries from the sealed chunks
//! - `inspect`: dump a chunk file's template as JSON
//! - `config`: print or write the default configuration

use chunkdex::config::{generate_default_config, Config, LoggingConfig, StorageBackend};
use chunkdex::coordinator::{
    CoordinatorEvent, CoordinatorMessage, KeyDispatcher, PartitionCoordinator, ReportOutcome,
};
use chunkdex::ingest::{IndexBuilder, IngestOutcome, SealedChunk};
use chunkdex::query::{QueryExecutor, RangeQuery};
use chunkdex::storage::chunk::{load_template, load_tree};
use chunkdex::storage::{
    DataSchema, DataTuple, FieldType, FieldValue, FileSystemHandler, KeyRange,
};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "chunkdex")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Key-ordered index over append-only chunks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest synthetic tuples, seal chunks and query them back
    Demo {
        /// Number of tuples to ingest
        #[arg(short, long, default_value = "20000")]
        tuples: usize,
        /// Seed for the synthetic key generator
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Keep chunks in memory instead of the data directory
        #[arg(long)]
        memory: bool,
    },

    /// Print a chunk file's template
    Inspect {
        /// Path to the chunk file
        file: PathBuf,
        /// Reattach all leaves and report entry statistics too
        #[arg(long)]
        leaves: bool,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("chunkdex={}", logging.level)));

    let file = match &logging.file {
        Some(path) => Some(std::sync::Mutex::new(
            std::fs::OpenOptions::new().create(true).append(true).open(path)?,
        )),
        None => None,
    };

    let registry = tracing_subscriber::registry().with(filter);
    match (logging.format.as_str(), file) {
        ("json", Some(file)) => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(file))
            .init(),
        ("json", None) => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        (_, Some(file)) => registry
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file))
            .init(),
        (_, None) => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let config = generate_default_config();
        match output {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, &config)?;
                println!("Config written to {:?}", path);
            }
            None => print!("{}", config),
        }
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_tracing(&config.logging)?;

    match cli.command {
        Commands::Demo {
            tuples,
            seed,
            memory,
        } => {
            let mut config = config;
            if memory {
                config.storage.backend = StorageBackend::Memory;
            }
            demo(config, tuples, seed).await?;
        }
        Commands::Inspect { file, leaves } => inspect(&file, leaves)?,
        Commands::Config { .. } => {}
    }

    Ok(())
}

fn demo_schema() -> DataSchema {
    DataSchema::new("key", "ts")
        .field("key", FieldType::Double)
        .field("ts", FieldType::Int)
        .field("sensor", FieldType::Text)
}

/// 80% of keys fall in the lowest tenth of the domain
fn skewed_key(rng: &mut StdRng, lower: f64, upper: f64) -> f64 {
    let high = if rng.random::<f64>() < 0.8 {
        lower + (upper - lower) * 0.1
    } else {
        upper
    };
    rng.random_range(lower..high)
}

/// Deliver coordinator broadcasts to the dispatchers until none are pending
fn pump_events(
    coordinator: &PartitionCoordinator,
    events: &mut broadcast::Receiver<CoordinatorEvent>,
    dispatchers: &mut [KeyDispatcher],
) {
    loop {
        let event = match events.try_recv() {
            Ok(event) => event,
            // Older chunk announcements were dropped; requests are never the oldest
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        };
        for dispatcher in dispatchers.iter_mut() {
            if let Some(report) = dispatcher.on_event(&event) {
                if let ReportOutcome::Evaluated(eval) = coordinator.receive_report(report) {
                    println!(
                        "cycle {}: skew {:.2} over {} tuples{}",
                        eval.cycle,
                        eval.factor,
                        eval.total,
                        if eval.repartitioned { ", repartitioned" } else { "" }
                    );
                }
            }
        }
    }
}

fn announce(coordinator: &PartitionCoordinator, partition: usize, sealed: &SealedChunk) {
    coordinator.handle(CoordinatorMessage::ChunkSealed(sealed.metadata.clone()));
    coordinator.handle(CoordinatorMessage::Watermark {
        partition,
        key_range: sealed.metadata.key_range,
        timestamp_range: sealed.metadata.timestamp_range,
    });
}

async fn demo(config: Config, tuples: usize, seed: u64) -> Result<(), Box<dyn std::error::Error>> {
    let fs = FileSystemHandler::from_config(&config.storage)?;
    let schema = demo_schema();
    let run = chrono::Utc::now().format("%Y%m%d%H%M%S");

    tracing::info!(
        tuples,
        backend = ?config.storage.backend,
        partitions = config.coordinator.partitions,
        "Starting demo"
    );

    let coordinator = PartitionCoordinator::new(config.coordinator.clone());
    let mut events = coordinator.subscribe();
    let mut dispatchers: Vec<KeyDispatcher> = (0..config.coordinator.dispatchers)
        .map(|id| KeyDispatcher::new(id, coordinator.partition_map()))
        .collect();
    let mut builders: Vec<IndexBuilder> = (0..config.coordinator.partitions)
        .map(|p| {
            IndexBuilder::new(
                config.index.clone(),
                schema.clone(),
                fs.clone(),
                format!("demo{}-p{}", run, p),
            )
        })
        .collect();

    let lower = config.coordinator.key_lower_bound;
    let upper = config.coordinator.key_upper_bound;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut keys = Vec::with_capacity(tuples);
    let cycle_every = (tuples / 4).max(1);
    let start = chrono::Utc::now().timestamp_millis();

    for i in 0..tuples {
        let key = skewed_key(&mut rng, lower, upper);
        keys.push(key);
        let tuple = DataTuple::new(vec![
            FieldValue::Double(key),
            FieldValue::Int(start + i as i64),
            FieldValue::Text(format!("sensor-{}", i % 16)),
        ]);

        let dispatcher_count = dispatchers.len();
        let dispatcher = &mut dispatchers[i % dispatcher_count];
        let partition = dispatcher.route(key.into());
        match builders[partition].ingest(&tuple).await? {
            IngestOutcome::Sealed(sealed) => announce(&coordinator, partition, &sealed),
            IngestOutcome::Rejected(e) => tracing::warn!(error = %e, "Tuple rejected"),
            IngestOutcome::Accepted => {}
        }

        if (i + 1) % cycle_every == 0 {
            coordinator.request_statistics();
            pump_events(&coordinator, &mut events, &mut dispatchers);
            coordinator.handle(CoordinatorMessage::EnableRepartition);
        }
    }

    for (partition, builder) in builders.into_iter().enumerate() {
        if let Some(sealed) = builder.shutdown().await? {
            announce(&coordinator, partition, &sealed);
        }
    }
    println!(
        "{} chunks sealed, {} repartitions",
        coordinator.chunk_count(),
        coordinator.repartition_count()
    );

    let mut executor = QueryExecutor::start(config.query.clone(), fs, schema);
    let span = upper - lower;
    let ranges = [
        KeyRange::new(lower, lower + span * 0.01),
        KeyRange::new(lower + span * 0.05, lower + span * 0.2),
        KeyRange::new(lower + span * 0.5, upper),
    ];

    for (id, range) in ranges.iter().enumerate() {
        let query = RangeQuery::new(id as u64, *range);
        let mut found = 0usize;
        let mut bytes_read = 0u64;
        let mut leaves_cached = 0usize;

        for sub in coordinator.plan(&query) {
            let result = executor.execute(sub).await?;
            found += result.tuples.len();
            bytes_read += result.metrics.bytes_read;
            leaves_cached += result.metrics.leaves_cached;
        }

        let expected = keys.iter().filter(|k| range.contains((**k).into())).count();
        println!(
            "query {} [{}, {}]: {} tuples (expected {}), {} bytes read, {} cached leaves",
            id, range.low, range.high, found, expected, bytes_read, leaves_cached
        );
    }

    println!("{}", serde_json::to_string_pretty(&executor.cache_stats())?);
    executor.shutdown().await;
    Ok(())
}

fn inspect(path: &Path, leaves: bool) -> Result<(), Box<dyn std::error::Error>> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let fs = FileSystemHandler::local(dir)?;
    let mut file = fs.open_for_read(&name)?;

    let (layout, template) = load_template(&mut file)?;
    let mut report = serde_json::json!({
        "file": name,
        "bytes": file.len(),
        "template_bytes": layout.template_len(),
        "template": template.summary(),
    });

    if leaves {
        let tree = load_tree(&mut file)?;
        let payload: usize = tree.entries().map(|(_, p)| p.len()).sum();
        report["tree"] = serde_json::json!({
            "entries": tree.len(),
            "leaves": tree.leaf_count(),
            "depth": tree.depth(),
            "payload_bytes": payload,
        });
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
