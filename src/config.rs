//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides. Each
//! component is handed its own section by value at construction.

use crate::btree::codec::MAX_ADDRESSABLE;
use crate::ingest::TemplatePolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where chunk files live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Files under `data_dir`
    #[default]
    Local,
    /// Process-local map, used by tests and the demo
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(StorageBackend::Local),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!("unknown storage backend: {}", other)),
        }
    }
}

/// Chunk storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub backend: StorageBackend,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("chunkdex").to_string_lossy().to_string())
        .unwrap_or_else(|| "./chunkdex_data".to_string())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: StorageBackend::default(),
        }
    }
}

/// Index builder configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_btree_order")]
    pub btree_order: usize,

    #[serde(default = "default_chunk_tuple_threshold")]
    pub chunk_tuple_threshold: usize,

    #[serde(default = "default_chunk_byte_limit")]
    pub chunk_byte_limit: usize,

    #[serde(default = "default_indexing_workers")]
    pub indexing_workers: usize,

    #[serde(default = "default_ingest_queue_capacity")]
    pub ingest_queue_capacity: usize,

    #[serde(default)]
    pub template_policy: TemplatePolicy,

    /// Leaf splits per 100 tuples above which a reused template is rebuilt
    #[serde(default = "default_rebuild_split_percent")]
    pub rebuild_split_percent: f64,
}

fn default_btree_order() -> usize {
    64
}

fn default_chunk_tuple_threshold() -> usize {
    100_000
}

fn default_chunk_byte_limit() -> usize {
    64 * 1024 * 1024 // 64 MB
}

fn default_indexing_workers() -> usize {
    1
}

fn default_ingest_queue_capacity() -> usize {
    1024
}

fn default_rebuild_split_percent() -> f64 {
    10.0
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            btree_order: default_btree_order(),
            chunk_tuple_threshold: default_chunk_tuple_threshold(),
            chunk_byte_limit: default_chunk_byte_limit(),
            indexing_workers: default_indexing_workers(),
            ingest_queue_capacity: default_ingest_queue_capacity(),
            template_policy: TemplatePolicy::default(),
            rebuild_split_percent: default_rebuild_split_percent(),
        }
    }
}

/// Query executor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Block cache capacity in entries
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default = "default_subquery_queue_capacity")]
    pub subquery_queue_capacity: usize,
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_subquery_queue_capacity() -> usize {
    1024
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            subquery_queue_capacity: default_subquery_queue_capacity(),
        }
    }
}

/// Partition coordinator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_skew_threshold")]
    pub skew_threshold: f64,

    #[serde(default = "default_statistics_period_ms")]
    pub statistics_period_ms: u64,

    #[serde(default = "default_one")]
    pub dispatchers: usize,

    #[serde(default = "default_one")]
    pub partitions: usize,

    #[serde(default = "default_key_lower_bound")]
    pub key_lower_bound: f64,

    #[serde(default = "default_key_upper_bound")]
    pub key_upper_bound: f64,

    /// Number of equal-width key intervals the domain is cut into
    #[serde(default = "default_intervals")]
    pub intervals: usize,
}

fn default_skew_threshold() -> f64 {
    2.0
}

fn default_statistics_period_ms() -> u64 {
    10_000 // 10 seconds
}

fn default_one() -> usize {
    1
}

fn default_key_lower_bound() -> f64 {
    0.0
}

fn default_key_upper_bound() -> f64 {
    1_000_000.0
}

fn default_intervals() -> usize {
    1024
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            skew_threshold: default_skew_threshold(),
            statistics_period_ms: default_statistics_period_ms(),
            dispatchers: default_one(),
            partitions: default_one(),
            key_lower_bound: default_key_lower_bound(),
            key_upper_bound: default_key_upper_bound(),
            intervals: default_intervals(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("chunkdex").join("config.toml")),
            Some(PathBuf::from("/etc/chunkdex/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Storage overrides
        if let Ok(data_dir) = std::env::var("CHUNKDEX_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }
        if let Some(backend) = env_parse("CHUNKDEX_STORAGE_BACKEND") {
            self.storage.backend = backend;
        }

        // Index overrides
        if let Some(order) = env_parse("CHUNKDEX_BTREE_ORDER") {
            self.index.btree_order = order;
        }
        if let Some(threshold) = env_parse("CHUNKDEX_CHUNK_TUPLE_THRESHOLD") {
            self.index.chunk_tuple_threshold = threshold;
        }
        if let Some(limit) = env_parse("CHUNKDEX_CHUNK_BYTE_LIMIT") {
            self.index.chunk_byte_limit = limit;
        }
        if let Some(workers) = env_parse("CHUNKDEX_INDEXING_WORKERS") {
            self.index.indexing_workers = workers;
        }

        // Query overrides
        if let Some(capacity) = env_parse("CHUNKDEX_CACHE_CAPACITY") {
            self.query.cache_capacity = capacity;
        }

        // Coordinator overrides
        if let Some(threshold) = env_parse("CHUNKDEX_SKEW_THRESHOLD") {
            self.coordinator.skew_threshold = threshold;
        }
        if let Some(period) = env_parse("CHUNKDEX_STATISTICS_PERIOD_MS") {
            self.coordinator.statistics_period_ms = period;
        }

        // Logging overrides
        if let Ok(level) = std::env::var("CHUNKDEX_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("CHUNKDEX_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Reject values no component can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.index.chunk_tuple_threshold == 0 {
            return invalid("index.chunk_tuple_threshold must be at least 1");
        }
        if self.index.chunk_byte_limit > MAX_ADDRESSABLE {
            return invalid("index.chunk_byte_limit must fit the u32 offsets of a chunk");
        }
        if self.index.indexing_workers == 0 {
            return invalid("index.indexing_workers must be at least 1");
        }
        if self.index.ingest_queue_capacity == 0 {
            return invalid("index.ingest_queue_capacity must be at least 1");
        }
        if self.query.cache_capacity == 0 {
            return invalid("query.cache_capacity must be at least 1");
        }
        if self.query.subquery_queue_capacity == 0 {
            return invalid("query.subquery_queue_capacity must be at least 1");
        }

        let c = &self.coordinator;
        if c.dispatchers == 0 || c.partitions == 0 {
            return invalid("coordinator.dispatchers and coordinator.partitions must be at least 1");
        }
        // With one interval per partition there is nothing to move
        if c.intervals <= c.partitions {
            return invalid("coordinator.intervals must exceed coordinator.partitions");
        }
        if c.key_lower_bound.is_nan() || c.key_upper_bound.is_nan() || c.key_lower_bound >= c.key_upper_bound {
            return invalid("coordinator.key_lower_bound must be below key_upper_bound");
        }
        if c.statistics_period_ms == 0 {
            return invalid("coordinator.statistics_period_ms must be positive");
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Chunkdex Configuration
#
# Environment variables override these settings:
# - CHUNKDEX_DATA_DIR
# - CHUNKDEX_STORAGE_BACKEND
# - CHUNKDEX_BTREE_ORDER
# - CHUNKDEX_CHUNK_TUPLE_THRESHOLD
# - CHUNKDEX_CHUNK_BYTE_LIMIT
# - CHUNKDEX_INDEXING_WORKERS
# - CHUNKDEX_CACHE_CAPACITY
# - CHUNKDEX_SKEW_THRESHOLD
# - CHUNKDEX_STATISTICS_PERIOD_MS
# - CHUNKDEX_LOG_LEVEL
# - CHUNKDEX_LOG_FORMAT

[storage]
# Directory for chunk files
data_dir = "~/.local/share/chunkdex"

# Backend: local (files under data_dir) or memory
backend = "local"

[index]
# B-tree branching order (max keys per node)
btree_order = 64

# Tuples per chunk before it is sealed
chunk_tuple_threshold = 100000

# Upper bound on a sealed chunk's size (bytes)
chunk_byte_limit = 67108864

# Background workers inserting into the active tree
indexing_workers = 1

# Bounded ingest queue length
ingest_queue_capacity = 1024

# Starting tree of each new chunk: fresh or reuse
template_policy = "fresh"

# Rebuild a reused template when splits exceed this share of tuples (%)
rebuild_split_percent = 10.0

[query]
# Block cache capacity (templates + leaves)
cache_capacity = 1024

# Bounded sub-query admission queue length
subquery_queue_capacity = 1024

[coordinator]
# Repartition when max load exceeds this multiple of the mean
skew_threshold = 2.0

# How often statistics are requested from dispatchers (ms)
statistics_period_ms = 10000

# Upstream dispatchers expected to report each cycle
dispatchers = 1

# Index partitions the key domain is spread over
partitions = 1

# Key domain and its resolution
key_lower_bound = 0.0
key_upper_bound = 1000000.0
intervals = 1024

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/chunkdex/chunkdex.log"
"#
    .to_string()
}
