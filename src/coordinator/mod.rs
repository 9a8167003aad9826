//! Partition coordination
//!
//! - **histogram**: per-interval load counts
//! - **partition**: the interval to partition map
//! - **repartition**: load-equalizing plans
//! - **catalog**: sealed chunk registry and query decomposition
//! - **dispatcher**: key routing and load sampling on the dispatch side
//! - **server**: the coordinator itself, its messages and statistics timer

pub mod catalog;
pub mod dispatcher;
pub mod error;
pub mod histogram;
pub mod partition;
pub mod repartition;
pub mod server;

pub use catalog::ChunkCatalog;
pub use dispatcher::KeyDispatcher;
pub use error::{CoordinatorError, CoordinatorResult};
pub use histogram::Histogram;
pub use partition::{PartitionId, PartitionMap};
pub use repartition::RepartitionManager;
pub use server::{
    CoordinatorEvent, CoordinatorMessage, DispatcherId, IgnoreReason, PartitionCoordinator,
    PartitionStatus, ReportOutcome, SkewEvaluation, StatisticsReport,
};
