//! Ingestion path
//!
//! - **builder**: the per-stream `IndexBuilder` state machine that seals chunks
//! - **worker**: the pool of tasks inserting queued tuples into the active tree

pub mod builder;
pub mod worker;

pub use builder::{BuilderState, IndexBuilder, IngestOutcome, SealedChunk, TemplatePolicy};
pub use worker::{IndexedTuple, WorkerPool};
