//! Partition coordinator
//!
//! Collects per-interval load reports from every dispatcher, evaluates skew
//! once a statistics cycle is complete and, when one interval is hot enough,
//! replaces the partition map and broadcasts it.
//!
//! ```text
//!  timer ──▶ request_statistics() ── StatisticsRequested{cycle} ──▶ dispatchers
//!                                                                      │
//!  receive_report(dispatcher, cycle, histogram) ◀──────────────────────┘
//!     │ merge (once per dispatcher per cycle)
//!     ▼ all dispatchers reported
//!  skew = max bucket / (total / partitions)
//!     │ skew > threshold, enabled, plan differs
//!     ▼
//!  PartitionMapUpdated ──▶ dispatchers      (repartitioning now disabled)
//! ```
//!
//! Sampling and evaluation run on separate cadences: the timer opens cycles,
//! the last report of a cycle closes it.

use crate::config::CoordinatorConfig;
use crate::coordinator::catalog::ChunkCatalog;
use crate::coordinator::histogram::Histogram;
use crate::coordinator::partition::{PartitionId, PartitionMap};
use crate::coordinator::repartition::RepartitionManager;
use crate::query::subquery::{RangeQuery, SubQuery};
use crate::storage::types::{ChunkMetadata, KeyRange, TimestampRange};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub type DispatcherId = usize;

/// Broadcast channel depth
const EVENT_CAPACITY: usize = 256;

/// One dispatcher's load sample for a statistics cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsReport {
    pub dispatcher_id: DispatcherId,
    pub cycle: u64,
    pub histogram: Histogram,
}

/// Inbound messages
#[derive(Debug, Clone)]
pub enum CoordinatorMessage {
    Statistics(StatisticsReport),
    ChunkSealed(ChunkMetadata),
    Watermark {
        partition: PartitionId,
        key_range: KeyRange,
        timestamp_range: TimestampRange,
    },
    EnableRepartition,
}

/// Outbound broadcasts
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    StatisticsRequested {
        cycle: u64,
    },
    PartitionMapUpdated(Arc<PartitionMap>),
    ChunkAnnounced(ChunkMetadata),
    WatermarkAdvanced {
        partition: PartitionId,
        key_range: KeyRange,
        timestamp_range: TimestampRange,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The report's cycle is not the open one
    StaleCycle,
    /// This dispatcher already reported in the open cycle
    Duplicate,
    UnknownDispatcher,
    /// Histogram does not match the interval grid
    IntervalMismatch,
}

/// Result of one completed statistics cycle
#[derive(Debug, Clone, PartialEq)]
pub struct SkewEvaluation {
    pub cycle: u64,
    pub factor: f64,
    pub total: u64,
    pub repartitioned: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Pending { received: usize, expected: usize },
    Evaluated(SkewEvaluation),
    Ignored(IgnoreReason),
}

/// Latest key range and end-timestamp watermark seen from an index partition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartitionStatus {
    pub key_range: KeyRange,
    pub watermark: i64,
}

#[derive(Debug)]
struct CoordinatorState {
    map: Arc<PartitionMap>,
    aggregate: Histogram,
    reporters: HashSet<DispatcherId>,
    cycle: u64,
    cycle_open: bool,
    repartition_enabled: bool,
    sampling: Histogram,
    catalog: ChunkCatalog,
    partitions: HashMap<PartitionId, PartitionStatus>,
    repartitions: u64,
}

pub struct PartitionCoordinator {
    config: CoordinatorConfig,
    manager: RepartitionManager,
    state: Mutex<CoordinatorState>,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl PartitionCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let map = PartitionMap::uniform(
            config.partitions,
            config.intervals,
            config.key_lower_bound,
            config.key_upper_bound,
        );
        let intervals = map.intervals();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            manager: RepartitionManager::new(map.partitions()),
            state: Mutex::new(CoordinatorState {
                map: Arc::new(map),
                aggregate: Histogram::new(intervals),
                reporters: HashSet::new(),
                cycle: 0,
                cycle_open: false,
                repartition_enabled: true,
                sampling: Histogram::new(intervals),
                catalog: ChunkCatalog::new(),
                partitions: HashMap::new(),
                repartitions: 0,
            }),
            events,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: CoordinatorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn partition_map(&self) -> Arc<PartitionMap> {
        self.lock().map.clone()
    }

    pub fn is_repartition_enabled(&self) -> bool {
        self.lock().repartition_enabled
    }

    pub fn current_cycle(&self) -> u64 {
        self.lock().cycle
    }

    pub fn repartition_count(&self) -> u64 {
        self.lock().repartitions
    }

    pub fn partition_status(&self, partition: PartitionId) -> Option<PartitionStatus> {
        self.lock().partitions.get(&partition).copied()
    }

    pub fn chunk_count(&self) -> usize {
        self.lock().catalog.len()
    }

    /// Decompose a range query over the announced chunks
    pub fn plan(&self, query: &RangeQuery) -> Vec<SubQuery> {
        self.lock().catalog.plan(query)
    }

    /// Open a new statistics cycle and ask every dispatcher for its sample.
    ///
    /// An unfinished previous cycle is abandoned.
    pub fn request_statistics(&self) -> u64 {
        let mut state = self.lock();
        if state.cycle_open && !state.reporters.is_empty() {
            tracing::debug!(
                cycle = state.cycle,
                received = state.reporters.len(),
                expected = self.config.dispatchers,
                "Abandoning incomplete statistics cycle"
            );
        }

        let period_secs = self.config.statistics_period_ms as f64 / 1000.0;
        let sampled = state.sampling.total();
        if period_secs > 0.0 {
            tracing::debug!(
                tuples = sampled,
                throughput = sampled as f64 / period_secs,
                "Sampling window closed"
            );
        }
        state.sampling.clear();

        state.cycle += 1;
        state.cycle_open = true;
        state.aggregate.clear();
        state.reporters.clear();
        let cycle = state.cycle;

        tracing::debug!(cycle, "Statistics request sent");
        self.publish(CoordinatorEvent::StatisticsRequested { cycle });
        cycle
    }

    /// Merge one dispatcher's report; the last report of a cycle triggers
    /// skew evaluation. Merge, count and repartition happen under one lock.
    pub fn receive_report(&self, report: StatisticsReport) -> ReportOutcome {
        let mut state = self.lock();

        let reason = if !state.cycle_open || report.cycle != state.cycle {
            Some(IgnoreReason::StaleCycle)
        } else if report.dispatcher_id >= self.config.dispatchers {
            Some(IgnoreReason::UnknownDispatcher)
        } else if report.histogram.len() != state.map.intervals() {
            Some(IgnoreReason::IntervalMismatch)
        } else if state.reporters.contains(&report.dispatcher_id) {
            Some(IgnoreReason::Duplicate)
        } else {
            None
        };
        if let Some(reason) = reason {
            tracing::debug!(
                dispatcher = report.dispatcher_id,
                cycle = report.cycle,
                open_cycle = state.cycle,
                ?reason,
                "Statistics report ignored"
            );
            return ReportOutcome::Ignored(reason);
        }

        state.reporters.insert(report.dispatcher_id);
        state.aggregate.merge(&report.histogram);
        state.sampling.merge(&report.histogram);

        let received = state.reporters.len();
        let expected = self.config.dispatchers;
        if received < expected {
            return ReportOutcome::Pending { received, expected };
        }

        ReportOutcome::Evaluated(self.evaluate(&mut state))
    }

    fn evaluate(&self, state: &mut CoordinatorState) -> SkewEvaluation {
        let factor = state.aggregate.skewness_factor(state.map.partitions());
        let total = state.aggregate.total();
        let mut repartitioned = false;

        if factor > self.config.skew_threshold && state.repartition_enabled {
            let plan = self.manager.plan(state.aggregate.counts());
            if plan.as_slice() != state.map.assignment() {
                match state.map.with_assignment(plan) {
                    Ok(map) => {
                        let map = Arc::new(map);
                        state.map = map.clone();
                        state.repartition_enabled = false;
                        state.repartitions += 1;
                        repartitioned = true;
                        tracing::info!(
                            cycle = state.cycle,
                            factor,
                            total,
                            "Skew detected, partition map replaced"
                        );
                        self.publish(CoordinatorEvent::PartitionMapUpdated(map));
                    }
                    Err(e) => tracing::warn!(error = %e, "Repartition plan rejected"),
                }
            }
        }

        if !repartitioned {
            tracing::info!(
                cycle = state.cycle,
                factor,
                total,
                enabled = state.repartition_enabled,
                "Skew evaluated, partition map unchanged"
            );
        }

        state.aggregate.clear();
        state.reporters.clear();
        state.cycle_open = false;

        SkewEvaluation {
            cycle: state.cycle,
            factor,
            total,
            repartitioned,
        }
    }

    /// Record a sealed chunk and relay it downstream unchanged.
    ///
    /// Every announcement is relayed, repeats included; the catalog keeps
    /// one entry per file. Returns true if the file was new to the catalog.
    pub fn announce_chunk(&self, metadata: ChunkMetadata) -> bool {
        let recorded = self.lock().catalog.record(metadata.clone());
        tracing::debug!(
            file = %metadata.file_name,
            tuples = metadata.tuple_count,
            repeated = !recorded,
            "Chunk announced"
        );
        self.publish(CoordinatorEvent::ChunkAnnounced(metadata));
        recorded
    }

    /// Track an index partition's latest key range and watermark
    pub fn update_watermark(
        &self,
        partition: PartitionId,
        key_range: KeyRange,
        timestamp_range: TimestampRange,
    ) {
        {
            let mut state = self.lock();
            let watermark = state
                .partitions
                .get(&partition)
                .map_or(timestamp_range.end, |s| s.watermark.max(timestamp_range.end));
            state.partitions.insert(
                partition,
                PartitionStatus {
                    key_range,
                    watermark,
                },
            );
        }
        self.publish(CoordinatorEvent::WatermarkAdvanced {
            partition,
            key_range,
            timestamp_range,
        });
    }

    pub fn enable_repartition(&self) {
        self.lock().repartition_enabled = true;
        tracing::debug!("Repartitioning re-enabled");
    }

    /// Apply one inbound message
    pub fn handle(&self, message: CoordinatorMessage) -> Option<ReportOutcome> {
        match message {
            CoordinatorMessage::Statistics(report) => Some(self.receive_report(report)),
            CoordinatorMessage::ChunkSealed(metadata) => {
                self.announce_chunk(metadata);
                None
            }
            CoordinatorMessage::Watermark {
                partition,
                key_range,
                timestamp_range,
            } => {
                self.update_watermark(partition, key_range, timestamp_range);
                None
            }
            CoordinatorMessage::EnableRepartition => {
                self.enable_repartition();
                None
            }
        }
    }

    /// Process inbound messages until every sender is dropped
    pub fn serve(self: &Arc<Self>, mut inbox: mpsc::Receiver<CoordinatorMessage>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                coordinator.handle(message);
            }
            tracing::debug!("Coordinator inbox closed");
        })
    }

    /// Request statistics every `statistics_period_ms`
    pub fn start_statistics_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let period = Duration::from_millis(self.config.statistics_period_ms.max(1));

        tracing::info!(
            period_ms = period.as_millis() as u64,
            "Starting statistics timer"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);

            // Skip the first immediate tick
            ticker.tick().await;

            loop {
                ticker.tick().await;
                coordinator.request_statistics();
            }
        })
    }
}
