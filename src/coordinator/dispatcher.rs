//! Dispatcher side of the partition protocol
//!
//! A dispatcher routes each index key to the partition that owns its
//! interval, samples how many keys landed in each interval, and answers the
//! coordinator's statistics requests with that sample.

use crate::coordinator::histogram::Histogram;
use crate::coordinator::partition::{PartitionId, PartitionMap};
use crate::coordinator::server::{CoordinatorEvent, DispatcherId, StatisticsReport};
use crate::storage::types::IndexKey;
use std::sync::Arc;

#[derive(Debug)]
pub struct KeyDispatcher {
    id: DispatcherId,
    map: Arc<PartitionMap>,
    sample: Histogram,
    routed: u64,
}

impl KeyDispatcher {
    pub fn new(id: DispatcherId, map: Arc<PartitionMap>) -> Self {
        let sample = Histogram::new(map.intervals());
        Self {
            id,
            map,
            sample,
            routed: 0,
        }
    }

    pub fn id(&self) -> DispatcherId {
        self.id
    }

    pub fn partition_map(&self) -> &Arc<PartitionMap> {
        &self.map
    }

    /// Total keys routed since creation
    pub fn routed(&self) -> u64 {
        self.routed
    }

    /// Partition for `key`; counted in the current sample
    pub fn route(&mut self, key: IndexKey) -> PartitionId {
        let interval = self.map.interval_of(key);
        self.sample.record(interval);
        self.routed += 1;
        self.map.assignment()[interval]
    }

    /// Switch to a new map. The sample is kept when the interval grid is
    /// unchanged.
    pub fn adopt(&mut self, map: Arc<PartitionMap>) {
        if map.intervals() != self.sample.len() {
            self.sample = Histogram::new(map.intervals());
        }
        tracing::debug!(
            dispatcher = self.id,
            uniform = map.is_uniform(),
            "Partition map adopted"
        );
        self.map = map;
    }

    /// Hand over the sample for `cycle` and start a new one
    pub fn take_report(&mut self, cycle: u64) -> StatisticsReport {
        let histogram = std::mem::replace(&mut self.sample, Histogram::new(self.map.intervals()));
        StatisticsReport {
            dispatcher_id: self.id,
            cycle,
            histogram,
        }
    }

    /// React to a coordinator broadcast; returns a report when one was requested
    pub fn on_event(&mut self, event: &CoordinatorEvent) -> Option<StatisticsReport> {
        match event {
            CoordinatorEvent::StatisticsRequested { cycle } => Some(self.take_report(*cycle)),
            CoordinatorEvent::PartitionMapUpdated(map) => {
                self.adopt(map.clone());
                None
            }
            _ => None,
        }
    }
}
