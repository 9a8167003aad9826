//! Key interval to partition mapping
//!
//! The key domain `[lower, upper]` is cut into equal-width intervals. Each
//! interval is owned by exactly one partition, and every partition owns a
//! contiguous run of intervals. Keys outside the domain clamp to the first or
//! last interval.

use crate::coordinator::error::{CoordinatorError, CoordinatorResult};
use crate::storage::types::{IndexKey, KeyRange};
use serde::{Deserialize, Serialize};

pub type PartitionId = usize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMap {
    lower: f64,
    upper: f64,
    partitions: usize,
    assignment: Vec<PartitionId>,
}

impl PartitionMap {
    /// Spread intervals evenly: interval `i` goes to `i * partitions / intervals`
    pub fn uniform(partitions: usize, intervals: usize, lower: f64, upper: f64) -> Self {
        let partitions = partitions.max(1);
        let intervals = intervals.max(1);
        Self {
            lower,
            upper,
            partitions,
            assignment: uniform_assignment(partitions, intervals),
        }
    }

    /// A map with an explicit assignment over the same key domain
    pub fn with_assignment(&self, assignment: Vec<PartitionId>) -> CoordinatorResult<Self> {
        Self::from_assignment(self.partitions, self.lower, self.upper, assignment)
    }

    pub fn from_assignment(
        partitions: usize,
        lower: f64,
        upper: f64,
        assignment: Vec<PartitionId>,
    ) -> CoordinatorResult<Self> {
        if assignment.is_empty() {
            return Err(CoordinatorError::InvalidMap("no intervals".into()));
        }
        if lower.is_nan() || upper.is_nan() || lower >= upper {
            return Err(CoordinatorError::InvalidMap(format!(
                "empty key domain [{}, {}]",
                lower, upper
            )));
        }
        if let Some(p) = assignment.iter().find(|p| **p >= partitions) {
            return Err(CoordinatorError::InvalidMap(format!(
                "partition {} out of {}",
                p, partitions
            )));
        }
        if assignment.windows(2).any(|w| w[1] < w[0]) {
            return Err(CoordinatorError::InvalidMap(
                "partitions must own contiguous interval runs".into(),
            ));
        }
        Ok(Self {
            lower,
            upper,
            partitions,
            assignment,
        })
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn intervals(&self) -> usize {
        self.assignment.len()
    }

    pub fn assignment(&self) -> &[PartitionId] {
        &self.assignment
    }

    /// True when no repartition has moved an interval
    pub fn is_uniform(&self) -> bool {
        self.assignment == uniform_assignment(self.partitions, self.intervals())
    }

    fn interval_width(&self) -> f64 {
        (self.upper - self.lower) / self.intervals() as f64
    }

    /// Interval holding `key`, clamped to the domain
    pub fn interval_of(&self, key: IndexKey) -> usize {
        let last = self.intervals() - 1;
        let offset = (key.0 - self.lower) / self.interval_width();
        if offset.is_nan() || offset < 0.0 {
            0
        } else {
            (offset as usize).min(last)
        }
    }

    pub fn partition_of(&self, key: IndexKey) -> PartitionId {
        self.assignment[self.interval_of(key)]
    }

    /// Keys owned by `partition`, or `None` if it owns no interval.
    ///
    /// The first and last partitions also own the clamped keys outside the
    /// domain.
    pub fn key_range_of(&self, partition: PartitionId) -> Option<KeyRange> {
        let first = self.assignment.iter().position(|p| *p == partition)?;
        let last = self.assignment.iter().rposition(|p| *p == partition)?;
        let width = self.interval_width();

        let low = if first == 0 {
            IndexKey::MIN
        } else {
            IndexKey(self.lower + first as f64 * width)
        };
        let high = if last == self.intervals() - 1 {
            IndexKey::MAX
        } else {
            IndexKey(self.lower + (last + 1) as f64 * width)
        };
        Some(KeyRange { low, high })
    }
}

fn uniform_assignment(partitions: usize, intervals: usize) -> Vec<PartitionId> {
    (0..intervals).map(|i| i * partitions / intervals).collect()
}
