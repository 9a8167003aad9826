//! Per-interval load histogram

use serde::{Deserialize, Serialize};

/// Tuple counts per key interval
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    counts: Vec<u64>,
}

impl Histogram {
    pub fn new(intervals: usize) -> Self {
        Self {
            counts: vec![0; intervals],
        }
    }

    pub fn from_counts(counts: Vec<u64>) -> Self {
        Self { counts }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Count one tuple in `interval`, growing the histogram if needed
    pub fn record(&mut self, interval: usize) {
        self.record_n(interval, 1);
    }

    pub fn record_n(&mut self, interval: usize, n: u64) {
        if interval >= self.counts.len() {
            self.counts.resize(interval + 1, 0);
        }
        self.counts[interval] = self.counts[interval].saturating_add(n);
    }

    /// Add another histogram bucket by bucket
    pub fn merge(&mut self, other: &Histogram) {
        if other.counts.len() > self.counts.len() {
            self.counts.resize(other.counts.len(), 0);
        }
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine = mine.saturating_add(*theirs);
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn max(&self) -> u64 {
        self.counts.iter().copied().max().unwrap_or(0)
    }

    /// Zero every bucket, keeping the interval count
    pub fn clear(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
    }

    /// Heaviest bucket over the mean load per partition.
    ///
    /// An all-zero histogram has factor 0.
    pub fn skewness_factor(&self, partitions: usize) -> f64 {
        let total = self.total();
        if total == 0 || partitions == 0 {
            return 0.0;
        }
        let mean = total as f64 / partitions as f64;
        self.max() as f64 / mean
    }
}
