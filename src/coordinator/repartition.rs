//! Load-equalizing repartition plans
//!
//! Intervals are walked in key order and handed to the current partition
//! until the cumulative load reaches that partition's share boundary
//! `total * (p + 1) / partitions`; the partition then advances. A partition
//! also advances when only just enough intervals remain to give every later
//! partition one. Runs stay contiguous, so each partition keeps a single key
//! range.

use crate::coordinator::partition::PartitionId;

#[derive(Debug, Clone, Copy)]
pub struct RepartitionManager {
    partitions: usize,
}

impl RepartitionManager {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }

    /// Assignment of each interval to a partition given per-interval loads.
    ///
    /// With no more intervals than partitions the uniform assignment is the
    /// only contiguous plan, so skew cannot be corrected there;
    /// `Config::validate` refuses that setup.
    pub fn plan(&self, loads: &[u64]) -> Vec<PartitionId> {
        let intervals = loads.len();
        let partitions = self.partitions;
        let total: u128 = loads.iter().map(|l| *l as u128).sum();

        if total == 0 || intervals <= partitions {
            return (0..intervals).map(|i| i * partitions / intervals).collect();
        }

        let last = partitions - 1;
        let mut plan = Vec::with_capacity(intervals);
        let mut partition = 0;
        let mut cumulative: u128 = 0;

        for (i, load) in loads.iter().enumerate() {
            if partition < last && intervals - i <= last - partition {
                partition += 1;
            }
            plan.push(partition);
            cumulative += *load as u128;

            let boundary = total * (partition as u128 + 1);
            if partition < last && cumulative * partitions as u128 >= boundary {
                partition += 1;
            }
        }
        plan
    }

    /// Heaviest per-partition load under `plan`
    pub fn max_partition_load(&self, loads: &[u64], plan: &[PartitionId]) -> u64 {
        let mut per_partition = vec![0u64; self.partitions];
        for (load, p) in loads.iter().zip(plan) {
            if let Some(slot) = per_partition.get_mut(*p) {
                *slot += load;
            }
        }
        per_partition.into_iter().max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_contiguous(plan: &[PartitionId], partitions: usize) {
        assert!(plan.windows(2).all(|w| w[1] == w[0] || w[1] == w[0] + 1));
        assert_eq!(plan.first(), Some(&0));
        assert_eq!(plan.last(), Some(&(partitions - 1)));
    }

    #[test]
    fn test_hot_interval_gets_own_partition() {
        let manager = RepartitionManager::new(4);
        let loads = [80, 5, 5, 5, 5, 5, 5, 5];
        let plan = manager.plan(&loads);
        assert_eq!(plan, vec![0, 1, 2, 3, 3, 3, 3, 3]);
        assert_contiguous(&plan, 4);
    }

    #[test]
    fn test_balanced_load_keeps_uniform_plan() {
        let manager = RepartitionManager::new(4);
        assert_eq!(manager.plan(&[10; 8]), vec![0, 0, 1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn test_plan_reduces_peak_load() {
        let manager = RepartitionManager::new(3);
        let loads = [1, 1, 1, 1, 30, 30, 1, 1, 1, 1, 1, 1];
        let uniform: Vec<_> = (0..loads.len()).map(|i| i * 3 / loads.len()).collect();
        let plan = manager.plan(&loads);

        assert_contiguous(&plan, 3);
        assert!(
            manager.max_partition_load(&loads, &plan)
                < manager.max_partition_load(&loads, &uniform)
        );
    }

    #[test]
    fn test_tail_heavy_load_keeps_every_partition() {
        let manager = RepartitionManager::new(4);
        let plan = manager.plan(&[1, 1, 1, 1, 1, 1, 1, 100]);
        assert_contiguous(&plan, 4);
        assert_eq!(plan[7], 3);
        assert_eq!(plan[6], 2);
    }

    #[test]
    fn test_degenerate_inputs() {
        let manager = RepartitionManager::new(4);
        assert_eq!(manager.plan(&[0; 8]), vec![0, 0, 1, 1, 2, 2, 3, 3]);
        assert_eq!(manager.plan(&[5, 5]), vec![0, 2]);
        assert!(manager.plan(&[]).is_empty());
        assert_eq!(RepartitionManager::new(1).plan(&[9, 1, 1]), vec![0, 0, 0]);
    }
}
