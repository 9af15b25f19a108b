//! Stake-proportional share assignment.
//!
//! Any observer holding the stake table can recompute who was owed which
//! share, so the result must be a pure function of its inputs.

use quorum_types::{NodeId, StakeWeights};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::debug;

use crate::{DasError, Result};

/// Contiguous index ranges per recipient, in ascending `NodeId` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    total_shares: u32,
    ranges: Vec<(NodeId, Range<u32>)>,
    weights: StakeWeights,
}

impl Allocation {
    pub fn total_shares(&self) -> u32 {
        self.total_shares
    }

    /// Recipient assigned to `index`.
    pub fn owner_of(&self, index: u32) -> Option<NodeId> {
        if index >= self.total_shares {
            return None;
        }
        let pos = self.ranges.partition_point(|(_, range)| range.end <= index);
        self.ranges
            .get(pos)
            .filter(|(_, range)| range.contains(&index))
            .map(|(id, _)| *id)
    }

    /// Sorted indices owed to `recipient`, empty when it has none.
    pub fn shares_for(&self, recipient: &NodeId) -> Vec<u32> {
        self.range_of(recipient).map(|range| range.collect()).unwrap_or_default()
    }

    pub fn range_of(&self, recipient: &NodeId) -> Option<Range<u32>> {
        self.ranges
            .iter()
            .find(|(id, _)| id == recipient)
            .map(|(_, range)| range.clone())
    }

    /// Number of shares per recipient, including recipients with none.
    pub fn counts(&self) -> BTreeMap<NodeId, u32> {
        let mut counts: BTreeMap<NodeId, u32> = self.weights.ids().map(|id| (*id, 0)).collect();
        for (id, range) in &self.ranges {
            counts.insert(*id, range.end - range.start);
        }
        counts
    }

    /// Stake held by the owners of the given indices, each owner counted
    /// once.
    pub fn weight_covering<I>(&self, indices: I) -> u64
    where
        I: IntoIterator<Item = u32>,
    {
        let owners: std::collections::BTreeSet<NodeId> =
            indices.into_iter().filter_map(|index| self.owner_of(index)).collect();
        self.weights.weight_of_set(owners.iter())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Range<u32>)> {
        self.ranges.iter().map(|(id, range)| (id, range))
    }

    pub fn weights(&self) -> &StakeWeights {
        &self.weights
    }
}

/// Assign `total_shares` indices to recipients proportionally to stake.
///
/// Largest remainder first, ties to the lower `NodeId`. When there are at
/// least as many shares as positive-weight recipients, every such
/// recipient is then guaranteed one share, taken from the recipient
/// furthest above its exact quota.
pub fn allocate(total_shares: usize, weights: &StakeWeights) -> Result<Allocation> {
    if weights.is_empty() || weights.total() == 0 {
        return Err(DasError::StakeWeightUnavailable);
    }
    let total = u32::try_from(total_shares)
        .map_err(|_| DasError::InvalidConfig(format!("{} shares exceed the index space", total_shares)))?;

    let w_total = weights.total() as u128;
    let t = total as u128;
    let recipients: Vec<(NodeId, u128)> = weights.positive().map(|(id, w)| (*id, *w as u128)).collect();

    let mut counts: Vec<u128> = recipients.iter().map(|(_, w)| t * w / w_total).collect();
    let assigned: u128 = counts.iter().sum();

    let mut by_remainder: Vec<usize> = (0..recipients.len()).collect();
    by_remainder.sort_by(|&a, &b| {
        let ra = t * recipients[a].1 % w_total;
        let rb = t * recipients[b].1 % w_total;
        rb.cmp(&ra).then(recipients[a].0.cmp(&recipients[b].0))
    });
    for &i in by_remainder.iter().take((t - assigned) as usize) {
        counts[i] += 1;
    }

    if total_shares >= recipients.len() {
        for seat in 0..recipients.len() {
            if counts[seat] > 0 {
                continue;
            }
            // Surplus over the exact quota, scaled by the total weight.
            let donor = (0..recipients.len())
                .filter(|&j| counts[j] >= 2)
                .max_by(|&a, &b| {
                    let sa = (counts[a] * w_total) as i128 - (t * recipients[a].1) as i128;
                    let sb = (counts[b] * w_total) as i128 - (t * recipients[b].1) as i128;
                    sa.cmp(&sb).then(recipients[b].0.cmp(&recipients[a].0))
                });
            if let Some(donor) = donor {
                counts[donor] -= 1;
                counts[seat] += 1;
            }
        }
    }

    let mut ranges = Vec::with_capacity(recipients.len());
    let mut next = 0u32;
    for ((id, _), count) in recipients.iter().zip(&counts) {
        if *count == 0 {
            continue;
        }
        let end = next + *count as u32;
        ranges.push((*id, next..end));
        next = end;
    }
    debug_assert_eq!(next, total);

    debug!(
        "Allocated {} shares across {} of {} recipients",
        total,
        ranges.len(),
        weights.len()
    );

    Ok(Allocation {
        total_shares: total,
        ranges,
        weights: weights.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table(weights: &[u64]) -> StakeWeights {
        StakeWeights::try_from_iter(
            weights
                .iter()
                .enumerate()
                .map(|(i, w)| (NodeId::from_index(i as u64 + 1), *w)),
        )
        .unwrap()
    }

    fn assert_partition(allocation: &Allocation) {
        let mut seen = vec![false; allocation.total_shares() as usize];
        for (_, range) in allocation.iter() {
            for index in range.clone() {
                assert!(!seen[index as usize], "index {} assigned twice", index);
                seen[index as usize] = true;
            }
        }
        assert!(seen.into_iter().all(|s| s), "some index left unassigned");
    }

    #[test]
    fn test_equal_stake_nine_shares_ten_recipients() {
        let weights = table(&[1; 10]);
        let allocation = allocate(9, &weights).unwrap();
        assert_partition(&allocation);

        let counts = allocation.counts();
        assert_eq!(counts.values().filter(|c| **c == 1).count(), 9);
        // Equal remainders favour the lower ids
        assert_eq!(counts[&NodeId::from_index(10)], 0);
        assert_eq!(allocation.owner_of(0), Some(NodeId::from_index(1)));
        assert_eq!(allocation.owner_of(9), None);
    }

    #[test]
    fn test_proportional_counts() {
        let weights = table(&[50, 30, 20]);
        let allocation = allocate(10, &weights).unwrap();
        assert_eq!(allocation.shares_for(&NodeId::from_index(1)), vec![0, 1, 2, 3, 4]);
        assert_eq!(allocation.shares_for(&NodeId::from_index(2)), vec![5, 6, 7]);
        assert_eq!(allocation.shares_for(&NodeId::from_index(3)), vec![8, 9]);
    }

    #[test]
    fn test_largest_remainder() {
        // quotas 2.5, 2.5, 1.0 with two tied remainders and one leftover
        let weights = table(&[5, 5, 2]);
        let allocation = allocate(6, &weights).unwrap();
        let counts = allocation.counts();
        assert_eq!(counts[&NodeId::from_index(1)], 3);
        assert_eq!(counts[&NodeId::from_index(2)], 2);
        assert_eq!(counts[&NodeId::from_index(3)], 1);
    }

    #[test]
    fn test_minimum_seat() {
        let weights = table(&[100, 1, 1]);
        let allocation = allocate(4, &weights).unwrap();
        assert_partition(&allocation);
        for count in allocation.counts().values() {
            assert!(*count >= 1);
        }
    }

    #[test]
    fn test_zero_weight_gets_nothing() {
        let weights = table(&[3, 0, 3]);
        let allocation = allocate(6, &weights).unwrap();
        assert!(allocation.shares_for(&NodeId::from_index(2)).is_empty());
        assert_partition(&allocation);
    }

    #[test]
    fn test_unavailable_weights() {
        assert!(matches!(
            allocate(9, &StakeWeights::new()),
            Err(DasError::StakeWeightUnavailable)
        ));
        assert!(matches!(
            allocate(9, &table(&[0, 0])),
            Err(DasError::StakeWeightUnavailable)
        ));
    }

    #[test]
    fn test_weight_covering() {
        let weights = table(&[50, 30, 20]);
        let allocation = allocate(10, &weights).unwrap();
        assert_eq!(allocation.weight_covering([0, 1, 9]), 70);
        assert_eq!(allocation.weight_covering(Vec::new()), 0);
    }

    proptest! {
        #[test]
        fn prop_partition_and_quota(
            weights in proptest::collection::vec(1u64..1_000, 1..20),
            extra in 0usize..200,
        ) {
            let table = table(&weights);
            let total_weight: u64 = weights.iter().sum();
            // Enough shares that every exact quota is at least one share
            let min_weight = *weights.iter().min().unwrap();
            let total = (total_weight.div_ceil(min_weight) as usize) + extra;

            let allocation = allocate(total, &table).unwrap();
            assert_partition(&allocation);
            prop_assert_eq!(allocation.clone(), allocate(total, &table).unwrap());

            for (id, count) in allocation.counts() {
                let w = table.weight_of(&id).unwrap() as u128;
                let exact_floor = (total as u128 * w) / total_weight as u128;
                let count = count as u128;
                prop_assert!(count + 1 >= exact_floor && count <= exact_floor + 1);
                prop_assert!(count >= 1);
            }
        }

        #[test]
        fn prop_any_table_is_partitioned(
            weights in proptest::collection::vec(0u64..50, 1..30),
            total in 0usize..300,
        ) {
            let table = table(&weights);
            prop_assume!(table.total() > 0);
            let allocation = allocate(total, &table).unwrap();
            assert_partition(&allocation);
        }
    }
}
