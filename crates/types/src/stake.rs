use crate::{NodeId, Result, TypesError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Stake table of one epoch.
///
/// Iteration is in ascending `NodeId` order so every observer derives the
/// same allocation. The running total always fits in a `u64`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeWeights {
    weights: BTreeMap<NodeId, u64>,
    total: u64,
}

impl StakeWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = (NodeId, u64)>,
    {
        let mut weights = Self::new();
        for (id, weight) in iter {
            weights.insert(id, weight)?;
        }
        Ok(weights)
    }

    /// Equal weight for every identity.
    pub fn uniform<I>(ids: I, weight: u64) -> Result<Self>
    where
        I: IntoIterator<Item = NodeId>,
    {
        Self::try_from_iter(ids.into_iter().map(|id| (id, weight)))
    }

    /// Sets the weight of `id`, replacing any previous entry.
    pub fn insert(&mut self, id: NodeId, weight: u64) -> Result<()> {
        let previous = self.weights.get(&id).copied().unwrap_or(0);
        let total = (self.total - previous)
            .checked_add(weight)
            .ok_or(TypesError::Overflow)?;
        self.weights.insert(id, weight);
        self.total = total;
        Ok(())
    }

    pub fn weight_of(&self, id: &NodeId) -> Option<u64> {
        self.weights.get(id).copied()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.weights.contains_key(id)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.weights.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.weights.keys()
    }

    /// Recipients with a strictly positive weight.
    pub fn positive(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.weights.iter().filter(|(_, w)| **w > 0)
    }

    /// Summed weight of the given identities; unknown ids count zero.
    pub fn weight_of_set<'a, I>(&self, ids: I) -> u64
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        ids.into_iter()
            .filter_map(|id| self.weights.get(id))
            .sum()
    }
}

/// Exact non-negative rational number.
///
/// Ratios that drive penalties are compared by cross multiplication so
/// that every replica reaches the same decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Fraction {
    pub numerator: u64,
    pub denominator: u64,
}

impl Fraction {
    pub const ZERO: Fraction = Fraction { numerator: 0, denominator: 1 };
    pub const ONE_THIRD: Fraction = Fraction { numerator: 1, denominator: 3 };

    pub fn new(numerator: u64, denominator: u64) -> Result<Self> {
        if denominator == 0 {
            return Err(TypesError::ZeroDenominator);
        }
        Ok(Self { numerator, denominator })
    }

    pub fn is_zero(&self) -> bool {
        self.numerator == 0
    }

    /// Lossy view for logs and CLI output.
    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }
}

impl PartialEq for Fraction {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Fraction {}

impl PartialOrd for Fraction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fraction {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.numerator as u128 * other.denominator as u128;
        let rhs = other.numerator as u128 * self.denominator as u128;
        lhs.cmp(&rhs)
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_insert_replaces_and_tracks_total() {
        let mut weights = StakeWeights::new();
        weights.insert(NodeId::from_index(1), 10).unwrap();
        weights.insert(NodeId::from_index(2), 5).unwrap();
        weights.insert(NodeId::from_index(1), 3).unwrap();
        assert_eq!(weights.total(), 8);
        assert_eq!(weights.len(), 2);
    }

    #[test]
    fn test_total_overflow_is_rejected() {
        let mut weights = StakeWeights::new();
        weights.insert(NodeId::from_index(1), u64::MAX).unwrap();
        assert!(weights.insert(NodeId::from_index(2), 1).is_err());
        assert_eq!(weights.total(), u64::MAX);
    }

    #[test]
    fn test_weight_of_set_ignores_unknown() {
        let weights = StakeWeights::uniform((0..4).map(NodeId::from_index), 7).unwrap();
        let ids = [NodeId::from_index(0), NodeId::from_index(3), NodeId::from_index(99)];
        assert_eq!(weights.weight_of_set(ids.iter()), 14);
    }

    #[test]
    fn test_fraction_ordering() {
        let third = Fraction::ONE_THIRD;
        assert!(Fraction::new(1, 10).unwrap() < third);
        assert_eq!(Fraction::new(2, 6).unwrap(), third);
        assert!(Fraction::new(34, 100).unwrap() > third);
        assert!(Fraction::new(1, 0).is_err());
    }

    proptest! {
        #[test]
        fn prop_fraction_cmp_matches_exact_arithmetic(
            a in 0u64..1_000_000, b in 1u64..1_000_000,
            c in 0u64..1_000_000, d in 1u64..1_000_000,
        ) {
            let lhs = Fraction::new(a, b).unwrap();
            let rhs = Fraction::new(c, d).unwrap();
            prop_assert_eq!(lhs >= rhs, (a as u128) * (d as u128) >= (c as u128) * (b as u128));
        }
    }
}
