use dashmap::DashMap;
use quorum_types::{Epoch, EpochKey, Fraction, LedgerTime, NodeId, StakeWeights};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::{DasError, Result};

/// A recipient's report that its assignment never arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplaintRecord {
    pub sharer: NodeId,
    pub epoch: Epoch,
    pub recipient: NodeId,
    pub timestamp: LedgerTime,
}

#[derive(Debug, Default)]
struct Accumulator {
    /// Append-only audit trail
    records: Vec<ComplaintRecord>,
    /// Most recent complaint per recipient
    latest: HashMap<NodeId, LedgerTime>,
}

/// Per (sharer, epoch) complaint accumulators.
///
/// A complaint counts toward the ratio while its age is within the
/// recency window. Expired complaints stay in the audit trail.
#[derive(Debug)]
pub struct ComplaintBook {
    recency_window: u64,
    accumulators: DashMap<EpochKey, Accumulator>,
}

impl ComplaintBook {
    pub fn new(recency_window: u64) -> Self {
        Self {
            recency_window,
            accumulators: DashMap::new(),
        }
    }

    pub fn recency_window(&self) -> u64 {
        self.recency_window
    }

    fn is_live(&self, timestamp: LedgerTime, now: LedgerTime) -> bool {
        timestamp <= now && now.since(timestamp) <= self.recency_window
    }

    /// Appends a complaint unless `recipient` already has a live one for
    /// this epoch. Returns whether a record was appended.
    pub fn record_complaint(
        &self,
        sharer: NodeId,
        epoch: Epoch,
        recipient: NodeId,
        weights: &StakeWeights,
        now: LedgerTime,
    ) -> Result<bool> {
        if !weights.contains(&recipient) {
            return Err(DasError::UnknownRecipient);
        }

        let key = EpochKey::new(sharer, epoch);
        let mut acc = self.accumulators.entry(key).or_default();
        if let Some(previous) = acc.latest.get(&recipient) {
            if self.is_live(*previous, now) {
                trace!("Duplicate complaint from {} on {}", recipient, key);
                return Ok(false);
            }
        }

        acc.records.push(ComplaintRecord {
            sharer,
            epoch,
            recipient,
            timestamp: now,
        });
        acc.latest.insert(recipient, now);
        debug!("Complaint from {} on {} at {}", recipient, key, now);
        Ok(true)
    }

    /// Stake of recipients with a live complaint over total stake.
    pub fn complaint_ratio(
        &self,
        sharer: NodeId,
        epoch: Epoch,
        weights: &StakeWeights,
        now: LedgerTime,
    ) -> Result<Fraction> {
        if weights.total() == 0 {
            return Err(DasError::StakeWeightUnavailable);
        }
        let complained = self
            .accumulators
            .get(&EpochKey::new(sharer, epoch))
            .map(|acc| {
                let live = acc
                    .latest
                    .iter()
                    .filter(|(_, at)| self.is_live(**at, now))
                    .map(|(id, _)| id);
                weights.weight_of_set(live)
            })
            .unwrap_or(0);

        Fraction::new(complained, weights.total()).map_err(|_| DasError::StakeWeightUnavailable)
    }

    /// Recipients with a live complaint, in ascending order.
    pub fn complainants(&self, sharer: NodeId, epoch: Epoch, now: LedgerTime) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .accumulators
            .get(&EpochKey::new(sharer, epoch))
            .map(|acc| {
                acc.latest
                    .iter()
                    .filter(|(_, at)| self.is_live(**at, now))
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Every complaint ever recorded for the epoch, expired ones included.
    pub fn records(&self, sharer: NodeId, epoch: Epoch) -> Vec<ComplaintRecord> {
        self.accumulators
            .get(&EpochKey::new(sharer, epoch))
            .map(|acc| acc.records.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ids(n: u64) -> Vec<NodeId> {
        (1..=n).map(NodeId::from_index).collect()
    }

    #[test]
    fn test_ratio_counts_stake() {
        let book = ComplaintBook::new(100);
        let sharer = NodeId::from_index(99);
        let recipients = ids(3);
        let weights = StakeWeights::try_from_iter([
            (recipients[0], 10),
            (recipients[1], 20),
            (recipients[2], 30),
        ])
        .unwrap();

        let now = LedgerTime(5);
        assert!(book.record_complaint(sharer, 1, recipients[1], &weights, now).unwrap());
        assert_eq!(
            book.complaint_ratio(sharer, 1, &weights, now).unwrap(),
            Fraction::new(1, 3).unwrap()
        );
        assert_eq!(book.complaint_ratio(sharer, 2, &weights, now).unwrap(), Fraction::ZERO);
    }

    #[test]
    fn test_duplicate_complaint_is_idempotent() {
        let book = ComplaintBook::new(100);
        let sharer = NodeId::from_index(99);
        let weights = StakeWeights::uniform(ids(4), 1).unwrap();
        let recipient = NodeId::from_index(2);

        assert!(book.record_complaint(sharer, 1, recipient, &weights, LedgerTime(10)).unwrap());
        let ratio = book.complaint_ratio(sharer, 1, &weights, LedgerTime(10)).unwrap();
        assert!(!book.record_complaint(sharer, 1, recipient, &weights, LedgerTime(50)).unwrap());
        assert_eq!(book.complaint_ratio(sharer, 1, &weights, LedgerTime(50)).unwrap(), ratio);
        assert_eq!(book.records(sharer, 1).len(), 1);
    }

    #[test]
    fn test_expiry_and_fresh_complaint() {
        let book = ComplaintBook::new(10);
        let sharer = NodeId::from_index(99);
        let weights = StakeWeights::uniform(ids(2), 1).unwrap();
        let recipient = NodeId::from_index(1);

        book.record_complaint(sharer, 1, recipient, &weights, LedgerTime(0)).unwrap();
        assert_eq!(
            book.complaint_ratio(sharer, 1, &weights, LedgerTime(10)).unwrap(),
            Fraction::new(1, 2).unwrap()
        );
        assert_eq!(book.complaint_ratio(sharer, 1, &weights, LedgerTime(11)).unwrap(), Fraction::ZERO);
        assert!(book.complainants(sharer, 1, LedgerTime(11)).is_empty());

        assert!(book.record_complaint(sharer, 1, recipient, &weights, LedgerTime(11)).unwrap());
        assert_eq!(book.records(sharer, 1).len(), 2);
        assert_eq!(book.complainants(sharer, 1, LedgerTime(12)), vec![recipient]);
    }

    #[test]
    fn test_unknown_recipient_rejected() {
        let book = ComplaintBook::new(10);
        let weights = StakeWeights::uniform(ids(2), 1).unwrap();
        let result = book.record_complaint(NodeId::from_index(99), 1, NodeId::from_index(7), &weights, LedgerTime(0));
        assert!(matches!(result, Err(DasError::UnknownRecipient)));
    }

    #[test]
    fn test_concurrent_complaints() {
        let book = Arc::new(ComplaintBook::new(1_000));
        let sharer = NodeId::from_index(1_000);
        let recipients = ids(64);
        let weights = Arc::new(StakeWeights::uniform(recipients.clone(), 1).unwrap());

        std::thread::scope(|scope| {
            for chunk in recipients.chunks(8) {
                let book = book.clone();
                let weights = weights.clone();
                scope.spawn(move || {
                    for recipient in chunk {
                        for _ in 0..3 {
                            book.record_complaint(sharer, 3, *recipient, &weights, LedgerTime(1)).unwrap();
                        }
                    }
                });
            }
        });

        assert_eq!(book.records(sharer, 3).len(), 64);
        assert_eq!(book.complaint_ratio(sharer, 3, &weights, LedgerTime(2)).unwrap(), Fraction::new(1, 1).unwrap());
    }
}
