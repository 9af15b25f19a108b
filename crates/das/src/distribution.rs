use quorum_types::{Epoch, LedgerTime, NodeId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::allocation::Allocation;
use crate::config::DeliveryConfig;
use crate::ledger::Ledger;
use crate::share::{PostedCommitment, Share};
use crate::transport::Transport;
use crate::{DasError, Result};

/// Outcome of dispersing one epoch.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub epoch: Epoch,
    /// Shares handed to the transport per recipient
    pub delivered: BTreeMap<NodeId, usize>,
    /// Recipients whose transfer gave up, with the last error
    pub failed: BTreeMap<NodeId, String>,
    pub retries: u64,
    pub elapsed_ms: u64,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn shares_delivered(&self) -> usize {
        self.delivered.values().sum()
    }
}

#[derive(Default)]
struct DeliveryMetrics {
    epochs: AtomicU64,
    shares_sent: AtomicU64,
    retries: AtomicU64,
    failed_transfers: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryMetricsSnapshot {
    pub epochs: u64,
    pub shares_sent: u64,
    pub retries: u64,
    pub failed_transfers: u64,
}

/// Sends every recipient its allocated shares.
///
/// Each recipient transfer runs as its own task and fails independently:
/// attempts time out, back off exponentially and stop once the ledger
/// clock passes the epoch deadline or the attempt budget is spent.
pub struct Disperser {
    transport: Arc<dyn Transport>,
    ledger: Arc<dyn Ledger>,
    config: DeliveryConfig,
    metrics: Arc<DeliveryMetrics>,
}

impl Disperser {
    pub fn new(transport: Arc<dyn Transport>, ledger: Arc<dyn Ledger>, config: DeliveryConfig) -> Self {
        Self {
            transport,
            ledger,
            config,
            metrics: Arc::new(DeliveryMetrics::default()),
        }
    }

    /// Deliver `shares` according to `allocation`. Partial failure is
    /// reported, not returned as an error.
    pub async fn disperse(
        &self,
        record: &PostedCommitment,
        shares: &[Share],
        allocation: &Allocation,
    ) -> Result<DeliveryReport> {
        let start = Instant::now();
        if shares.len() != allocation.total_shares() as usize {
            return Err(DasError::InvalidShare(format!(
                "{} shares for an allocation of {}",
                shares.len(),
                allocation.total_shares()
            )));
        }
        self.metrics.epochs.fetch_add(1, Ordering::Relaxed);

        info!(
            "Dispersing {} shares of epoch {} to {} recipients",
            shares.len(),
            record.epoch,
            allocation.iter().count()
        );

        let permits = Arc::new(Semaphore::new(self.config.max_in_flight));
        let mut transfers = JoinSet::new();
        for (recipient, range) in allocation.iter() {
            let batch: Vec<Share> = shares[range.start as usize..range.end as usize].to_vec();
            let transfer = Transfer {
                recipient: *recipient,
                deadline: record.deadline,
                transport: self.transport.clone(),
                ledger: self.ledger.clone(),
                config: self.config.clone(),
                metrics: self.metrics.clone(),
            };
            transfers.spawn(transfer.run_gated(batch, permits.clone()));
        }

        let mut report = DeliveryReport {
            epoch: record.epoch,
            ..Default::default()
        };
        while let Some(joined) = transfers.join_next().await {
            let outcome = joined.map_err(|e| DasError::Transport(format!("transfer task: {}", e)))?;
            report.retries += outcome.retries;
            match outcome.result {
                Ok(()) => {
                    report.delivered.insert(outcome.recipient, outcome.sent);
                }
                Err(e) => {
                    warn!("Transfer to {} failed after {} shares: {}", outcome.recipient, outcome.sent, e);
                    self.metrics.failed_transfers.fetch_add(1, Ordering::Relaxed);
                    if outcome.sent > 0 {
                        report.delivered.insert(outcome.recipient, outcome.sent);
                    }
                    report.failed.insert(outcome.recipient, e.to_string());
                }
            }
        }

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            "Epoch {} dispersed: {} shares delivered, {} transfers failed, {} retries",
            record.epoch,
            report.shares_delivered(),
            report.failed.len(),
            report.retries
        );
        Ok(report)
    }

    pub fn metrics(&self) -> DeliveryMetricsSnapshot {
        DeliveryMetricsSnapshot {
            epochs: self.metrics.epochs.load(Ordering::Relaxed),
            shares_sent: self.metrics.shares_sent.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
            failed_transfers: self.metrics.failed_transfers.load(Ordering::Relaxed),
        }
    }
}

struct Transfer {
    recipient: NodeId,
    deadline: LedgerTime,
    transport: Arc<dyn Transport>,
    ledger: Arc<dyn Ledger>,
    config: DeliveryConfig,
    metrics: Arc<DeliveryMetrics>,
}

struct TransferOutcome {
    recipient: NodeId,
    sent: usize,
    retries: u64,
    result: Result<()>,
}

impl Transfer {
    /// Run once a delivery slot is free.
    async fn run_gated(self, batch: Vec<Share>, permits: Arc<Semaphore>) -> TransferOutcome {
        let _permit = match permits.acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                return TransferOutcome {
                    recipient: self.recipient,
                    sent: 0,
                    retries: 0,
                    result: Err(DasError::Transport(format!("no delivery slot: {}", e))),
                }
            }
        };
        self.run(batch).await
    }

    async fn run(self, batch: Vec<Share>) -> TransferOutcome {
        let mut sent = 0;
        let mut retries = 0;
        for share in batch {
            match self.send_with_retry(share, &mut retries).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    return TransferOutcome {
                        recipient: self.recipient,
                        sent,
                        retries,
                        result: Err(e),
                    }
                }
            }
        }
        debug!("Delivered {} shares to {}", sent, self.recipient);
        TransferOutcome {
            recipient: self.recipient,
            sent,
            retries,
            result: Ok(()),
        }
    }

    async fn send_with_retry(&self, share: Share, retries: &mut u64) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let sent = tokio::time::timeout(
                self.config.attempt_timeout(),
                self.transport.send_share(self.recipient, share.clone()),
            )
            .await;
            let err = match sent {
                Ok(Ok(())) => {
                    self.metrics.shares_sent.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(_) => DasError::Transport(format!(
                    "send of share {} to {} timed out",
                    share.index, self.recipient
                )),
            };

            if self.ledger.now().await > self.deadline {
                return Err(DasError::DeadlineExceeded);
            }
            if attempt >= self.config.max_attempts || !err.is_transient() {
                return Err(err);
            }
            *retries += 1;
            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
            let delay = self.config.backoff(attempt);
            debug!(
                "Retrying share {} to {} in {:?}: {}",
                share.index, self.recipient, delay, err
            );
            tokio::time::sleep(delay).await;
        }
    }
}
