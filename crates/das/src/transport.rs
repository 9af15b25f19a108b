use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use quorum_types::NodeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::share::Share;
use crate::{DasError, Result};

/// Point-to-point share delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_share(&self, recipient: NodeId, share: Share) -> Result<()>;

    /// Shares delivered to `recipient`, starting at `cursor`. Each item
    /// carries the cursor to resume from after it, so a reader that
    /// reconnects continues where it stopped. The stream stays open and
    /// yields new shares as they arrive. Frames that do not decode are
    /// yielded as errors.
    fn receive_shares(&self, recipient: NodeId, cursor: u64) -> BoxStream<'static, (u64, Result<Share>)>;

    /// Number of frames delivered to `recipient` so far. A stream read
    /// from cursor 0 has this many items ready.
    fn delivered_to(&self, recipient: &NodeId) -> u64;
}

struct Mailbox {
    frames: RwLock<Vec<Vec<u8>>>,
    len: watch::Sender<usize>,
}

impl Mailbox {
    fn new() -> Self {
        let (len, _) = watch::channel(0);
        Self {
            frames: RwLock::new(Vec::new()),
            len,
        }
    }

    fn push(&self, frame: Vec<u8>) {
        let len = {
            let mut frames = self.frames.write();
            frames.push(frame);
            frames.len()
        };
        self.len.send_replace(len);
    }

    fn frame(&self, index: usize) -> Option<Vec<u8>> {
        self.frames.read().get(index).cloned()
    }
}

/// Delivery failure injected into `MemoryTransport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropRule {
    /// Accept every send to the recipient and deliver none of them.
    Blackhole(NodeId),
    /// Fail the next `remaining` sends to the recipient with a transport
    /// error.
    FailNext { recipient: NodeId, remaining: u32 },
}

/// In-process transport with one bincode-framed mailbox per recipient.
#[derive(Default)]
pub struct MemoryTransport {
    mailboxes: DashMap<NodeId, Arc<Mailbox>>,
    blackholes: RwLock<Vec<NodeId>>,
    failures: RwLock<HashMap<NodeId, u32>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn mailbox(&self, recipient: NodeId) -> Arc<Mailbox> {
        self.mailboxes
            .entry(recipient)
            .or_insert_with(|| Arc::new(Mailbox::new()))
            .clone()
    }

    pub fn add_rule(&self, rule: DropRule) {
        debug!("Transport rule added: {:?}", rule);
        match rule {
            DropRule::Blackhole(recipient) => self.blackholes.write().push(recipient),
            DropRule::FailNext { recipient, remaining } => {
                *self.failures.write().entry(recipient).or_insert(0) += remaining;
            }
        }
    }

    pub fn clear_rules(&self) {
        self.blackholes.write().clear();
        self.failures.write().clear();
    }

    /// Push raw bytes into a mailbox, bypassing share encoding.
    pub fn deliver_frame(&self, recipient: NodeId, frame: Vec<u8>) {
        self.mailbox(recipient).push(frame);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_share(&self, recipient: NodeId, share: Share) -> Result<()> {
        {
            let mut failures = self.failures.write();
            if let Some(remaining) = failures.get_mut(&recipient) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(DasError::Transport(format!("link to {} is down", recipient)));
                }
            }
        }
        if self.blackholes.read().contains(&recipient) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Dropped share {} for {}", share.index, recipient);
            return Ok(());
        }

        let frame = share.to_bytes()?;
        self.mailbox(recipient).push(frame);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn receive_shares(&self, recipient: NodeId, cursor: u64) -> BoxStream<'static, (u64, Result<Share>)> {
        let mailbox = self.mailbox(recipient);
        let len = mailbox.len.subscribe();

        stream::unfold((mailbox, len, cursor), move |(mailbox, mut len, cursor)| async move {
            if len.wait_for(|n| *n as u64 > cursor).await.is_err() {
                return None;
            }
            let frame = mailbox.frame(cursor as usize)?;
            let share = Share::from_bytes(&frame);
            if let Err(e) = &share {
                warn!("Undecodable frame {} for {}: {}", cursor, recipient, e);
            }
            Some(((cursor + 1, share), (mailbox, len, cursor + 1)))
        })
        .boxed()
    }

    fn delivered_to(&self, recipient: &NodeId) -> u64 {
        self.mailboxes
            .get(recipient)
            .map(|mailbox| mailbox.frames.read().len() as u64)
            .unwrap_or(0)
    }
}
