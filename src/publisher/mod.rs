// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Publisher: drains batches of signed messages off a bounded channel and
//! submits each to the node's mempool. A failed push is logged, never
//! retried here; the message stays `Fill` and the next selection tick
//! re-pushes it. Observers can tap the stream over a broadcast channel.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PublisherConfig;
use crate::message::SignedMessage;
use crate::provider::NodeProvider;

/// Sender half handed to the selection workers.
pub type MessageReceiver = mpsc::Sender<Vec<SignedMessage>>;

pub struct Publisher {
    node: Arc<dyn NodeProvider>,
    rx: mpsc::Receiver<Vec<SignedMessage>>,
    observer: Option<broadcast::Sender<SignedMessage>>,
    cfg: PublisherConfig,
}

impl Publisher {
    /// Build the publisher and the bounded channel feeding it.
    pub fn new(node: Arc<dyn NodeProvider>, cfg: PublisherConfig) -> (Self, MessageReceiver) {
        let (tx, rx) = mpsc::channel(cfg.buffer.max(1));
        let observer = cfg
            .enable_pubsub
            .then(|| broadcast::channel(cfg.buffer.max(1)).0);
        (
            Self {
                node,
                rx,
                observer,
                cfg,
            },
            tx,
        )
    }

    /// Stream of everything pushed, for pub/sub forwarding.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<SignedMessage>> {
        self.observer.as_ref().map(|tx| tx.subscribe())
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.rx.recv() => match batch {
                    Some(batch) => self.publish_batch(batch).await,
                    None => break,
                },
            }
        }
    }

    /// Push one batch, deduplicated by signed cid.
    pub async fn publish_batch(&self, batch: Vec<SignedMessage>) {
        if self.cfg.skip_push_message {
            debug!(count = batch.len(), "push disabled, dropping batch");
            return;
        }
        let mut seen = HashSet::new();
        let mut pushed = 0usize;
        for msg in batch {
            let cid = match msg.cid() {
                Ok(cid) => cid,
                Err(e) => {
                    warn!("signed message without cid, skipping: {e}");
                    continue;
                }
            };
            if !seen.insert(cid) {
                continue;
            }
            match self.node.mpool_push(&msg).await {
                Ok(_) => {
                    pushed += 1;
                    if let Some(observer) = &self.observer {
                        let _ = observer.send(msg);
                    }
                }
                Err(e) => {
                    // next selection tick re-pushes, nothing to do here
                    warn!(%cid, nonce = msg.sequence(), "mpool push failed: {e}");
                }
            }
        }
        if pushed > 0 {
            info!(pushed, "published signed messages");
        }
    }
}
