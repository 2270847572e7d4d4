// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Chain watcher: the single producer of tipset events for the selector and
//! the reconciler. Forwards head-change deltas in the order the node emits
//! them; on a lost subscription it reconnects with exponential backoff and
//! re-synchronizes from the current head. A lagging downstream subscriber
//! loses oldest events and re-syncs the same way.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::provider::{HeadChange, NodeProvider};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const RECONNECT_BACKOFF_MIN: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);

pub struct ChainWatcher {
    node: Arc<dyn NodeProvider>,
    out: broadcast::Sender<HeadChange>,
}

impl ChainWatcher {
    pub fn new(node: Arc<dyn NodeProvider>) -> Self {
        let (out, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { node, out }
    }

    /// Per-subscriber buffered stream of head changes.
    pub fn subscribe(&self) -> broadcast::Receiver<HeadChange> {
        self.out.subscribe()
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = RECONNECT_BACKOFF_MIN;
        'reconnect: loop {
            if cancel.is_cancelled() {
                return;
            }
            let mut sub = self.node.subscribe_head_changes();

            // Seed (and re-seed after a reconnect) from the current head so
            // downstream state catches up regardless of what was missed.
            match self.node.chain_head().await {
                Ok(head) => {
                    info!(height = head.epoch(), "chain watcher synced to head");
                    let _ = self.out.send(HeadChange {
                        applied: vec![head],
                        reverted: vec![],
                    });
                    backoff = RECONNECT_BACKOFF_MIN;
                }
                Err(e) => {
                    warn!("chain head unavailable, retrying in {backoff:?}: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                    continue 'reconnect;
                }
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = sub.recv() => match event {
                        Ok(hc) => {
                            let _ = self.out.send(hc);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "head change subscriber lagged, re-syncing from head");
                            continue 'reconnect;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("head change subscription closed, reconnecting");
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                            continue 'reconnect;
                        }
                    },
                }
            }
        }
    }
}
