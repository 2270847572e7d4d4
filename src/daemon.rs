// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Daemon entry: wire the collaborators top-down, start the service, run
//! until interrupted, then shut everything down in order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::db::MemRepo;
use crate::provider::test_provider::{TestNode, TestWallet};
use crate::registry::WalletHandle;
use crate::service::MessagerService;

const DEV_BLOCK_INTERVAL: Duration = Duration::from_secs(2);

pub async fn start(cfg: Config, dev: bool) -> anyhow::Result<()> {
    if !dev {
        // The RPC transport for remote nodes and wallets lives in the API
        // layer, outside this crate.
        anyhow::bail!(
            "no remote node transport compiled in, start with --dev for the embedded chain"
        );
    }

    let repo = Arc::new(MemRepo::new());
    let node = Arc::new(TestNode::new());
    let wallet = Arc::new(TestWallet::default());
    let wallets = vec![WalletHandle {
        id: Uuid::new_v4(),
        name: "dev".to_string(),
        api: wallet,
    }];

    let service = MessagerService::new(repo, node.clone(), wallets, cfg)
        .await
        .context("wiring service")?;
    service.start().await.context("starting service")?;

    // dev chain: mine on a fixed cadence so the pipelines have tipsets
    let miner_cancel = CancellationToken::new();
    let miner = {
        let node = node.clone();
        let cancel = miner_cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DEV_BLOCK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let ts = node.advance();
                        info!(height = ts.epoch(), "dev chain advanced");
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    miner_cancel.cancel();
    let _ = miner.await;
    service.stop().await;
    Ok(())
}
