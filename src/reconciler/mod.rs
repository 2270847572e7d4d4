// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! State reconciler: drives message lifecycle transitions from chain
//! events. Reverted tipsets put their messages back into `Fill` for
//! re-push; applied tipsets record chain linkage and receipts, and expose
//! replacements as nonce conflicts. Once the head has been stable for the
//! configured window, a sweep picks up landings the event stream missed and
//! expires messages that outlived their age budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::blocks::{Tipset, TipsetKey};
use crate::config::MessageServiceConfig;
use crate::db::{errors::Error as DbError, Repo};
use crate::errors::{Error, Result};
use crate::provider::{HeadChange, MsgLookup, NodeProvider, TipsetMessage};
use crate::types::{Message, MessageState};
use crate::utils::retry;

const RPC_RETRY_ATTEMPTS: usize = 3;
const RPC_RETRY_DELAY: Duration = Duration::from_millis(200);
const EXPIRED_ERR: &str = "expired";

pub struct StateReconciler {
    repo: Arc<dyn Repo>,
    node: Arc<dyn NodeProvider>,
    cfg: Arc<MessageServiceConfig>,
    block_delay_secs: u64,
}

impl StateReconciler {
    pub fn new(
        repo: Arc<dyn Repo>,
        node: Arc<dyn NodeProvider>,
        cfg: Arc<MessageServiceConfig>,
        block_delay_secs: u64,
    ) -> Self {
        Self {
            repo,
            node,
            cfg,
            block_delay_secs,
        }
    }

    /// Consume chain events strictly in the order the watcher emits them.
    /// Between events, fire the stability-gated sweep once per quiet period.
    pub async fn run(
        self,
        mut events: broadcast::Receiver<HeadChange>,
        cancel: CancellationToken,
    ) {
        let stable_window = self.cfg.waiting_chain_head_stable_duration;
        let mut last_head = tokio::time::Instant::now();
        let mut swept_since_head = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(hc) => {
                        last_head = tokio::time::Instant::now();
                        swept_since_head = false;
                        if let Err(e) = self.process_head_change(&hc).await {
                            error!("process head change: {e}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // the stable sweep reconciles whatever was missed
                        warn!(skipped, "reconciler lagged behind chain events");
                        swept_since_head = false;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::time::sleep_until(last_head + stable_window), if !swept_since_head => {
                    swept_since_head = true;
                    if let Err(e) = self.stable_sweep().await {
                        error!("stable head sweep: {e}");
                    }
                }
            }
        }
    }

    pub(crate) async fn process_head_change(&self, hc: &HeadChange) -> Result<()> {
        for ts in &hc.reverted {
            self.revert_tipset(ts).await?;
        }
        for ts in &hc.applied {
            self.apply_tipset(ts).await?;
        }
        Ok(())
    }

    /// Messages of a dropped tipset go back to `Fill` with their chain
    /// linkage cleared; the next selection tick re-pushes them.
    async fn revert_tipset(&self, ts: &Arc<Tipset>) -> Result<()> {
        let msgs = self.messages_in_tipset(ts.key()).await?;
        let mut reverted = 0usize;
        for tm in &msgs {
            let unsigned_cid = tm.message.cid()?;
            match self.repo.message_repo().get_message_by_unsigned_cid(&unsigned_cid) {
                Ok(local) if local.state == MessageState::OnChain => {
                    self.repo.message_repo().update_message_info_by_unsigned_cid(
                        &unsigned_cid,
                        None,
                        0,
                        MessageState::Fill,
                        &TipsetKey::default(),
                    )?;
                    reverted += 1;
                }
                Ok(_) | Err(DbError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if reverted > 0 {
            info!(
                height = ts.epoch(),
                reverted, "tipset reverted, messages returned to fill"
            );
        }
        Ok(())
    }

    async fn apply_tipset(&self, ts: &Arc<Tipset>) -> Result<()> {
        let msgs = self.messages_in_tipset(ts.key()).await?;
        for tm in &msgs {
            if let Err(e) = self.apply_message(ts, tm).await {
                match e {
                    Error::Invariant(_) => {
                        // keep the pipeline moving, the row records why
                        error!(cid = %tm.cid, "invariant violation while applying: {e}");
                    }
                    e => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn apply_message(&self, ts: &Arc<Tipset>, tm: &TipsetMessage) -> Result<()> {
        let unsigned_cid = tm.message.cid()?;
        match self.repo.message_repo().get_message_by_unsigned_cid(&unsigned_cid) {
            Ok(local) => {
                if local.state == MessageState::OnChain
                    && local.tipset_key == *ts.key()
                    && local.height == ts.epoch()
                {
                    return Ok(());
                }
                let lookup = self.search_msg(&tm.cid).await?;
                let (receipt, height, tsk) = match &lookup {
                    Some(found) => (Some(&found.receipt), found.height, found.tipset.clone()),
                    None => {
                        warn!(cid = %tm.cid, "no receipt lookup for applied message");
                        (None, ts.epoch(), ts.key().clone())
                    }
                };
                self.repo.message_repo().update_message_info_by_unsigned_cid(
                    &unsigned_cid,
                    receipt,
                    height,
                    MessageState::OnChain,
                    &tsk,
                )?;
                info!(id = %local.id, height, "message landed on chain");
                Ok(())
            }
            Err(DbError::NotFound) => self.flag_nonce_conflict(tm),
            Err(e) => Err(e.into()),
        }
    }

    /// A foreign message from a managed sender landed at a nonce we hold in
    /// `Fill`: our copy was replaced on chain.
    fn flag_nonce_conflict(&self, tm: &TipsetMessage) -> Result<()> {
        let from = &tm.message.from;
        if !self.repo.address_repo().has_address(from)? {
            return Ok(());
        }
        let ours = match self.repo.message_repo().get_message_by_from_nonce_state(
            from,
            tm.message.sequence,
            MessageState::Fill,
        ) {
            Ok(msg) => msg,
            Err(DbError::NotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        warn!(
            id = %ours.id,
            nonce = ours.nonce(),
            on_chain = %tm.cid,
            "nonce conflict, message replaced on chain"
        );
        let err = format!("message replaced on chain by {}", tm.cid);
        self.repo.transaction(&mut |tx| {
            tx.message_repo()
                .update_message_state(&ours.id, MessageState::NonceConflict)?;
            tx.message_repo().update_error_msg(&ours.id, &err)
        })?;
        Ok(())
    }

    /// Runs once the head has been stable for the configured window:
    /// reconcile `Fill` messages the event stream may have missed, then
    /// expire those older than the age budget.
    pub(crate) async fn stable_sweep(&self) -> Result<()> {
        let addrs = self.repo.address_repo().list_addresses()?;
        for entry in &addrs {
            for msg in self.repo.message_repo().list_filled_messages(&entry.addr)? {
                if let Err(e) = self.reconcile_filled(&msg).await {
                    error!(id = %msg.id, "reconcile filled message: {e}");
                }
            }
            self.expire_messages(&entry.addr)?;
        }
        Ok(())
    }

    async fn reconcile_filled(&self, msg: &Message) -> Result<()> {
        let (Some(signed_cid), Some(unsigned_cid)) = (msg.signed_cid, msg.unsigned_cid) else {
            return Err(Error::Invariant(format!(
                "fill message {} lacks content addresses",
                msg.id
            )));
        };
        let Some(lookup) = self.search_msg(&signed_cid).await? else {
            return Ok(());
        };
        info!(id = %msg.id, height = lookup.height, "found missed on-chain landing");
        self.repo.message_repo().update_message_info_by_unsigned_cid(
            &unsigned_cid,
            Some(&lookup.receipt),
            lookup.height,
            MessageState::OnChain,
            &lookup.tipset,
        )?;
        Ok(())
    }

    fn expire_messages(&self, addr: &fvm_shared::address::Address) -> Result<()> {
        let max_age =
            chrono::Duration::seconds((self.cfg.message_max_age * self.block_delay_secs) as i64);
        let blocked = self.repo.message_repo().list_blocked_messages(addr, max_age)?;
        for msg in blocked {
            warn!(id = %msg.id, nonce = msg.nonce(), "fill message expired");
            self.repo.transaction(&mut |tx| {
                tx.message_repo()
                    .update_message_state(&msg.id, MessageState::Failed)?;
                tx.message_repo().update_error_msg(&msg.id, EXPIRED_ERR)
            })?;
        }
        Ok(())
    }

    async fn messages_in_tipset(&self, tsk: &TipsetKey) -> Result<Vec<TipsetMessage>> {
        retry(RPC_RETRY_ATTEMPTS, RPC_RETRY_DELAY, || async {
            self.node
                .chain_get_messages_in_tipset(tsk)
                .await
                .map_err(|e| match e {
                    e @ Error::NotFound(_) => e,
                    e => Error::Transient(e.to_string()),
                })
        })
        .await
    }

    async fn search_msg(&self, signed_cid: &cid::Cid) -> Result<Option<MsgLookup>> {
        retry(RPC_RETRY_ATTEMPTS, RPC_RETRY_DELAY, || async {
            self.node
                .state_search_msg(signed_cid)
                .await
                .map_err(|e| Error::Transient(e.to_string()))
        })
        .await
    }
}
