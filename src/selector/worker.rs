// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use fvm_shared::address::Address;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::blocks::Tipset;
use crate::config::MessageServiceConfig;
use crate::db::Repo;
use crate::errors::{Error, Result};
use crate::gas::merge_msg_spec;
use crate::message::SignedMessage;
use crate::provider::{EstimateMessage, NodeProvider, SignMeta, SignType};
use crate::registry::AddressRegistry;
use crate::types::{AddressEntry, AddressState, Message, MessageState, SendSpec, SharedSpec};

const GAS_ESTIMATE_ERR_PREFIX: &str = "gas estimate: ";
const SIGN_MSG_ERR_PREFIX: &str = "sign msg: ";

/// Most candidates fetched for one pipeline run, regardless of budget.
const MAX_SELECT_BATCH: u64 = 100;

/// One selection dispatch, carrying everything the pipeline needs as a
/// snapshot so no shared mutable state crosses the channel.
#[derive(Clone)]
pub(crate) struct SelectTick {
    /// Next nonce per sender as observed inside the tipset being processed.
    pub applied: Arc<HashMap<Address, u64>>,
    pub addr_info: AddressEntry,
    pub tipset: Arc<Tipset>,
    pub sel_msg_num: u64,
    pub shared: Arc<SharedSpec>,
}

#[derive(Clone, Debug)]
pub(crate) struct MsgError {
    pub id: String,
    pub err: String,
}

/// Outcome of one pipeline run, persisted and emitted as a unit.
pub(crate) struct SelectResult {
    pub address: AddressEntry,
    pub selected: Vec<Message>,
    pub to_push: Vec<SignedMessage>,
    pub errors: Vec<MsgError>,
}

impl SelectResult {
    fn push_only(address: AddressEntry, to_push: Vec<SignedMessage>) -> Self {
        Self {
            address,
            selected: Vec::new(),
            to_push,
            errors: Vec::new(),
        }
    }
}

/// The per-address selection pipeline. At most one run is in flight per
/// address; the owning handle enforces that with a one-permit semaphore.
pub(crate) struct Worker {
    pub addr: Address,
    pub repo: Arc<dyn Repo>,
    pub node: Arc<dyn NodeProvider>,
    pub registry: Arc<AddressRegistry>,
    pub cfg: Arc<MessageServiceConfig>,
    pub msg_tx: mpsc::Sender<Vec<SignedMessage>>,
}

/// Manager-side handle to a spawned worker.
pub(crate) struct WorkerHandle {
    pub addr: Address,
    tx: mpsc::UnboundedSender<(SelectTick, OwnedSemaphorePermit)>,
    sem: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    pub fn spawn(worker: Worker, parent: &CancellationToken) -> Self {
        let addr = worker.addr;
        let cancel = parent.child_token();
        let sem = Arc::new(Semaphore::new(1));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker.run(rx, cancel.clone()));
        Self {
            addr,
            tx,
            sem,
            cancel,
        }
    }

    /// Hand a tick to the worker. Dropped with a log line when a pipeline is
    /// already running or the worker was cancelled; the caller never waits.
    pub fn dispatch(&self, tick: SelectTick) {
        if self.cancel.is_cancelled() {
            return;
        }
        match self.sem.clone().try_acquire_owned() {
            Ok(permit) => {
                if self.tx.send((tick, permit)).is_err() {
                    warn!(addr = %self.addr, "worker inbox closed, tick dropped");
                }
            }
            Err(_) => {
                info!(addr = %self.addr, "already selecting messages, tick dropped");
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.sem.available_permits() == 1
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Worker {
    pub(crate) async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<(SelectTick, OwnedSemaphorePermit)>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                recv = rx.recv() => {
                    let Some((tick, permit)) = recv else { break };
                    let started = Instant::now();
                    let deadline = self.cfg.sign_message_timeout + self.cfg.estimate_message_timeout;
                    match tokio::time::timeout(deadline, self.process(tick)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(addr = %self.addr, "select message failed: {e}"),
                        Err(_) => error!(
                            addr = %self.addr,
                            took = ?started.elapsed(),
                            "selection pipeline hit its deadline"
                        ),
                    }
                    drop(permit);
                }
            }
        }
    }

    async fn process(&self, tick: SelectTick) -> Result<()> {
        let started = Instant::now();
        let result = self.select(tick).await?;
        info!(
            addr = %self.addr,
            selected = result.selected.len(),
            to_push = result.to_push.len(),
            errors = result.errors.len(),
            took = ?started.elapsed(),
            "select message result"
        );
        self.save_selected(&result)?;
        self.emit(result);
        Ok(())
    }

    /// The pipeline: reconcile the nonce cursor, collect the re-push set,
    /// pick candidates within budget, estimate gas in one batch, then assign
    /// nonces and signatures in order.
    pub(crate) async fn select(&self, tick: SelectTick) -> Result<SelectResult> {
        let mut addr_info = tick.addr_info.clone();

        match self.registry.get_info(&self.addr) {
            Some(info) if info.state == AddressState::Alive => {}
            _ => {
                info!(addr = %self.addr, "address not signable, skipping selection");
                return Ok(SelectResult::push_only(addr_info, Vec::new()));
            }
        }
        let accounts = self.registry.accounts_of_signer(&self.addr);
        let wallet = self
            .registry
            .wallet_of(&self.addr)
            .ok_or_else(|| Error::NotFound(format!("wallet client for {}", self.addr)))?;

        let nonce_on_chain = self.nonce_on_chain(&tick).await?;
        if nonce_on_chain > addr_info.nonce {
            warn!(
                addr = %self.addr,
                db = addr_info.nonce,
                chain = nonce_on_chain,
                "nonce cursor behind chain, jumping forward"
            );
            self.repo
                .address_repo()
                .update_nonce(&self.addr, nonce_on_chain)?;
            addr_info.nonce = nonce_on_chain;
        }

        let to_push = self.filled_to_push(nonce_on_chain)?;

        let nonce_gap = addr_info.nonce - nonce_on_chain;
        if nonce_gap >= tick.sel_msg_num {
            info!(
                addr = %self.addr,
                pending = nonce_gap,
                "in-flight budget exhausted, re-push only"
            );
            return Ok(SelectResult::push_only(addr_info, to_push));
        }
        let want = tick.sel_msg_num - nonce_gap;

        let fetch = (want * 2).min(MAX_SELECT_BATCH);
        let candidates = self
            .repo
            .message_repo()
            .list_unfilled_messages(&self.addr, fetch as usize)?;
        if candidates.is_empty() {
            return Ok(SelectResult::push_only(addr_info, to_push));
        }

        let (estimates, candidates) = self
            .estimate_messages(&tick.tipset, candidates, &tick.shared, &addr_info)
            .await?;

        let mut selected = Vec::with_capacity(candidates.len());
        let mut errors = Vec::new();
        let mut count = 0u64;
        for (mut msg, estimate) in candidates.into_iter().zip(estimates) {
            let estimated = match estimate {
                Ok(m) => m,
                Err(e) => {
                    error!(id = %msg.id, "estimate message failed: {e}");
                    errors.push(MsgError {
                        id: msg.id.clone(),
                        err: format!("{GAS_ESTIMATE_ERR_PREFIX}{e}"),
                    });
                    continue;
                }
            };
            if count >= want {
                break;
            }

            msg.message.sequence = addr_info.nonce;
            msg.message.gas_limit = estimated.gas_limit;
            msg.message.gas_fee_cap = estimated.gas_fee_cap;
            msg.message.gas_premium = estimated.gas_premium;
            msg.unsigned_cid = Some(msg.message.cid()?);

            let signature = match self.sign_message(&msg, &accounts, wallet.as_ref()).await {
                Ok(sig) => sig,
                Err(e) => {
                    // A rejected signature aborts the whole run; candidates
                    // already assigned keep their nonces.
                    error!(id = %msg.id, "sign message failed: {e}");
                    errors.push(MsgError {
                        id: msg.id.clone(),
                        err: format!("{SIGN_MSG_ERR_PREFIX}{e}"),
                    });
                    break;
                }
            };

            let signed = SignedMessage::new_from_parts(msg.message.clone(), signature.clone());
            msg.signed_cid = Some(signed.cid()?);
            msg.signature = Some(signature);
            msg.state = MessageState::Fill;

            selected.push(msg);
            addr_info.nonce += 1;
            count += 1;
        }

        Ok(SelectResult {
            address: addr_info,
            selected,
            to_push,
            errors,
        })
    }

    /// The actor nonce at the tipset, overridden by the applied-nonce scan
    /// when this sender had messages land inside the tipset itself.
    async fn nonce_on_chain(&self, tick: &SelectTick) -> Result<u64> {
        let actor = tokio::time::timeout(
            self.cfg.default_timeout,
            self.node.state_get_actor(&self.addr, tick.tipset.key()),
        )
        .await??;
        match tick.applied.get(&self.addr) {
            Some(&applied) => {
                info!(
                    addr = %self.addr,
                    in_tipset = applied,
                    actor = actor.nonce,
                    "using nonce observed in tipset"
                );
                Ok(applied)
            }
            None => Ok(actor.nonce),
        }
    }

    /// Signed messages not yet observed on chain; everything at or above the
    /// on-chain nonce must be resubmitted.
    fn filled_to_push(&self, nonce_on_chain: u64) -> Result<Vec<SignedMessage>> {
        let filled = self.repo.message_repo().list_filled_messages(&self.addr)?;
        Ok(filled
            .iter()
            .filter(|m| m.nonce() >= nonce_on_chain)
            .filter_map(|m| {
                let smsg = m.signed_message();
                if smsg.is_none() {
                    warn!(id = %m.id, "fill message has no signature, skipping re-push");
                }
                smsg
            })
            .collect())
    }

    async fn estimate_messages(
        &self,
        tipset: &Tipset,
        candidates: Vec<Message>,
        shared: &SharedSpec,
        addr_info: &AddressEntry,
    ) -> Result<(Vec<std::result::Result<crate::message::UnsignedMessage, String>>, Vec<Message>)>
    {
        let mut kept = Vec::with_capacity(candidates.len());
        let mut estimates = Vec::with_capacity(candidates.len());
        for mut msg in candidates {
            let spec = merge_msg_spec(shared, &msg.send_spec, addr_info, &msg.message);

            if msg.message.gas_fee_cap.is_zero() {
                if let Some(cap) = &spec.gas_fee_cap {
                    msg.message.gas_fee_cap = cap.clone();
                }
            }

            if let Some(base_fee_cap) = &spec.base_fee {
                if tipset.parent_base_fee() > base_fee_cap {
                    info!(
                        id = %msg.id,
                        cap = %base_fee_cap,
                        chain = %tipset.parent_base_fee(),
                        height = tipset.epoch(),
                        "base fee above cap, skipping message"
                    );
                    continue;
                }
            }

            estimates.push(EstimateMessage {
                msg: msg.message.clone(),
                spec: SendSpec {
                    gas_over_estimation: spec.gas_over_estimation,
                    gas_over_premium: spec.gas_over_premium,
                    max_fee: spec.max_fee.clone(),
                },
            });
            kept.push(msg);
        }

        if kept.is_empty() {
            return Ok((Vec::new(), kept));
        }

        let results = tokio::time::timeout(
            self.cfg.estimate_message_timeout,
            self.node
                .gas_batch_estimate(estimates, addr_info.nonce, tipset.key()),
        )
        .await??;
        if results.len() != kept.len() {
            return Err(Error::Invariant(format!(
                "estimation returned {} results for {} candidates",
                results.len(),
                kept.len()
            )));
        }
        Ok((results, kept))
    }

    async fn sign_message(
        &self,
        msg: &Message,
        accounts: &[String],
        wallet: &dyn crate::provider::WalletProvider,
    ) -> Result<fvm_shared::crypto::signature::Signature> {
        let cid = msg.unsigned_cid.ok_or_else(|| {
            Error::Invariant(format!("message {} signed before cid assignment", msg.id))
        })?;
        let data = msg.message.marshal_cbor()?;
        let meta = SignMeta {
            sign_type: SignType::ChainMsg,
            extra: data,
        };
        let sig = tokio::time::timeout(
            self.cfg.sign_message_timeout,
            wallet.wallet_sign(&self.addr, accounts, &cid.to_bytes(), &meta),
        )
        .await
        .map_err(|_| Error::Signing("sign deadline exceeded".to_string()))?
        .map_err(|e| Error::Signing(e.to_string()))?;
        Ok(sig)
    }

    /// Persist the run in a single transaction: filled messages, the
    /// advanced nonce cursor, and per-candidate error strings.
    pub(crate) fn save_selected(&self, result: &SelectResult) -> Result<()> {
        if result.selected.is_empty() && result.errors.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        self.repo.transaction(&mut |tx| {
            if !result.selected.is_empty() {
                tx.message_repo().batch_save_messages(&result.selected)?;
                tx.address_repo()
                    .update_nonce(&result.address.addr, result.address.nonce)?;
            }
            for e in &result.errors {
                tx.message_repo().update_error_msg(&e.id, &e.err)?;
            }
            Ok(())
        })?;
        info!(
            addr = %self.addr,
            saved = result.selected.len(),
            took = ?started.elapsed(),
            "selected messages saved"
        );
        Ok(())
    }

    /// Send the selected and re-push sets downstream. The channel is bounded;
    /// on overflow the batch is dropped and the next tipset re-pushes.
    pub(crate) fn emit(&self, result: SelectResult) {
        let mut batch = result.to_push;
        for msg in &result.selected {
            match msg.signed_message() {
                Some(smsg) => batch.push(smsg),
                None => warn!(id = %msg.id, "selected message missing signature"),
            }
        }
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.msg_tx.try_send(batch) {
            error!(addr = %self.addr, "message receiver full, dropping batch: {e}");
        }
    }
}
