// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The messager service: wires the repository, registry, selector,
//! publisher, watcher and reconciler together with explicit construction,
//! owns their lifecycle, and exposes the operations the API layer calls.

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use num_traits::Zero;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, MessageServiceConfig};
use crate::db::{errors::Error as DbError, Repo};
use crate::errors::{Error, Result};
use crate::gas::{cap_gas_fee, min_rbf_premium};
use crate::message::{SignedMessage, UnsignedMessage};
use crate::provider::{EstimateMessage, NetworkParams, NodeProvider, SignMeta, SignType};
use crate::publisher::{MessageReceiver, Publisher};
use crate::reconciler::StateReconciler;
use crate::registry::{AddressRegistry, WalletHandle};
use crate::selector::SelectorManager;
use crate::types::{
    ActorCfg, AddressEntry, Message, MessageState, MethodType, ReplaceMsgParams, SelectSpecUpdate,
    SendSpec, SharedSpec,
};
use crate::watcher::ChainWatcher;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct MessagerService {
    repo: Arc<dyn Repo>,
    node: Arc<dyn NodeProvider>,
    registry: Arc<AddressRegistry>,
    cfg: Arc<MessageServiceConfig>,
    network: NetworkParams,
    msg_tx: MessageReceiver,
    publisher: Mutex<Option<Publisher>>,
    watcher: Mutex<Option<ChainWatcher>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessagerService {
    /// Wire the service against its collaborators. Queries network
    /// parameters once and clamps the stability window against the block
    /// delay before anything starts.
    pub async fn new(
        repo: Arc<dyn Repo>,
        node: Arc<dyn NodeProvider>,
        wallets: Vec<WalletHandle>,
        mut cfg: Config,
    ) -> Result<Arc<Self>> {
        let network = node.state_network_params().await?;
        if cfg.clamp_stable_duration(network.block_delay_secs) {
            warn!(
                block_delay = network.block_delay_secs,
                clamped = ?cfg.message_service.waiting_chain_head_stable_duration,
                "stability window at or above block delay, clamped"
            );
        }
        info!(
            network = %network.network_name,
            block_delay = network.block_delay_secs,
            "connected to chain node"
        );

        let registry = AddressRegistry::new(
            repo.clone(),
            node.clone(),
            wallets,
            cfg.address.clone(),
        );
        let (publisher, msg_tx) = Publisher::new(node.clone(), cfg.publisher.clone());
        let watcher = ChainWatcher::new(node.clone());

        Ok(Arc::new(Self {
            repo,
            node,
            registry,
            cfg: Arc::new(cfg.message_service.clone()),
            network,
            msg_tx,
            publisher: Mutex::new(Some(publisher)),
            watcher: Mutex::new(Some(watcher)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn every component loop. Idempotence is not supported; a service
    /// starts once.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.registry.hydrate()?;
        let mut tasks = self.registry.start(self.cancel.clone());

        let watcher = self
            .watcher
            .lock()
            .take()
            .ok_or_else(|| Error::other("service started twice"))?;
        let selector_events = watcher.subscribe();
        let reconciler_events = watcher.subscribe();
        tasks.push(tokio::spawn(watcher.run(self.cancel.clone())));

        let publisher = self
            .publisher
            .lock()
            .take()
            .ok_or_else(|| Error::other("service started twice"))?;
        tasks.push(tokio::spawn(publisher.run(self.cancel.clone())));

        let reconciler = StateReconciler::new(
            self.repo.clone(),
            self.node.clone(),
            self.cfg.clone(),
            self.network.block_delay_secs,
        );
        tasks.push(tokio::spawn(
            reconciler.run(reconciler_events, self.cancel.clone()),
        ));

        tasks.push(tokio::spawn(selection_loop(
            SelectorManager::new(
                self.repo.clone(),
                self.node.clone(),
                self.registry.clone(),
                self.cfg.clone(),
                self.msg_tx.clone(),
                self.cancel.clone(),
            ),
            self.node.clone(),
            selector_events,
            self.cancel.clone(),
        )));

        self.tasks.lock().extend(tasks);
        info!("messager service started");
        Ok(())
    }

    /// Cancel every loop and wait for the tasks to drain.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        futures::future::join_all(tasks).await;
        info!("messager service stopped");
    }

    // ---- message operations -------------------------------------------------

    /// Accept an unsigned message for relay. The sender must be a managed
    /// address; the id must be globally unique.
    pub fn push_message(
        &self,
        id: impl Into<String>,
        msg: UnsignedMessage,
        spec: SendSpec,
    ) -> Result<String> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::Validation("message id must not be empty".into()));
        }
        if self.repo.message_repo().has_message(&id)? {
            return Err(Error::Validation(format!("duplicate message id {id}")));
        }
        let info = self
            .registry
            .get_info(&msg.from)
            .ok_or_else(|| Error::NotFound(format!("address {} not managed", msg.from)))?;
        if msg.value < TokenAmount::zero() {
            return Err(Error::Validation("value must not be negative".into()));
        }
        let entity = Message::new_unfill(id.clone(), msg, spec, info.wallet_name);
        self.repo.message_repo().create_message(&entity)?;
        info!(%id, "message accepted");
        Ok(id)
    }

    pub fn get_message(&self, id: &str) -> Result<Message> {
        self.repo
            .message_repo()
            .get_message(id)
            .map_err(|e| not_found(e, id))
    }

    pub fn get_message_by_unsigned_cid(&self, cid: &cid::Cid) -> Result<Message> {
        self.repo
            .message_repo()
            .get_message_by_unsigned_cid(cid)
            .map_err(|e| not_found(e, cid))
    }

    pub fn get_message_by_signed_cid(&self, cid: &cid::Cid) -> Result<Message> {
        self.repo
            .message_repo()
            .get_message_by_signed_cid(cid)
            .map_err(|e| not_found(e, cid))
    }

    pub fn list_messages(&self) -> Result<Vec<Message>> {
        Ok(self.repo.message_repo().list_messages()?)
    }

    pub fn list_messages_by_address(&self, addr: &Address) -> Result<Vec<Message>> {
        Ok(self.repo.message_repo().list_messages_by_address(addr)?)
    }

    pub fn list_messages_by_from_state(
        &self,
        from: Option<Address>,
        state: MessageState,
        asc: bool,
        page_index: usize,
        page_size: usize,
    ) -> Result<Vec<Message>> {
        Ok(self.repo.message_repo().list_messages_by_from_state(
            from, state, asc, page_index, page_size,
        )?)
    }

    pub fn list_failed_messages(&self) -> Result<Vec<Message>> {
        Ok(self.repo.message_repo().list_failed_messages()?)
    }

    pub fn list_blocked_messages(
        &self,
        addr: &Address,
        older_than: chrono::Duration,
    ) -> Result<Vec<Message>> {
        Ok(self
            .repo
            .message_repo()
            .list_blocked_messages(addr, older_than)?)
    }

    /// Administrative failure: take a message out of circulation.
    pub fn mark_bad_message(&self, id: &str) -> Result<()> {
        let msg = self.get_message(id)?;
        if msg.state == MessageState::OnChain {
            return Err(Error::Validation(format!(
                "message {id} already landed on chain"
            )));
        }
        self.repo.message_repo().mark_bad_message(id)?;
        info!(%id, "message marked bad");
        Ok(())
    }

    /// Poll until the message reaches a terminal state.
    pub async fn wait_message(&self, id: &str, timeout: Duration) -> Result<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msg = self.get_message(id)?;
            if msg.state.is_terminal() {
                return Ok(msg);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Transient(format!(
                    "message {id} still {} after {timeout:?}",
                    msg.state
                )));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Replace an in-flight message at the same (from, nonce): a new row
    /// with bumped gas is signed and pushed, the superseded one becomes
    /// `Replaced`. The premium is floored at the replace-by-fee minimum so
    /// the mempool accepts the swap.
    pub async fn replace_message(&self, params: ReplaceMsgParams) -> Result<Message> {
        let old = self.get_message(&params.id)?;
        if old.state != MessageState::Fill {
            return Err(Error::Validation(format!(
                "message {} is {}, only fill messages can be replaced",
                params.id, old.state
            )));
        }
        if params.new_id.is_empty() || self.repo.message_repo().has_message(&params.new_id)? {
            return Err(Error::Validation(format!(
                "replacement id {:?} empty or taken",
                params.new_id
            )));
        }

        let mut unsigned = old.message.clone();
        if params.auto {
            let head = self.node.chain_head().await?;
            unsigned.gas_limit = params.gas_limit.max(0);
            unsigned.gas_premium = TokenAmount::zero();
            let spec = SendSpec {
                gas_over_premium: params.gas_over_premium,
                max_fee: params.max_fee.clone(),
                ..SendSpec::default()
            };
            let mut results = self
                .node
                .gas_batch_estimate(
                    vec![EstimateMessage {
                        msg: unsigned.clone(),
                        spec,
                    }],
                    old.nonce(),
                    head.key(),
                )
                .await?;
            match results.pop() {
                Some(Ok(estimated)) => unsigned = estimated,
                Some(Err(e)) => return Err(Error::Estimation(e)),
                None => return Err(Error::other("empty estimation result")),
            }
        } else {
            if params.gas_limit > 0 {
                unsigned.gas_limit = params.gas_limit;
            }
            if let Some(cap) = &params.gas_fee_cap {
                unsigned.gas_fee_cap = cap.clone();
            }
            if let Some(premium) = &params.gas_premium {
                unsigned.gas_premium = premium.clone();
            }
        }

        let floor = min_rbf_premium(&old.message.gas_premium);
        if unsigned.gas_premium < floor {
            unsigned.gas_premium = floor;
        }
        if unsigned.gas_fee_cap < unsigned.gas_premium {
            unsigned.gas_fee_cap = unsigned.gas_premium.clone();
        }
        cap_gas_fee(&mut unsigned, &params.max_fee);

        let wallet = self
            .registry
            .wallet_of(old.from())
            .ok_or_else(|| Error::NotFound(format!("wallet client for {}", old.from())))?;
        let accounts = self.registry.accounts_of_signer(old.from());
        let unsigned_cid = unsigned.cid()?;
        let signature = wallet
            .wallet_sign(
                old.from(),
                &accounts,
                &unsigned_cid.to_bytes(),
                &SignMeta {
                    sign_type: SignType::ChainMsg,
                    extra: unsigned.marshal_cbor()?,
                },
            )
            .await
            .map_err(|e| Error::Signing(e.to_string()))?;

        let signed = SignedMessage::new_from_parts(unsigned.clone(), signature.clone());
        let mut replacement = Message::new_unfill(
            params.new_id.clone(),
            unsigned,
            old.send_spec.clone(),
            old.wallet_name.clone(),
        );
        replacement.unsigned_cid = Some(unsigned_cid);
        replacement.signed_cid = Some(signed.cid()?);
        replacement.signature = Some(signature);
        replacement.state = MessageState::Fill;

        self.repo.transaction(&mut |tx| {
            tx.message_repo().create_message(&replacement)?;
            tx.message_repo()
                .update_message_state(&params.id, MessageState::Replaced)
        })?;
        info!(
            old = %params.id,
            new = %params.new_id,
            nonce = replacement.nonce(),
            "message replaced"
        );

        if self.msg_tx.try_send(vec![signed]).is_err() {
            error!("message receiver full, replacement will re-push next tick");
        }
        Ok(replacement)
    }

    // ---- shared params and actor configs ------------------------------------

    /// The global policy row, or compiled defaults when none was stored.
    pub fn get_shared_params(&self) -> Result<SharedSpec> {
        match self.repo.shared_params_repo().get_shared_params() {
            Ok(params) => Ok(params),
            Err(DbError::NotFound) => Ok(SharedSpec::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_shared_params(&self, params: &SharedSpec) -> Result<()> {
        self.repo.shared_params_repo().set_shared_params(params)?;
        info!(sel_msg_num = params.sel_msg_num, "shared params updated");
        Ok(())
    }

    pub fn list_actor_cfgs(&self) -> Result<Vec<ActorCfg>> {
        Ok(self.repo.actor_cfg_repo().list_actor_cfgs()?)
    }

    pub fn save_actor_cfg(&self, cfg: &ActorCfg) -> Result<()> {
        Ok(self.repo.actor_cfg_repo().save_actor_cfg(cfg)?)
    }

    pub fn get_actor_cfg_by_method_type(&self, mt: &MethodType) -> Result<ActorCfg> {
        self.repo
            .actor_cfg_repo()
            .get_actor_cfg_by_method_type(mt)
            .map_err(|e| not_found(e, format!("actor cfg ({}, {})", mt.code_cid, mt.method)))
    }

    pub fn delete_actor_cfg(&self, mt: &MethodType) -> Result<()> {
        Ok(self.repo.actor_cfg_repo().delete_actor_cfg_by_method_type(mt)?)
    }

    pub fn update_actor_cfg_spec(&self, id: &Uuid, update: &SelectSpecUpdate) -> Result<()> {
        Ok(self.repo.actor_cfg_repo().update_select_spec(id, update)?)
    }

    // ---- address operations -------------------------------------------------

    pub fn list_addresses(&self) -> Result<Vec<AddressEntry>> {
        Ok(self.repo.address_repo().list_addresses()?)
    }

    pub fn get_address(&self, addr: &Address) -> Result<AddressEntry> {
        self.repo
            .address_repo()
            .get_address(addr)
            .map_err(|e| not_found(e, addr))
    }

    pub fn forbid_address(&self, addr: &Address) -> Result<()> {
        self.registry.forbid_address(addr)
    }

    pub fn activate_address(&self, addr: &Address) -> Result<()> {
        self.registry.activate_address(addr)
    }

    pub fn delete_address(&self, addr: &Address) -> Result<()> {
        self.registry.delete_address(addr)
    }

    pub fn set_sel_msg_num(&self, addr: &Address, num: u64) -> Result<()> {
        self.registry.set_sel_msg_num(addr, num)
    }

    pub fn registry(&self) -> &Arc<AddressRegistry> {
        &self.registry
    }
}

/// Drive the selector off the watcher's event stream: one selection fan-out
/// per applied tipset, newest first when a delta carries several.
async fn selection_loop(
    mut mgr: SelectorManager,
    node: Arc<dyn NodeProvider>,
    mut events: broadcast::Receiver<crate::provider::HeadChange>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(hc) => {
                    if let Some(ts) = hc.applied.last() {
                        if let Err(e) = mgr.select_messages(ts).await {
                            error!(height = ts.epoch(), "selection tick failed: {e}");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "selector lagged, ticking from current head");
                    match node.chain_head().await {
                        Ok(head) => {
                            if let Err(e) = mgr.select_messages(&head).await {
                                error!("selection tick failed: {e}");
                            }
                        }
                        Err(e) => error!("chain head unavailable: {e}"),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    mgr.shutdown();
}

fn not_found(e: DbError, what: impl std::fmt::Display) -> Error {
    match e {
        DbError::NotFound => Error::NotFound(what.to_string()),
        e => e.into(),
    }
}
