// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Address registry: the in-memory cache of managed sender addresses, kept
//! in sync with the remote wallets. Addresses that disappear remotely are
//! parked in `Notfound` and amended away only once none of their signed
//! messages is still waiting to land on chain.

use std::collections::HashMap;
use std::sync::Arc;

use fvm_shared::address::Address;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blocks::TipsetKey;
use crate::config::AddressConfig;
use crate::db::{errors::Error as DbError, Repo};
use crate::errors::{Error, Result};
use crate::provider::{NodeProvider, WalletProvider};
use crate::types::{AddressEntry, AddressState, MessageState};

/// A configured remote wallet endpoint.
#[derive(Clone)]
pub struct WalletHandle {
    pub id: Uuid,
    pub name: String,
    pub api: Arc<dyn WalletProvider>,
}

/// Cached per-address facts the selection pipeline needs without touching
/// the repository.
#[derive(Clone)]
pub struct AddressInfo {
    pub state: AddressState,
    pub wallet_id: Uuid,
    pub wallet_name: String,
    pub sel_msg_num: u64,
    pub wallet: Arc<dyn WalletProvider>,
}

pub struct AddressRegistry {
    repo: Arc<dyn Repo>,
    node: Arc<dyn NodeProvider>,
    wallets: Vec<WalletHandle>,
    cfg: AddressConfig,
    // plain data only under this lock, never I/O
    info: Mutex<HashMap<Address, AddressInfo>>,
    amend_tx: mpsc::UnboundedSender<Address>,
    amend_rx: Mutex<Option<mpsc::UnboundedReceiver<Address>>>,
}

impl AddressRegistry {
    pub fn new(
        repo: Arc<dyn Repo>,
        node: Arc<dyn NodeProvider>,
        wallets: Vec<WalletHandle>,
        cfg: AddressConfig,
    ) -> Arc<Self> {
        let (amend_tx, amend_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            repo,
            node,
            wallets,
            cfg,
            info: Mutex::new(HashMap::new()),
            amend_tx,
            amend_rx: Mutex::new(Some(amend_rx)),
        })
    }

    /// Load persisted rows into the cache. `Notfound` rows still carry
    /// in-flight messages from a previous run, so they re-enter amendment.
    pub fn hydrate(&self) -> Result<()> {
        for entry in self.repo.address_repo().list_addresses()? {
            let Some(wallet) = self.wallet_by_id(&entry.wallet_id) else {
                error!(addr = %entry.addr, wallet_id = %entry.wallet_id, "wallet client not configured");
                continue;
            };
            self.cache_set(entry.addr, info_of(&entry, &wallet));
            if entry.state == AddressState::Notfound {
                let _ = self.amend_tx.send(entry.addr);
            }
        }
        Ok(())
    }

    /// Spawn the remote-wallet sweep loop and the amendment loop.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let sweep = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(this.cfg.remote_wallet_sweep_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => this.sweep().await,
                    }
                }
            })
        };
        let amend = {
            let this = self.clone();
            let mut rx = self
                .amend_rx
                .lock()
                .take()
                .expect("registry started twice");
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        addr = rx.recv() => match addr {
                            Some(addr) => this.amend(addr).await,
                            None => break,
                        },
                    }
                }
            })
        };
        vec![sweep, amend]
    }

    /// One sync tick across every configured wallet.
    pub async fn sweep(&self) {
        for wallet in self.wallets.clone() {
            if let Err(e) = self.process_wallet(&wallet).await {
                error!(wallet = %wallet.name, "process wallet failed: {e}");
            }
        }
    }

    async fn process_wallet(&self, wallet: &WalletHandle) -> Result<()> {
        let remote = wallet
            .api
            .wallet_list()
            .await
            .map_err(|e| Error::transient(format!("wallet list: {e}")))?;

        let mut stale = self.addrs_of_wallet(&wallet.id);
        for addr in remote {
            stale.retain(|a| a != &addr);

            if self
                .get_info(&addr)
                .is_some_and(|i| i.state == AddressState::Alive)
            {
                continue;
            }

            // The cursor must start at or above the on-chain nonce.
            let nonce = match self.node.state_get_actor(&addr, &TipsetKey::default()).await {
                Ok(actor) => actor.nonce,
                Err(e) => {
                    warn!(%addr, "get actor failed, starting nonce at 0: {e}");
                    0
                }
            };

            let entry = match self.repo.address_repo().get_address(&addr) {
                Ok(mut existing) => {
                    existing.state = AddressState::Alive;
                    existing.nonce = existing.nonce.max(nonce);
                    existing.wallet_id = wallet.id;
                    existing.wallet_name = wallet.name.clone();
                    existing
                }
                Err(DbError::NotFound) => {
                    let mut entry = AddressEntry::new(addr, nonce, wallet.id, wallet.name.clone());
                    entry.sel_msg_num = 0;
                    entry
                }
                Err(e) => return Err(e.into()),
            };
            self.repo.address_repo().save_address(&entry)?;
            self.cache_set(addr, info_of(&entry, &wallet.api));
            info!(%addr, wallet = %wallet.name, nonce, "address registered");
        }

        // left over locally but gone remotely
        for addr in stale {
            if self
                .get_info(&addr)
                .is_some_and(|i| i.state == AddressState::Notfound)
            {
                continue;
            }
            info!(%addr, wallet = %wallet.name, "remote wallet dropped address");
            if let Err(e) = self.delete_address(&addr) {
                error!(%addr, "delete address: {e}");
            }
        }
        Ok(())
    }

    /// Try to retire one parked address. While the sender still has `Fill`
    /// messages pending on chain the row must survive, so re-enqueue later.
    async fn amend(&self, addr: Address) {
        let filled = match self.repo.message_repo().list_filled_messages(&addr) {
            Ok(msgs) => msgs,
            Err(e) => {
                error!(%addr, "list filled messages: {e}");
                return self.requeue_amend(addr);
            }
        };
        if filled.is_empty() {
            // the address may have been re-added while parked
            match self.repo.address_repo().get_address(&addr) {
                Ok(entry) if entry.state == AddressState::Alive => return,
                Err(DbError::NotFound) => {}
                Ok(_) => {
                    if let Err(e) = self.repo.address_repo().delete_address(&addr) {
                        error!(%addr, "delete address row: {e}");
                        return self.requeue_amend(addr);
                    }
                }
                Err(e) => {
                    error!(%addr, "get address: {e}");
                    return self.requeue_amend(addr);
                }
            }
            self.cache_remove(&addr);
            info!(%addr, "address removed");
            return;
        }
        self.requeue_amend(addr);
    }

    fn requeue_amend(&self, addr: Address) {
        let tx = self.amend_tx.clone();
        let delay = self.cfg.amend_retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(addr);
        });
    }

    /// Park an address: messages that never got a nonce cannot be signed
    /// anymore, in-flight ones keep being tracked until amendment retires
    /// the row.
    pub fn delete_address(&self, addr: &Address) -> Result<()> {
        self.repo
            .address_repo()
            .update_state(addr, AddressState::Notfound)?;
        self.cache_set_state(addr, AddressState::Notfound);
        self.repo
            .message_repo()
            .update_unfilled_state_by_address(addr, MessageState::NoWallet)?;
        let _ = self.amend_tx.send(*addr);
        info!(%addr, "address parked for removal");
        Ok(())
    }

    pub fn forbid_address(&self, addr: &Address) -> Result<()> {
        self.repo
            .address_repo()
            .update_state(addr, AddressState::Forbidden)?;
        self.cache_set_state(addr, AddressState::Forbidden);
        info!(%addr, "address forbidden");
        Ok(())
    }

    pub fn activate_address(&self, addr: &Address) -> Result<()> {
        self.repo
            .address_repo()
            .update_state(addr, AddressState::Alive)?;
        self.cache_set_state(addr, AddressState::Alive);
        info!(%addr, "address activated");
        Ok(())
    }

    pub fn set_sel_msg_num(&self, addr: &Address, num: u64) -> Result<()> {
        self.repo.address_repo().update_sel_msg_num(addr, num)?;
        let mut info = self.info.lock();
        if let Some(entry) = info.get_mut(addr) {
            entry.sel_msg_num = num;
        }
        Ok(())
    }

    pub fn get_info(&self, addr: &Address) -> Option<AddressInfo> {
        self.info.lock().get(addr).cloned()
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.info.lock().contains_key(addr)
    }

    /// Accounts a signing request is made on behalf of.
    pub fn accounts_of_signer(&self, addr: &Address) -> Vec<String> {
        self.get_info(addr)
            .map(|i| vec![i.wallet_name])
            .unwrap_or_default()
    }

    pub fn wallet_of(&self, addr: &Address) -> Option<Arc<dyn WalletProvider>> {
        self.get_info(addr).map(|i| i.wallet)
    }

    fn wallet_by_id(&self, id: &Uuid) -> Option<Arc<dyn WalletProvider>> {
        self.wallets.iter().find(|w| &w.id == id).map(|w| w.api.clone())
    }

    fn addrs_of_wallet(&self, id: &Uuid) -> Vec<Address> {
        self.info
            .lock()
            .iter()
            .filter(|(_, i)| &i.wallet_id == id)
            .map(|(a, _)| *a)
            .collect()
    }

    fn cache_set(&self, addr: Address, info: AddressInfo) {
        self.info.lock().insert(addr, info);
    }

    fn cache_set_state(&self, addr: &Address, state: AddressState) {
        if let Some(entry) = self.info.lock().get_mut(addr) {
            entry.state = state;
        }
    }

    fn cache_remove(&self, addr: &Address) {
        self.info.lock().remove(addr);
    }
}

fn info_of(entry: &AddressEntry, wallet: &Arc<dyn WalletProvider>) -> AddressInfo {
    AddressInfo {
        state: entry.state,
        wallet_id: entry.wallet_id,
        wallet_name: entry.wallet_name.clone(),
        sel_msg_num: entry.sel_msg_num,
        wallet: wallet.clone(),
    }
}
