// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Selection manager: owns one worker per active address, re-hydrates the
//! worker map as the address set changes, and fans a selection tick out to
//! every worker on each new tipset. Workers run concurrently across
//! senders; a single sender is strictly serialized by its worker.

pub(crate) mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use fvm_shared::address::Address;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::blocks::Tipset;
use crate::config::MessageServiceConfig;
use crate::db::{errors::Error as DbError, Repo};
use crate::errors::Result;
use crate::message::SignedMessage;
use crate::provider::NodeProvider;
use crate::registry::AddressRegistry;
use crate::types::{AddressEntry, SharedSpec};
use crate::utils::transient;
use worker::{SelectTick, Worker, WorkerHandle};

pub struct SelectorManager {
    repo: Arc<dyn Repo>,
    node: Arc<dyn NodeProvider>,
    registry: Arc<AddressRegistry>,
    cfg: Arc<MessageServiceConfig>,
    msg_tx: mpsc::Sender<Vec<SignedMessage>>,
    workers: HashMap<Address, WorkerHandle>,
    cancel: CancellationToken,
}

impl SelectorManager {
    pub fn new(
        repo: Arc<dyn Repo>,
        node: Arc<dyn NodeProvider>,
        registry: Arc<AddressRegistry>,
        cfg: Arc<MessageServiceConfig>,
        msg_tx: mpsc::Sender<Vec<SignedMessage>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            repo,
            node,
            registry,
            cfg,
            msg_tx,
            workers: HashMap::new(),
            cancel,
        }
    }

    /// Fan a selection tick out for one new tipset. Returns once every
    /// worker has been handed (or dropped) its tick; pipelines run on.
    pub async fn select_messages(&mut self, tipset: &Arc<Tipset>) -> Result<()> {
        let shared = Arc::new(self.shared_params()?);
        let actives = self.repo.address_repo().list_active_addresses()?;
        let budgets = addr_select_msg_num(&actives, shared.sel_msg_num);

        self.update_workers(&actives);

        let applied = Arc::new(self.applied_nonces(tipset).await?);
        for entry in actives {
            let Some(handle) = self.workers.get(&entry.addr) else {
                continue;
            };
            let sel_msg_num = budgets.get(&entry.addr).copied().unwrap_or(0);
            handle.dispatch(SelectTick {
                applied: applied.clone(),
                addr_info: entry,
                tipset: tipset.clone(),
                sel_msg_num,
                shared: shared.clone(),
            });
        }
        Ok(())
    }

    fn shared_params(&self) -> Result<SharedSpec> {
        match self.repo.shared_params_repo().get_shared_params() {
            Ok(params) => Ok(params),
            Err(DbError::NotFound) => Ok(SharedSpec::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reconcile the worker map with the active address set. New addresses
    /// get a worker; stale ones are closed only while idle, otherwise their
    /// removal waits for the in-flight pipeline to finish.
    fn update_workers(&mut self, actives: &[AddressEntry]) {
        for entry in actives {
            if !self.workers.contains_key(&entry.addr) {
                info!(addr = %entry.addr, "selection worker added");
                let handle = WorkerHandle::spawn(
                    Worker {
                        addr: entry.addr,
                        repo: self.repo.clone(),
                        node: self.node.clone(),
                        registry: self.registry.clone(),
                        cfg: self.cfg.clone(),
                        msg_tx: self.msg_tx.clone(),
                    },
                    &self.cancel,
                );
                self.workers.insert(entry.addr, handle);
            }
        }

        let active_set: HashSet<Address> = actives.iter().map(|e| e.addr).collect();
        self.workers.retain(|addr, handle| {
            if active_set.contains(addr) {
                return true;
            }
            if handle.is_idle() {
                handle.close();
                info!(%addr, "selection worker removed");
                false
            } else {
                info!(%addr, "selection worker busy, removal deferred");
                true
            }
        });
    }

    /// Scan the tipset's messages for the actual next nonce per sender. The
    /// first occurrence for a sender is authoritative, each subsequent
    /// contiguous message advances it.
    async fn applied_nonces(&self, tipset: &Arc<Tipset>) -> Result<HashMap<Address, u64>> {
        let msgs = self
            .node
            .chain_get_messages_in_tipset(tipset.key())
            .await
            .map_err(|e| transient(format!("messages in tipset {}: {e}", tipset.key())))?;
        let mut applied: HashMap<Address, u64> = HashMap::new();
        for msg in msgs {
            let next = applied
                .entry(msg.message.from)
                .or_insert(msg.message.sequence);
            if *next == msg.message.sequence {
                *next += 1;
            }
        }
        Ok(applied)
    }

    pub fn shutdown(&mut self) {
        for handle in self.workers.values() {
            handle.close();
        }
        self.workers.clear();
    }
}

fn addr_select_msg_num(addrs: &[AddressEntry], default: u64) -> HashMap<Address, u64> {
    addrs
        .iter()
        .map(|a| {
            let num = if a.sel_msg_num == 0 {
                default
            } else {
                a.sel_msg_num
            };
            (a.addr, num)
        })
        .collect()
}
