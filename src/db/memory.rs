// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::receipt::Receipt;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::errors::Error;
use super::{ActorCfgRepo, AddressRepo, MessageRepo, Repo, SharedParamsRepo, TxRepo};
use crate::blocks::TipsetKey;
use crate::types::{
    ActorCfg, AddressEntry, AddressState, Message, MessageState, MethodType, SelectSpecUpdate,
    SharedSpec,
};

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Default)]
struct Inner {
    messages: HashMap<String, Message>,
    addresses: HashMap<Address, AddressEntry>,
    shared_params: Option<SharedSpec>,
    actor_cfgs: HashMap<Uuid, ActorCfg>,
}

/// In-memory repository backend. The reference implementation for tests and
/// the embedded dev chain; SQL drivers live behind the same trait set.
///
/// Transactions run against a cloned snapshot which replaces the shared state
/// on success; a commit lock serializes them.
#[derive(Clone, Default)]
pub struct MemRepo {
    inner: Arc<RwLock<Inner>>,
    tx_lock: Arc<Mutex<()>>,
}

impl MemRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_inner(inner: Inner) -> Self {
        Self {
            inner: Arc::new(RwLock::new(inner)),
            tx_lock: Arc::new(Mutex::new(())),
        }
    }

    fn with_message<T>(&self, id: &str, f: impl FnOnce(&mut Message) -> T) -> Result<T> {
        let mut inner = self.inner.write();
        let msg = inner.messages.get_mut(id).ok_or(Error::NotFound)?;
        let out = f(msg);
        msg.updated_at = Utc::now();
        Ok(out)
    }

    fn with_message_by_unsigned_cid<T>(
        &self,
        cid: &Cid,
        f: impl FnOnce(&mut Message) -> T,
    ) -> Result<T> {
        let mut inner = self.inner.write();
        let msg = inner
            .messages
            .values_mut()
            .find(|m| m.unsigned_cid.as_ref() == Some(cid))
            .ok_or(Error::NotFound)?;
        let out = f(msg);
        msg.updated_at = Utc::now();
        Ok(out)
    }

    fn with_address<T>(&self, addr: &Address, f: impl FnOnce(&mut AddressEntry) -> T) -> Result<T> {
        let mut inner = self.inner.write();
        let entry = inner
            .addresses
            .get_mut(addr)
            .filter(|a| !a.is_deleted)
            .ok_or(Error::NotFound)?;
        let out = f(entry);
        entry.updated_at = Utc::now();
        Ok(out)
    }

    fn filter_messages(&self, pred: impl Fn(&Message) -> bool) -> Vec<Message> {
        self.inner
            .read()
            .messages
            .values()
            .filter(|m| pred(m))
            .cloned()
            .collect()
    }
}

/// Newest first with a stable tie-break, the order selection candidates are
/// served in.
fn sort_newest_first(msgs: &mut [Message]) {
    msgs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

fn sort_oldest_first(msgs: &mut [Message]) {
    msgs.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

impl MessageRepo for MemRepo {
    fn create_message(&self, msg: &Message) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.messages.contains_key(&msg.id) {
            return Err(Error::Duplicate(msg.id.clone()));
        }
        inner.messages.insert(msg.id.clone(), msg.clone());
        Ok(())
    }

    fn save_message(&self, msg: &Message) -> Result<()> {
        let mut stored = msg.clone();
        stored.updated_at = Utc::now();
        self.inner.write().messages.insert(stored.id.clone(), stored);
        Ok(())
    }

    fn batch_save_messages(&self, msgs: &[Message]) -> Result<()> {
        for msg in msgs {
            self.save_message(msg)?;
        }
        Ok(())
    }

    fn has_message(&self, id: &str) -> Result<bool> {
        Ok(self.inner.read().messages.contains_key(id))
    }

    fn get_message(&self, id: &str) -> Result<Message> {
        self.inner
            .read()
            .messages
            .get(id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn get_message_by_unsigned_cid(&self, cid: &Cid) -> Result<Message> {
        self.inner
            .read()
            .messages
            .values()
            .find(|m| m.unsigned_cid.as_ref() == Some(cid))
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn get_message_by_signed_cid(&self, cid: &Cid) -> Result<Message> {
        self.inner
            .read()
            .messages
            .values()
            .find(|m| m.signed_cid.as_ref() == Some(cid))
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn get_message_by_from_and_nonce(&self, from: &Address, nonce: u64) -> Result<Message> {
        self.inner
            .read()
            .messages
            .values()
            .find(|m| m.from() == from && m.nonce() == nonce)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn get_message_by_from_nonce_state(
        &self,
        from: &Address,
        nonce: u64,
        state: MessageState,
    ) -> Result<Message> {
        self.inner
            .read()
            .messages
            .values()
            .find(|m| m.from() == from && m.nonce() == nonce && m.state == state)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn list_messages(&self) -> Result<Vec<Message>> {
        let mut msgs = self.filter_messages(|_| true);
        sort_oldest_first(&mut msgs);
        Ok(msgs)
    }

    fn list_messages_by_address(&self, from: &Address) -> Result<Vec<Message>> {
        let mut msgs = self.filter_messages(|m| m.from() == from);
        sort_oldest_first(&mut msgs);
        Ok(msgs)
    }

    fn list_messages_by_from_state(
        &self,
        from: Option<Address>,
        state: MessageState,
        asc: bool,
        page_index: usize,
        page_size: usize,
    ) -> Result<Vec<Message>> {
        let mut msgs = self.filter_messages(|m| {
            m.state == state && from.map_or(true, |f| *m.from() == f)
        });
        if asc {
            sort_oldest_first(&mut msgs);
        } else {
            sort_newest_first(&mut msgs);
        }
        let start = page_index.saturating_sub(1) * page_size;
        Ok(msgs.into_iter().skip(start).take(page_size).collect())
    }

    fn list_unfilled_messages(&self, from: &Address, limit: usize) -> Result<Vec<Message>> {
        let mut msgs =
            self.filter_messages(|m| m.from() == from && m.state == MessageState::UnFill);
        sort_newest_first(&mut msgs);
        if limit > 0 {
            msgs.truncate(limit);
        }
        Ok(msgs)
    }

    fn list_filled_messages(&self, from: &Address) -> Result<Vec<Message>> {
        let mut msgs = self.filter_messages(|m| m.from() == from && m.state == MessageState::Fill);
        msgs.sort_by_key(|m| m.nonce());
        Ok(msgs)
    }

    fn list_filled_messages_below_nonce(
        &self,
        from: &Address,
        nonce: u64,
    ) -> Result<Vec<Message>> {
        let mut msgs = self.filter_messages(|m| {
            m.from() == from && m.state == MessageState::Fill && m.nonce() < nonce
        });
        msgs.sort_by_key(|m| m.nonce());
        Ok(msgs)
    }

    fn list_chain_messages_by_height(&self, height: ChainEpoch) -> Result<Vec<Message>> {
        Ok(self.filter_messages(|m| m.height == height && m.state == MessageState::OnChain))
    }

    fn list_signed_messages_since(&self, start: DateTime<Utc>) -> Result<Vec<Message>> {
        Ok(self.filter_messages(|m| m.signature.is_some() && m.created_at >= start))
    }

    fn list_signed_messages_from_height(&self, height: ChainEpoch) -> Result<Vec<Message>> {
        Ok(self.filter_messages(|m| m.signature.is_some() && m.height >= height))
    }

    fn list_failed_messages(&self) -> Result<Vec<Message>> {
        let mut msgs =
            self.filter_messages(|m| m.state == MessageState::UnFill && !m.error_msg.is_empty());
        sort_oldest_first(&mut msgs);
        Ok(msgs)
    }

    fn list_blocked_messages(
        &self,
        from: &Address,
        older_than: chrono::Duration,
    ) -> Result<Vec<Message>> {
        let cutoff = Utc::now() - older_than;
        let mut msgs = self.filter_messages(|m| {
            m.from() == from && m.state == MessageState::Fill && m.created_at < cutoff
        });
        sort_oldest_first(&mut msgs);
        Ok(msgs)
    }

    fn update_message_state(&self, id: &str, state: MessageState) -> Result<()> {
        self.with_message(id, |m| m.state = state)
    }

    fn update_message_state_by_unsigned_cid(&self, cid: &Cid, state: MessageState) -> Result<()> {
        self.with_message_by_unsigned_cid(cid, |m| m.state = state)
    }

    fn update_message_info_by_unsigned_cid(
        &self,
        cid: &Cid,
        receipt: Option<&Receipt>,
        height: ChainEpoch,
        state: MessageState,
        tipset_key: &TipsetKey,
    ) -> Result<()> {
        self.with_message_by_unsigned_cid(cid, |m| {
            m.receipt = receipt.cloned();
            m.height = height;
            m.state = state;
            m.tipset_key = tipset_key.clone();
        })
    }

    fn mark_bad_message(&self, id: &str) -> Result<()> {
        self.with_message(id, |m| m.state = MessageState::Failed)
    }

    fn update_error_msg(&self, id: &str, err: &str) -> Result<()> {
        self.with_message(id, |m| m.error_msg = err.to_string())
    }

    fn update_unfilled_state_by_address(&self, from: &Address, state: MessageState) -> Result<()> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        for m in inner.messages.values_mut() {
            if m.from() == from && m.state == MessageState::UnFill {
                m.state = state;
                m.updated_at = now;
            }
        }
        Ok(())
    }
}

impl AddressRepo for MemRepo {
    fn save_address(&self, entry: &AddressEntry) -> Result<()> {
        let mut stored = entry.clone();
        stored.updated_at = Utc::now();
        self.inner.write().addresses.insert(stored.addr, stored);
        Ok(())
    }

    fn get_address(&self, addr: &Address) -> Result<AddressEntry> {
        self.inner
            .read()
            .addresses
            .get(addr)
            .filter(|a| !a.is_deleted)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn has_address(&self, addr: &Address) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .addresses
            .get(addr)
            .is_some_and(|a| !a.is_deleted))
    }

    fn list_addresses(&self) -> Result<Vec<AddressEntry>> {
        Ok(self
            .inner
            .read()
            .addresses
            .values()
            .filter(|a| !a.is_deleted)
            .cloned()
            .sorted_by_key(|a| a.addr.to_string())
            .collect())
    }

    fn list_active_addresses(&self) -> Result<Vec<AddressEntry>> {
        Ok(self
            .inner
            .read()
            .addresses
            .values()
            .filter(|a| !a.is_deleted && a.state == AddressState::Alive)
            .cloned()
            .sorted_by_key(|a| a.addr.to_string())
            .collect())
    }

    fn update_nonce(&self, addr: &Address, nonce: u64) -> Result<()> {
        self.with_address(addr, |a| a.nonce = nonce)
    }

    fn update_state(&self, addr: &Address, state: AddressState) -> Result<()> {
        self.with_address(addr, |a| a.state = state)
    }

    fn update_sel_msg_num(&self, addr: &Address, num: u64) -> Result<()> {
        self.with_address(addr, |a| a.sel_msg_num = num)
    }

    fn delete_address(&self, addr: &Address) -> Result<()> {
        self.with_address(addr, |a| a.is_deleted = true)
    }
}

impl SharedParamsRepo for MemRepo {
    fn get_shared_params(&self) -> Result<SharedSpec> {
        self.inner.read().shared_params.clone().ok_or(Error::NotFound)
    }

    fn set_shared_params(&self, params: &SharedSpec) -> Result<()> {
        let mut stored = params.clone();
        stored.id = 1;
        self.inner.write().shared_params = Some(stored);
        Ok(())
    }
}

impl ActorCfgRepo for MemRepo {
    fn save_actor_cfg(&self, cfg: &ActorCfg) -> Result<()> {
        let mut inner = self.inner.write();
        let clash = inner
            .actor_cfgs
            .values()
            .any(|c| c.id != cfg.id && c.code_cid == cfg.code_cid && c.method == cfg.method);
        if clash {
            return Err(Error::Duplicate(format!(
                "actor cfg for ({}, {})",
                cfg.code_cid, cfg.method
            )));
        }
        let mut stored = cfg.clone();
        stored.updated_at = Utc::now();
        inner.actor_cfgs.insert(stored.id, stored);
        Ok(())
    }

    fn get_actor_cfg(&self, id: &Uuid) -> Result<ActorCfg> {
        self.inner
            .read()
            .actor_cfgs
            .get(id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn get_actor_cfg_by_method_type(&self, mt: &MethodType) -> Result<ActorCfg> {
        self.inner
            .read()
            .actor_cfgs
            .values()
            .find(|c| c.code_cid == mt.code_cid && c.method == mt.method)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn list_actor_cfgs(&self) -> Result<Vec<ActorCfg>> {
        Ok(self
            .inner
            .read()
            .actor_cfgs
            .values()
            .cloned()
            .sorted_by_key(|c| c.created_at)
            .collect())
    }

    fn delete_actor_cfg_by_method_type(&self, mt: &MethodType) -> Result<()> {
        let mut inner = self.inner.write();
        let id = inner
            .actor_cfgs
            .values()
            .find(|c| c.code_cid == mt.code_cid && c.method == mt.method)
            .map(|c| c.id)
            .ok_or(Error::NotFound)?;
        inner.actor_cfgs.remove(&id);
        Ok(())
    }

    fn update_select_spec(&self, id: &Uuid, update: &SelectSpecUpdate) -> Result<()> {
        let mut inner = self.inner.write();
        let cfg = inner.actor_cfgs.get_mut(id).ok_or(Error::NotFound)?;
        if let Some(n) = update.sel_msg_num {
            cfg.sel_msg_num = n;
        }
        if let Some(v) = update.gas_over_estimation {
            cfg.gas_over_estimation = v;
        }
        if let Some(v) = update.gas_over_premium {
            cfg.gas_over_premium = v;
        }
        if let Some(v) = &update.max_fee {
            cfg.max_fee = Some(v.clone());
        }
        if let Some(v) = &update.gas_fee_cap {
            cfg.gas_fee_cap = Some(v.clone());
        }
        if let Some(v) = &update.base_fee {
            cfg.base_fee = Some(v.clone());
        }
        cfg.updated_at = Utc::now();
        Ok(())
    }
}

impl TxRepo for MemRepo {
    fn message_repo(&self) -> &dyn MessageRepo {
        self
    }

    fn address_repo(&self) -> &dyn AddressRepo {
        self
    }

    fn shared_params_repo(&self) -> &dyn SharedParamsRepo {
        self
    }

    fn actor_cfg_repo(&self) -> &dyn ActorCfgRepo {
        self
    }
}

impl Repo for MemRepo {
    fn transaction(&self, f: &mut dyn FnMut(&dyn TxRepo) -> Result<()>) -> Result<()> {
        let _commit_guard = self.tx_lock.lock();
        let snapshot = self.inner.read().clone();
        let tx = MemRepo::from_inner(snapshot);
        f(&tx)?;
        let committed = tx.inner.read().clone();
        *self.inner.write() = committed;
        Ok(())
    }
}
