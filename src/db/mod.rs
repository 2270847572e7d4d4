// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Durable storage of messages, addresses, shared parameters and actor
//! configs, behind a capability-style trait set. The store guarantees
//! per-statement atomicity plus explicit transactions; serialization at the
//! sender granularity is a convention upheld by the single-flight worker.

pub mod errors;
mod memory;

pub use memory::MemRepo;

use chrono::{DateTime, Utc};
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::receipt::Receipt;
use uuid::Uuid;

use crate::blocks::TipsetKey;
use crate::types::{
    ActorCfg, AddressEntry, AddressState, Message, MessageState, MethodType, SelectSpecUpdate,
    SharedSpec,
};
use errors::Error;

type Result<T> = std::result::Result<T, Error>;

pub trait MessageRepo: Send + Sync {
    /// Insert a new row; fails with [`Error::Duplicate`] when the id exists.
    fn create_message(&self, msg: &Message) -> Result<()>;
    /// Full upsert by id.
    fn save_message(&self, msg: &Message) -> Result<()>;
    /// Upsert a batch. Atomic only when run inside [`Repo::transaction`].
    fn batch_save_messages(&self, msgs: &[Message]) -> Result<()>;

    fn has_message(&self, id: &str) -> Result<bool>;
    fn get_message(&self, id: &str) -> Result<Message>;
    fn get_message_by_unsigned_cid(&self, cid: &Cid) -> Result<Message>;
    fn get_message_by_signed_cid(&self, cid: &Cid) -> Result<Message>;
    fn get_message_by_from_and_nonce(&self, from: &Address, nonce: u64) -> Result<Message>;
    fn get_message_by_from_nonce_state(
        &self,
        from: &Address,
        nonce: u64,
        state: MessageState,
    ) -> Result<Message>;

    fn list_messages(&self) -> Result<Vec<Message>>;
    fn list_messages_by_address(&self, from: &Address) -> Result<Vec<Message>>;
    /// Paged listing by state, optionally narrowed to one sender. Pages are
    /// 1-indexed and ordered by creation time.
    fn list_messages_by_from_state(
        &self,
        from: Option<Address>,
        state: MessageState,
        asc: bool,
        page_index: usize,
        page_size: usize,
    ) -> Result<Vec<Message>>;
    /// `UnFill` rows for a sender, newest first. `limit == 0` means no limit.
    fn list_unfilled_messages(&self, from: &Address, limit: usize) -> Result<Vec<Message>>;
    fn list_filled_messages(&self, from: &Address) -> Result<Vec<Message>>;
    fn list_filled_messages_below_nonce(&self, from: &Address, nonce: u64)
        -> Result<Vec<Message>>;
    fn list_chain_messages_by_height(&self, height: ChainEpoch) -> Result<Vec<Message>>;
    fn list_signed_messages_since(&self, start: DateTime<Utc>) -> Result<Vec<Message>>;
    fn list_signed_messages_from_height(&self, height: ChainEpoch) -> Result<Vec<Message>>;
    /// `UnFill` rows carrying an error string, oldest first.
    fn list_failed_messages(&self) -> Result<Vec<Message>>;
    /// `Fill` rows for a sender created before `now - older_than`, oldest
    /// first. Feeds the expiration sweep.
    fn list_blocked_messages(
        &self,
        from: &Address,
        older_than: chrono::Duration,
    ) -> Result<Vec<Message>>;

    fn update_message_state(&self, id: &str, state: MessageState) -> Result<()>;
    fn update_message_state_by_unsigned_cid(&self, cid: &Cid, state: MessageState) -> Result<()>;
    /// Record (or clear, when `receipt` is `None`) the chain linkage of the
    /// message content-addressed by `cid`.
    fn update_message_info_by_unsigned_cid(
        &self,
        cid: &Cid,
        receipt: Option<&Receipt>,
        height: ChainEpoch,
        state: MessageState,
        tipset_key: &TipsetKey,
    ) -> Result<()>;
    fn mark_bad_message(&self, id: &str) -> Result<()>;
    fn update_error_msg(&self, id: &str, err: &str) -> Result<()>;
    /// Flip every `UnFill` row of a sender to `state`. Used when the signing
    /// wallet disappears.
    fn update_unfilled_state_by_address(&self, from: &Address, state: MessageState) -> Result<()>;
}

pub trait AddressRepo: Send + Sync {
    /// Upsert keyed by the on-chain address.
    fn save_address(&self, entry: &AddressEntry) -> Result<()>;
    fn get_address(&self, addr: &Address) -> Result<AddressEntry>;
    fn has_address(&self, addr: &Address) -> Result<bool>;
    fn list_addresses(&self) -> Result<Vec<AddressEntry>>;
    fn list_active_addresses(&self) -> Result<Vec<AddressEntry>>;
    fn update_nonce(&self, addr: &Address, nonce: u64) -> Result<()>;
    fn update_state(&self, addr: &Address, state: AddressState) -> Result<()>;
    fn update_sel_msg_num(&self, addr: &Address, num: u64) -> Result<()>;
    /// Soft delete: the row is retained for audit but drops out of every
    /// query above.
    fn delete_address(&self, addr: &Address) -> Result<()>;
}

pub trait SharedParamsRepo: Send + Sync {
    fn get_shared_params(&self) -> Result<SharedSpec>;
    /// Create-or-replace the singleton row; the id is forced to 1.
    fn set_shared_params(&self, params: &SharedSpec) -> Result<()>;
}

pub trait ActorCfgRepo: Send + Sync {
    /// Upsert; `(code_cid, method)` is unique across rows.
    fn save_actor_cfg(&self, cfg: &ActorCfg) -> Result<()>;
    fn get_actor_cfg(&self, id: &Uuid) -> Result<ActorCfg>;
    fn get_actor_cfg_by_method_type(&self, mt: &MethodType) -> Result<ActorCfg>;
    fn list_actor_cfgs(&self) -> Result<Vec<ActorCfg>>;
    fn delete_actor_cfg_by_method_type(&self, mt: &MethodType) -> Result<()>;
    fn update_select_spec(&self, id: &Uuid, update: &SelectSpecUpdate) -> Result<()>;
}

/// The four sub-repositories, as seen from inside a transaction.
pub trait TxRepo: Send + Sync {
    fn message_repo(&self) -> &dyn MessageRepo;
    fn address_repo(&self) -> &dyn AddressRepo;
    fn shared_params_repo(&self) -> &dyn SharedParamsRepo;
    fn actor_cfg_repo(&self) -> &dyn ActorCfgRepo;
}

/// The full repository: sub-repositories plus transactional batch updates.
pub trait Repo: TxRepo {
    /// Run `f` against a transactional handle. Any error inside `f` reverts
    /// every write made through the handle.
    fn transaction(
        &self,
        f: &mut dyn FnMut(&dyn TxRepo) -> Result<()>,
    ) -> Result<()>;
}
