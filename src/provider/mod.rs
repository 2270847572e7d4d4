// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Contracts required from the external collaborators: the chain node and
//! the remote wallet. The relay core is written against these traits; the
//! RPC transport lives outside this crate. `test_provider` carries the
//! in-process doubles used by tests and the embedded dev chain.

pub mod test_provider;
mod wallet;

pub use wallet::{SignMeta, SignType, WalletProvider};

use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::receipt::Receipt;
use tokio::sync::broadcast;

use crate::blocks::{Tipset, TipsetKey};
use crate::errors::Result;
use crate::message::{SignedMessage, UnsignedMessage};
use crate::types::SendSpec;

/// One head-change delta: tipsets dropped from the canonical chain and
/// tipsets newly applied to it, in chain order.
#[derive(Clone, Debug, Default)]
pub struct HeadChange {
    pub applied: Vec<Arc<Tipset>>,
    pub reverted: Vec<Arc<Tipset>>,
}

/// Account state of a sender at some tipset.
#[derive(Clone, Debug, PartialEq)]
pub struct ActorInfo {
    pub nonce: u64,
    pub balance: TokenAmount,
}

/// A message as returned by the node for a tipset: the wire payload plus the
/// cid it is carried under (the signed cid for secp messages).
#[derive(Clone, Debug)]
pub struct TipsetMessage {
    pub cid: Cid,
    pub message: UnsignedMessage,
}

/// One entry of a batch estimation request.
#[derive(Clone, Debug)]
pub struct EstimateMessage {
    pub msg: UnsignedMessage,
    pub spec: SendSpec,
}

/// Where and how a signed message landed on chain.
#[derive(Clone, Debug, PartialEq)]
pub struct MsgLookup {
    pub height: ChainEpoch,
    pub tipset: TipsetKey,
    pub receipt: Receipt,
}

#[derive(Clone, Debug)]
pub struct NetworkParams {
    pub network_name: String,
    pub block_delay_secs: u64,
}

/// Chain node operations the relay depends on.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    async fn chain_head(&self) -> Result<Arc<Tipset>>;

    /// Head-change events in the order the node emits them. Every subscriber
    /// gets its own buffer; a lagging subscriber loses oldest events and must
    /// re-sync from [`NodeProvider::chain_head`].
    fn subscribe_head_changes(&self) -> broadcast::Receiver<HeadChange>;

    /// All messages contained in a tipset, deduplicated, in block order.
    async fn chain_get_messages_in_tipset(&self, tsk: &TipsetKey) -> Result<Vec<TipsetMessage>>;

    /// Account state at `tsk`; an empty key resolves against the head.
    async fn state_get_actor(&self, addr: &Address, tsk: &TipsetKey) -> Result<ActorInfo>;

    /// Estimate a batch of candidates as they would apply starting at
    /// `base_nonce`. The result is index-aligned with the request; per-entry
    /// failures are strings so one bad candidate cannot sink the batch.
    async fn gas_batch_estimate(
        &self,
        msgs: Vec<EstimateMessage>,
        base_nonce: u64,
        tsk: &TipsetKey,
    ) -> Result<Vec<std::result::Result<UnsignedMessage, String>>>;

    /// Submit a signed message to the node's mempool.
    async fn mpool_push(&self, msg: &SignedMessage) -> Result<Cid>;

    /// Look up where a signed message landed, if anywhere.
    async fn state_search_msg(&self, signed_cid: &Cid) -> Result<Option<MsgLookup>>;

    async fn state_network_params(&self) -> Result<NetworkParams>;
}
