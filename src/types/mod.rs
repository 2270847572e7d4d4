// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;

use chrono::{DateTime, Utc};
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::econ::TokenAmount;
use fvm_shared::receipt::Receipt;
use fvm_shared::MethodNum;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blocks::TipsetKey;
use crate::message::{SignedMessage, UnsignedMessage};

/// Lifecycle of a relayed message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    Unknown,
    /// Newly accepted, no nonce, no signature.
    UnFill,
    /// Nonce assigned, gas estimated, signed, not yet observed on chain.
    Fill,
    /// Included in a tipset, receipt recorded.
    OnChain,
    /// Estimation or signing failed terminally, or the message expired.
    Failed,
    /// Superseded in place by a user replacement.
    Replaced,
    /// The signing wallet disappeared, signing is not currently possible.
    NoWallet,
    /// A different message with the same (from, nonce) landed on chain.
    NonceConflict,
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageState::Unknown => "Unknown",
            MessageState::UnFill => "UnFill",
            MessageState::Fill => "Fill",
            MessageState::OnChain => "OnChain",
            MessageState::Failed => "Failed",
            MessageState::Replaced => "Replaced",
            MessageState::NoWallet => "NoWallet",
            MessageState::NonceConflict => "NonceConflict",
        };
        f.write_str(s)
    }
}

impl MessageState {
    /// Terminal states are never revisited by the selector or reconciler.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageState::OnChain
                | MessageState::Failed
                | MessageState::Replaced
                | MessageState::NonceConflict
        )
    }
}

/// Per-message send policy overrides. Unset fields defer to the sender's
/// address policy and then to the shared global policy; a zero float means
/// unset, matching how callers omit the field on the wire.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SendSpec {
    pub gas_over_estimation: f64,
    pub gas_over_premium: f64,
    pub max_fee: Option<TokenAmount>,
}

/// The central entity: one user-submitted message and everything the relay
/// learns about it on the way to the chain.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// User-assigned, globally unique.
    pub id: String,
    pub message: UnsignedMessage,
    pub signature: Option<Signature>,
    pub unsigned_cid: Option<Cid>,
    pub signed_cid: Option<Cid>,
    pub height: ChainEpoch,
    pub receipt: Option<Receipt>,
    pub tipset_key: TipsetKey,
    pub send_spec: SendSpec,
    pub wallet_name: String,
    pub state: MessageState,
    pub error_msg: String,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new_unfill(
        id: impl Into<String>,
        message: UnsignedMessage,
        send_spec: SendSpec,
        wallet_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            message,
            signature: None,
            unsigned_cid: None,
            signed_cid: None,
            height: 0,
            receipt: None,
            tipset_key: TipsetKey::default(),
            send_spec,
            wallet_name: wallet_name.into(),
            state: MessageState::UnFill,
            error_msg: String::new(),
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn from(&self) -> &Address {
        &self.message.from
    }

    pub fn nonce(&self) -> u64 {
        self.message.sequence
    }

    /// The signed wire form, available once the message reached `Fill`.
    pub fn signed_message(&self) -> Option<SignedMessage> {
        self.signature
            .as_ref()
            .map(|sig| SignedMessage::new_from_parts(self.message.clone(), sig.clone()))
    }
}

/// State of a managed sender address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressState {
    Alive,
    Forbidden,
    Notfound,
}

/// A managed sender row: the nonce cursor plus per-address gas policy.
#[derive(Clone, Debug, PartialEq)]
pub struct AddressEntry {
    pub addr: Address,
    /// The next nonce the relay will assign. Monotonically non-decreasing,
    /// jumped forward to match chain state, never moved back implicitly.
    pub nonce: u64,
    pub state: AddressState,
    /// Per-address cap on in-flight messages, 0 defers to the shared value.
    pub sel_msg_num: u64,
    pub gas_over_estimation: f64,
    pub gas_over_premium: f64,
    pub max_fee: Option<TokenAmount>,
    pub gas_fee_cap: Option<TokenAmount>,
    pub base_fee: Option<TokenAmount>,
    pub wallet_id: Uuid,
    pub wallet_name: String,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AddressEntry {
    pub fn new(addr: Address, nonce: u64, wallet_id: Uuid, wallet_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            addr,
            nonce,
            state: AddressState::Alive,
            sel_msg_num: 0,
            gas_over_estimation: 0.0,
            gas_over_premium: 0.0,
            max_fee: None,
            gas_fee_cap: None,
            base_fee: None,
            wallet_id,
            wallet_name: wallet_name.into(),
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Global default gas policy and the global cap on in-flight messages per
/// sender. A single row, id 1.
#[derive(Clone, Debug, PartialEq)]
pub struct SharedSpec {
    pub id: u32,
    pub gas_over_estimation: f64,
    pub gas_over_premium: f64,
    pub max_fee: Option<TokenAmount>,
    pub gas_fee_cap: Option<TokenAmount>,
    pub base_fee: Option<TokenAmount>,
    pub sel_msg_num: u64,
}

impl Default for SharedSpec {
    fn default() -> Self {
        Self {
            id: 1,
            gas_over_estimation: 1.25,
            gas_over_premium: 0.0,
            // 0.007 whole tokens, the conventional mainnet ceiling.
            max_fee: Some(TokenAmount::from_atto(7_000_000_000_000_000u64)),
            gas_fee_cap: None,
            base_fee: None,
            sel_msg_num: 20,
        }
    }
}

/// Key of a per-actor default policy: the actor code plus the method called.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodType {
    pub code_cid: Cid,
    pub method: MethodNum,
}

/// Default policy for messages invoking a given (code, method) pair.
#[derive(Clone, Debug, PartialEq)]
pub struct ActorCfg {
    pub id: Uuid,
    pub n_version: u32,
    pub code_cid: Cid,
    pub method: MethodNum,
    pub sel_msg_num: u64,
    pub gas_over_estimation: f64,
    pub gas_over_premium: f64,
    pub max_fee: Option<TokenAmount>,
    pub gas_fee_cap: Option<TokenAmount>,
    pub base_fee: Option<TokenAmount>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActorCfg {
    pub fn method_type(&self) -> MethodType {
        MethodType {
            code_cid: self.code_cid,
            method: self.method,
        }
    }
}

/// Partial update of an actor config's selection policy. `None` leaves the
/// stored field untouched.
#[derive(Clone, Debug, Default)]
pub struct SelectSpecUpdate {
    pub sel_msg_num: Option<u64>,
    pub gas_over_estimation: Option<f64>,
    pub gas_over_premium: Option<f64>,
    pub max_fee: Option<TokenAmount>,
    pub gas_fee_cap: Option<TokenAmount>,
    pub base_fee: Option<TokenAmount>,
}

/// Parameters for replacing an in-flight message at the same (from, nonce).
#[derive(Clone, Debug)]
pub struct ReplaceMsgParams {
    /// Message being superseded; must currently be `Fill`.
    pub id: String,
    /// Identity of the replacement row.
    pub new_id: String,
    /// Re-run gas estimation instead of taking the explicit fields below.
    pub auto: bool,
    pub gas_limit: i64,
    pub gas_fee_cap: Option<TokenAmount>,
    pub gas_premium: Option<TokenAmount>,
    pub max_fee: Option<TokenAmount>,
    pub gas_over_premium: f64,
}
