// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use fvm_shared::address::Address;
use fvm_shared::crypto::signature::Signature;

use crate::errors::Result;

/// What the payload handed to the wallet is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignType {
    /// A chain message cid; `extra` carries the full CBOR payload so the
    /// custody service can inspect what it signs.
    ChainMsg,
}

#[derive(Clone, Debug)]
pub struct SignMeta {
    pub sign_type: SignType,
    pub extra: Vec<u8>,
}

/// Remote key-custody service. Keys never enter this process.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    async fn wallet_list(&self) -> Result<Vec<Address>>;

    async fn wallet_sign(
        &self,
        addr: &Address,
        accounts: &[String],
        to_sign: &[u8],
        meta: &SignMeta,
    ) -> Result<Signature>;
}
