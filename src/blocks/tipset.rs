// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;

use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use serde::{Deserialize, Serialize};

/// A set of CIDs forming a unique key for a Tipset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TipsetKey {
    cids: Vec<Cid>,
}

impl TipsetKey {
    pub fn new(cids: Vec<Cid>) -> Self {
        Self { cids }
    }

    pub fn cids(&self) -> &[Cid] {
        &self.cids
    }

    /// An empty key denotes "resolve against the current head" in node RPCs.
    pub fn is_empty(&self) -> bool {
        self.cids.is_empty()
    }
}

impl fmt::Display for TipsetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cids: Vec<String> = self.cids.iter().map(|c| c.to_string()).collect();
        write!(f, "{{{}}}", cids.join(","))
    }
}

impl From<&[Cid]> for TipsetKey {
    fn from(cids: &[Cid]) -> Self {
        Self {
            cids: cids.to_vec(),
        }
    }
}

/// A set of blocks at the same height, the chain's unit of head. The relay
/// only needs the head-shaped view a node returns over RPC: the key, the
/// parent linkage, the epoch and the parent base fee used for gas gating.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tipset {
    key: TipsetKey,
    parents: TipsetKey,
    height: ChainEpoch,
    parent_base_fee: TokenAmount,
    min_timestamp: u64,
}

impl Tipset {
    pub fn new(
        key: TipsetKey,
        parents: TipsetKey,
        height: ChainEpoch,
        parent_base_fee: TokenAmount,
        min_timestamp: u64,
    ) -> Self {
        Self {
            key,
            parents,
            height,
            parent_base_fee,
            min_timestamp,
        }
    }

    pub fn key(&self) -> &TipsetKey {
        &self.key
    }

    pub fn parents(&self) -> &TipsetKey {
        &self.parents
    }

    pub fn epoch(&self) -> ChainEpoch {
        self.height
    }

    pub fn parent_base_fee(&self) -> &TokenAmount {
        &self.parent_base_fee
    }

    pub fn min_timestamp(&self) -> u64 {
        self.min_timestamp
    }
}

impl PartialEq for Tipset {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Tipset {}
