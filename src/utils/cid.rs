// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_encoding::DAG_CBOR;
use multihash_codetable::{Code, MultihashDigest};
use serde::Serialize;

/// Extension methods for constructing `dag-cbor` [Cid]
pub trait CidCborExt {
    /// Default CID builder for Filecoin
    fn from_cbor_blake2b256<S: Serialize>(obj: &S) -> Result<Cid, fvm_ipld_encoding::Error>;
}

impl CidCborExt for Cid {
    fn from_cbor_blake2b256<S: Serialize>(obj: &S) -> Result<Cid, fvm_ipld_encoding::Error> {
        let bytes = fvm_ipld_encoding::to_vec(obj)?;
        Ok(Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_payloads_yield_distinct_cids() {
        let a = Cid::from_cbor_blake2b256(&(1u64, "a")).unwrap();
        let b = Cid::from_cbor_blake2b256(&(2u64, "a")).unwrap();
        let a2 = Cid::from_cbor_blake2b256(&(1u64, "a")).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }
}
