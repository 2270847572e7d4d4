// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::econ::TokenAmount;
use fvm_shared::{MethodNum, METHOD_SEND};

use crate::errors::Result;
use crate::utils::cid::CidCborExt;

/// Unsigned VM message, carrying all data needed for a state transition.
/// Serialized as a CBOR tuple in canonical field order; the content address
/// of that encoding is the message's unsigned CID.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct UnsignedMessage {
    pub version: u64,
    pub to: Address,
    pub from: Address,
    pub sequence: u64,
    pub value: TokenAmount,
    pub gas_limit: i64,
    pub gas_fee_cap: TokenAmount,
    pub gas_premium: TokenAmount,
    pub method_num: MethodNum,
    pub params: RawBytes,
}

impl UnsignedMessage {
    /// A bare value transfer with no gas fields filled in.
    pub fn transfer(from: Address, to: Address, value: TokenAmount) -> Self {
        Self {
            version: 0,
            to,
            from,
            sequence: 0,
            value,
            gas_limit: 0,
            gas_fee_cap: TokenAmount::default(),
            gas_premium: TokenAmount::default(),
            method_num: METHOD_SEND,
            params: RawBytes::default(),
        }
    }

    pub fn marshal_cbor(&self) -> Result<Vec<u8>> {
        Ok(fvm_ipld_encoding::to_vec(self)?)
    }

    pub fn cid(&self) -> Result<Cid> {
        Ok(Cid::from_cbor_blake2b256(self)?)
    }

    /// Funds the sender must hold for this message to be admitted:
    /// transferred value plus the worst-case gas cost.
    pub fn required_funds(&self) -> TokenAmount {
        let gas: BigInt = self.gas_fee_cap.atto() * self.gas_limit.max(0);
        self.value.clone() + TokenAmount::from_atto(gas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(sequence: u64) -> UnsignedMessage {
        let mut m = UnsignedMessage::transfer(
            Address::new_id(1000),
            Address::new_id(1001),
            TokenAmount::from_atto(42),
        );
        m.sequence = sequence;
        m
    }

    #[test]
    fn cid_is_stable_and_nonce_sensitive() {
        assert_eq!(msg(0).cid().unwrap(), msg(0).cid().unwrap());
        assert_ne!(msg(0).cid().unwrap(), msg(1).cid().unwrap());
    }

    #[test]
    fn cbor_roundtrip() {
        let m = msg(7);
        let bytes = m.marshal_cbor().unwrap();
        let back: UnsignedMessage = fvm_ipld_encoding::from_slice(&bytes).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn required_funds_ignores_negative_gas_limit() {
        let mut m = msg(0);
        m.gas_limit = -1;
        m.gas_fee_cap = TokenAmount::from_atto(100);
        assert_eq!(m.required_funds(), TokenAmount::from_atto(42));
    }
}
