// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::address::Address;
use fvm_shared::crypto::signature::{Signature, SignatureType};

use super::UnsignedMessage;
use crate::errors::Result;
use crate::utils::cid::CidCborExt;

/// A wrapped message with signature bytes.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct SignedMessage {
    pub message: UnsignedMessage,
    pub signature: Signature,
}

impl SignedMessage {
    pub fn new_from_parts(message: UnsignedMessage, signature: Signature) -> Self {
        Self { message, signature }
    }

    pub fn from(&self) -> &Address {
        &self.message.from
    }

    pub fn sequence(&self) -> u64 {
        self.message.sequence
    }

    /// BLS aggregates live in the block header, so a BLS-signed message is
    /// content-addressed by its unsigned payload alone.
    pub fn cid(&self) -> Result<Cid> {
        match self.signature.signature_type() {
            SignatureType::BLS => self.message.cid(),
            _ => Ok(Cid::from_cbor_blake2b256(self)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvm_shared::econ::TokenAmount;

    fn unsigned() -> UnsignedMessage {
        UnsignedMessage::transfer(
            Address::new_id(100),
            Address::new_id(101),
            TokenAmount::from_atto(1),
        )
    }

    #[test]
    fn secp_cid_differs_from_unsigned_cid() {
        let m = unsigned();
        let smsg = SignedMessage::new_from_parts(m.clone(), Signature::new_secp256k1(vec![1; 65]));
        assert_ne!(smsg.cid().unwrap(), m.cid().unwrap());
    }

    #[test]
    fn bls_cid_matches_unsigned_cid() {
        let m = unsigned();
        let smsg = SignedMessage::new_from_parts(m.clone(), Signature::new_bls(vec![2; 96]));
        assert_eq!(smsg.cid().unwrap(), m.cid().unwrap());
    }
}
