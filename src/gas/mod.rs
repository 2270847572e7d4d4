// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Gas and fee policy. Pure merge of the three policy scopes into the
//! effective spec a message is estimated and capped with. Per field, a set
//! value at a narrower scope wins: message < address < global.

use fvm_shared::econ::TokenAmount;
#[cfg(test)]
use num_traits::Zero;

use crate::message::UnsignedMessage;
use crate::types::{AddressEntry, SendSpec, SharedSpec};

const REPLACE_BY_FEE_RATIO: f32 = 1.25;
const RBF_NUM: u64 = ((REPLACE_BY_FEE_RATIO - 1f32) * 256f32) as u64;
const RBF_DENOM: u64 = 256;

/// Minimum premium a replacement must carry to displace a message already
/// in the mempool at the same (from, nonce).
pub fn min_rbf_premium(premium: &TokenAmount) -> TokenAmount {
    let atto = premium.atto();
    TokenAmount::from_atto(atto + (atto * RBF_NUM) / RBF_DENOM + 1)
}

/// The effective gas policy for one candidate message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GasSpec {
    pub gas_over_estimation: f64,
    pub gas_over_premium: f64,
    pub max_fee: Option<TokenAmount>,
    pub gas_fee_cap: Option<TokenAmount>,
    pub base_fee: Option<TokenAmount>,
}

fn is_set(amount: &Option<TokenAmount>) -> bool {
    amount.as_ref().is_some_and(|v| !v.is_zero())
}

/// Merge the global spec, the per-message send spec and the per-address
/// policy into the spec used for estimation. No I/O.
pub fn merge_msg_spec(
    global: &SharedSpec,
    send_spec: &SendSpec,
    addr_info: &AddressEntry,
    msg: &UnsignedMessage,
) -> GasSpec {
    let mut spec = GasSpec {
        gas_over_estimation: send_spec.gas_over_estimation,
        gas_over_premium: send_spec.gas_over_premium,
        max_fee: send_spec.max_fee.clone(),
        gas_fee_cap: None,
        base_fee: None,
    };

    if send_spec.gas_over_estimation == 0.0 {
        if addr_info.gas_over_estimation != 0.0 {
            spec.gas_over_estimation = addr_info.gas_over_estimation;
        } else {
            spec.gas_over_estimation = global.gas_over_estimation;
        }
    }

    if !is_set(&send_spec.max_fee) {
        if is_set(&addr_info.max_fee) {
            spec.max_fee = addr_info.max_fee.clone();
        } else {
            spec.max_fee = global.max_fee.clone();
        }
    }

    if msg.gas_fee_cap.is_zero() {
        if is_set(&addr_info.gas_fee_cap) {
            spec.gas_fee_cap = addr_info.gas_fee_cap.clone();
        } else {
            spec.gas_fee_cap = global.gas_fee_cap.clone();
        }
    }

    if send_spec.gas_over_premium == 0.0 {
        if addr_info.gas_over_premium != 0.0 {
            spec.gas_over_premium = addr_info.gas_over_premium;
        } else if global.gas_over_premium != 0.0 {
            spec.gas_over_premium = global.gas_over_premium;
        }
    }

    if is_set(&addr_info.base_fee) {
        spec.base_fee = addr_info.base_fee.clone();
    } else {
        spec.base_fee = global.base_fee.clone();
    }

    spec
}

/// Clamp the message's total fee to `max_fee`, reducing the fee cap and, if
/// needed, the premium. A zero or unset `max_fee` leaves the message alone.
pub fn cap_gas_fee(msg: &mut UnsignedMessage, max_fee: &Option<TokenAmount>) {
    let Some(max_fee) = max_fee else {
        return;
    };
    if max_fee.is_zero() || msg.gas_limit <= 0 {
        return;
    }

    let gas_limit = msg.gas_limit as u64;
    let total_fee = msg.gas_fee_cap.clone() * gas_limit;
    if total_fee <= *max_fee {
        return;
    }

    msg.gas_fee_cap = TokenAmount::from_atto(max_fee.atto() / gas_limit);
    msg.gas_premium = msg.gas_premium.clone().min(msg.gas_fee_cap.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvm_shared::address::Address;
    use uuid::Uuid;

    fn addr_entry() -> AddressEntry {
        AddressEntry::new(Address::new_id(100), 0, Uuid::new_v4(), "w")
    }

    fn msg() -> UnsignedMessage {
        UnsignedMessage::transfer(
            Address::new_id(100),
            Address::new_id(101),
            TokenAmount::from_atto(1),
        )
    }

    fn shared() -> SharedSpec {
        SharedSpec {
            gas_over_estimation: 1.25,
            gas_over_premium: 1.5,
            max_fee: Some(TokenAmount::from_atto(1000)),
            gas_fee_cap: Some(TokenAmount::from_atto(500)),
            base_fee: Some(TokenAmount::from_atto(100)),
            ..SharedSpec::default()
        }
    }

    #[test]
    fn global_applies_when_nothing_narrower_is_set() {
        let spec = merge_msg_spec(&shared(), &SendSpec::default(), &addr_entry(), &msg());
        assert_eq!(spec.gas_over_estimation, 1.25);
        assert_eq!(spec.gas_over_premium, 1.5);
        assert_eq!(spec.max_fee, Some(TokenAmount::from_atto(1000)));
        assert_eq!(spec.gas_fee_cap, Some(TokenAmount::from_atto(500)));
        assert_eq!(spec.base_fee, Some(TokenAmount::from_atto(100)));
    }

    #[test]
    fn address_overrides_global() {
        let mut addr = addr_entry();
        addr.gas_over_estimation = 2.0;
        addr.max_fee = Some(TokenAmount::from_atto(700));
        addr.base_fee = Some(TokenAmount::from_atto(70));
        let spec = merge_msg_spec(&shared(), &SendSpec::default(), &addr, &msg());
        assert_eq!(spec.gas_over_estimation, 2.0);
        assert_eq!(spec.max_fee, Some(TokenAmount::from_atto(700)));
        assert_eq!(spec.base_fee, Some(TokenAmount::from_atto(70)));
    }

    #[test]
    fn message_overrides_address_and_global() {
        let mut addr = addr_entry();
        addr.gas_over_estimation = 2.0;
        addr.max_fee = Some(TokenAmount::from_atto(700));
        let send = SendSpec {
            gas_over_estimation: 3.0,
            gas_over_premium: 0.0,
            max_fee: Some(TokenAmount::from_atto(10)),
        };
        let spec = merge_msg_spec(&shared(), &send, &addr, &msg());
        assert_eq!(spec.gas_over_estimation, 3.0);
        assert_eq!(spec.max_fee, Some(TokenAmount::from_atto(10)));
        // premium multiplier was unset on the message, falls through.
        assert_eq!(spec.gas_over_premium, 1.5);
    }

    #[test]
    fn message_level_fee_cap_suppresses_policy_cap() {
        let mut m = msg();
        m.gas_fee_cap = TokenAmount::from_atto(123);
        let spec = merge_msg_spec(&shared(), &SendSpec::default(), &addr_entry(), &m);
        // The message already carries a cap, policy must not override it.
        assert_eq!(spec.gas_fee_cap, None);
    }

    #[test]
    fn zero_amount_counts_as_unset() {
        let send = SendSpec {
            max_fee: Some(TokenAmount::zero()),
            ..SendSpec::default()
        };
        let spec = merge_msg_spec(&shared(), &send, &addr_entry(), &msg());
        assert_eq!(spec.max_fee, Some(TokenAmount::from_atto(1000)));
    }

    #[test]
    fn cap_gas_fee_reduces_cap_and_premium() {
        let mut m = msg();
        m.gas_limit = 100;
        m.gas_fee_cap = TokenAmount::from_atto(50);
        m.gas_premium = TokenAmount::from_atto(40);
        cap_gas_fee(&mut m, &Some(TokenAmount::from_atto(1000)));
        assert_eq!(m.gas_fee_cap, TokenAmount::from_atto(10));
        assert_eq!(m.gas_premium, TokenAmount::from_atto(10));
    }

    #[test]
    fn cap_gas_fee_leaves_cheap_messages_alone() {
        let mut m = msg();
        m.gas_limit = 10;
        m.gas_fee_cap = TokenAmount::from_atto(5);
        m.gas_premium = TokenAmount::from_atto(2);
        let before = m.clone();
        cap_gas_fee(&mut m, &Some(TokenAmount::from_atto(1000)));
        assert_eq!(m, before);
        cap_gas_fee(&mut m, &None);
        assert_eq!(m, before);
    }

    #[test]
    fn rbf_floor_is_a_quarter_above_plus_one() {
        let floor = min_rbf_premium(&TokenAmount::from_atto(100));
        assert_eq!(floor, TokenAmount::from_atto(126));
    }

    mod properties {
        use super::*;
        use quickcheck_macros::quickcheck;

        #[quickcheck]
        fn narrower_scope_wins_for_over_estimation(msg_v: u8, addr_v: u8, global_v: u8) -> bool {
            let send = SendSpec {
                gas_over_estimation: msg_v as f64,
                ..SendSpec::default()
            };
            let mut addr = addr_entry();
            addr.gas_over_estimation = addr_v as f64;
            let global = SharedSpec {
                gas_over_estimation: global_v as f64,
                ..SharedSpec::default()
            };
            let got = merge_msg_spec(&global, &send, &addr, &msg()).gas_over_estimation;
            let want = if msg_v != 0 {
                msg_v as f64
            } else if addr_v != 0 {
                addr_v as f64
            } else {
                global_v as f64
            };
            got == want
        }

        #[quickcheck]
        fn capped_total_fee_never_exceeds_max(limit: u16, cap: u32, max: u32) -> bool {
            let mut m = msg();
            m.gas_limit = limit as i64;
            m.gas_fee_cap = TokenAmount::from_atto(cap as u64);
            let max_fee = TokenAmount::from_atto(max as u64 + 1);
            cap_gas_fee(&mut m, &Some(max_fee.clone()));
            if m.gas_limit <= 0 {
                return true;
            }
            m.gas_fee_cap * (m.gas_limit as u64) <= max_fee
        }
    }
}
