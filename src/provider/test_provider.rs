// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-process doubles for the chain node and the wallet. The mock chain
//! mines whatever sits in its mempool into the next tipset, can revert
//! recent tipsets to exercise reorg handling, and broadcasts head changes
//! exactly like a real node subscription would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::receipt::Receipt;
use multihash_codetable::{Code, MultihashDigest};
use num_traits::Zero;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{
    ActorInfo, EstimateMessage, HeadChange, MsgLookup, NetworkParams, NodeProvider, SignMeta,
    TipsetMessage, WalletProvider,
};
use crate::blocks::{Tipset, TipsetKey};
use crate::errors::{Error, Result};
use crate::message::{SignedMessage, UnsignedMessage};
use crate::utils::cid::CidCborExt;

const HEAD_CHANNEL_CAPACITY: usize = 64;
const MOCK_GAS_USED: u64 = 1_000_000;

struct NodeInner {
    chain: Vec<Arc<Tipset>>,
    tipset_msgs: HashMap<TipsetKey, Vec<SignedMessage>>,
    actors: HashMap<Address, ActorInfo>,
    mpool: Vec<SignedMessage>,
    lookups: HashMap<Cid, MsgLookup>,
    base_fee: TokenAmount,
}

/// Mock chain node.
pub struct TestNode {
    inner: Mutex<NodeInner>,
    head_tx: broadcast::Sender<HeadChange>,
    mint_counter: AtomicU64,
    push_count: AtomicUsize,
    fail_push: Mutex<bool>,
    rpc_delay: Mutex<Duration>,
    block_delay_secs: u64,
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNode {
    pub fn new() -> Self {
        let (head_tx, _) = broadcast::channel(HEAD_CHANNEL_CAPACITY);
        let base_fee = TokenAmount::from_atto(100);
        let genesis = Arc::new(mock_tipset(0, &TipsetKey::default(), &base_fee, 0));
        let mut tipset_msgs = HashMap::new();
        tipset_msgs.insert(genesis.key().clone(), Vec::new());
        Self {
            inner: Mutex::new(NodeInner {
                chain: vec![genesis],
                tipset_msgs,
                actors: HashMap::new(),
                mpool: Vec::new(),
                lookups: HashMap::new(),
                base_fee,
            }),
            head_tx,
            mint_counter: AtomicU64::new(1),
            push_count: AtomicUsize::new(0),
            fail_push: Mutex::new(false),
            rpc_delay: Mutex::new(Duration::ZERO),
            block_delay_secs: 30,
        }
    }

    pub fn set_actor(&self, addr: Address, nonce: u64, balance: TokenAmount) {
        self.inner
            .lock()
            .actors
            .insert(addr, ActorInfo { nonce, balance });
    }

    pub fn set_base_fee(&self, fee: TokenAmount) {
        self.inner.lock().base_fee = fee;
    }

    pub fn set_fail_push(&self, fail: bool) {
        *self.fail_push.lock() = fail;
    }

    /// Delay injected into chain RPCs, to widen pipeline windows in tests.
    pub fn set_rpc_delay(&self, delay: Duration) {
        *self.rpc_delay.lock() = delay;
    }

    pub fn push_count(&self) -> usize {
        self.push_count.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().mpool.len()
    }

    pub fn head(&self) -> Arc<Tipset> {
        self.inner.lock().chain.last().cloned().expect("never empty")
    }

    /// Mine the mempool into the next tipset and broadcast the head change.
    /// Per sender, messages are included in nonce order starting at the
    /// current actor nonce; a gap leaves the remainder pending.
    pub fn advance(&self) -> Arc<Tipset> {
        let mint = self.mint_counter.fetch_add(1, Ordering::SeqCst);
        let (ts, hc) = {
            let mut inner = self.inner.lock();
            let parent = inner.chain.last().cloned().expect("never empty");
            let ts = Arc::new(mock_tipset(
                parent.epoch() + 1,
                parent.key(),
                &inner.base_fee.clone(),
                mint,
            ));

            let mut by_sender: HashMap<Address, Vec<SignedMessage>> = HashMap::new();
            for msg in std::mem::take(&mut inner.mpool) {
                by_sender.entry(*msg.from()).or_default().push(msg);
            }

            let mut included = Vec::new();
            let mut leftover = Vec::new();
            for (sender, mut msgs) in by_sender {
                // replace-by-fee: at equal nonce the higher premium wins,
                // the loser is dropped like a displaced mempool entry
                msgs.sort_by(|a, b| {
                    a.sequence().cmp(&b.sequence()).then_with(|| {
                        b.message
                            .gas_premium
                            .cmp(&a.message.gas_premium)
                            .then_with(|| b.message.gas_fee_cap.cmp(&a.message.gas_fee_cap))
                    })
                });
                let mut next = inner.actors.get(&sender).map(|a| a.nonce).unwrap_or(0);
                for msg in msgs {
                    if msg.sequence() == next {
                        next += 1;
                        included.push(msg);
                    } else if msg.sequence() > next {
                        leftover.push(msg);
                    }
                }
                if let Some(actor) = inner.actors.get_mut(&sender) {
                    actor.nonce = next;
                } else {
                    inner.actors.insert(
                        sender,
                        ActorInfo {
                            nonce: next,
                            balance: TokenAmount::zero(),
                        },
                    );
                }
            }
            inner.mpool = leftover;

            for msg in &included {
                let signed_cid = msg.cid().expect("cbor never fails for test messages");
                inner.lookups.insert(
                    signed_cid,
                    MsgLookup {
                        height: ts.epoch(),
                        tipset: ts.key().clone(),
                        receipt: Receipt {
                            exit_code: ExitCode::OK,
                            return_data: Default::default(),
                            gas_used: MOCK_GAS_USED + msg.sequence(),
                            events_root: None,
                        },
                    },
                );
            }
            inner.tipset_msgs.insert(ts.key().clone(), included);
            inner.chain.push(ts.clone());
            (
                ts.clone(),
                HeadChange {
                    applied: vec![ts],
                    reverted: vec![],
                },
            )
        };
        let _ = self.head_tx.send(hc);
        ts
    }

    /// Drop the last `n` tipsets. Their messages return to the mempool and
    /// the actor nonces roll back, as if the network switched branches.
    pub fn revert(&self, n: usize) -> Vec<Arc<Tipset>> {
        let (reverted, hc) = {
            let mut inner = self.inner.lock();
            let mut reverted = Vec::new();
            for _ in 0..n {
                if inner.chain.len() <= 1 {
                    break;
                }
                let ts = inner.chain.pop().expect("checked non-empty");
                // keep the tipset->messages mapping queryable, a real node
                // still serves recently reverted tipsets
                let msgs = inner.tipset_msgs.get(ts.key()).cloned().unwrap_or_default();
                for msg in msgs {
                    let signed_cid = msg.cid().expect("cbor never fails for test messages");
                    inner.lookups.remove(&signed_cid);
                    if let Some(actor) = inner.actors.get_mut(msg.from()) {
                        actor.nonce = actor.nonce.min(msg.sequence());
                    }
                    inner.mpool.push(msg);
                }
                reverted.push(ts);
            }
            // newest reverted first, the order a node reports a reorg in
            let hc = HeadChange {
                applied: vec![],
                reverted: reverted.clone(),
            };
            (reverted, hc)
        };
        if !reverted.is_empty() {
            let _ = self.head_tx.send(hc);
        }
        reverted
    }

    /// Inject a signed message into the mempool bypassing `mpool_push`, the
    /// way an out-of-band sender would.
    pub fn push_external(&self, msg: SignedMessage) {
        self.inner.lock().mpool.push(msg);
    }

    async fn simulate_latency(&self) {
        let delay = *self.rpc_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl NodeProvider for TestNode {
    async fn chain_head(&self) -> Result<Arc<Tipset>> {
        Ok(self.head())
    }

    fn subscribe_head_changes(&self) -> broadcast::Receiver<HeadChange> {
        self.head_tx.subscribe()
    }

    async fn chain_get_messages_in_tipset(&self, tsk: &TipsetKey) -> Result<Vec<TipsetMessage>> {
        let inner = self.inner.lock();
        let msgs = inner
            .tipset_msgs
            .get(tsk)
            .ok_or_else(|| Error::NotFound(format!("tipset {tsk}")))?;
        msgs.iter()
            .map(|m| {
                Ok(TipsetMessage {
                    cid: m.cid()?,
                    message: m.message.clone(),
                })
            })
            .collect()
    }

    async fn state_get_actor(&self, addr: &Address, _tsk: &TipsetKey) -> Result<ActorInfo> {
        self.simulate_latency().await;
        self.inner
            .lock()
            .actors
            .get(addr)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("actor {addr}")))
    }

    async fn gas_batch_estimate(
        &self,
        msgs: Vec<EstimateMessage>,
        _base_nonce: u64,
        _tsk: &TipsetKey,
    ) -> Result<Vec<std::result::Result<UnsignedMessage, String>>> {
        self.simulate_latency().await;
        let base_fee = self.inner.lock().base_fee.clone();
        Ok(msgs
            .into_iter()
            .map(|em| {
                let mut msg = em.msg;
                if msg.gas_limit < 0 {
                    return Err(format!("invalid gas limit {}", msg.gas_limit));
                }
                if msg.gas_limit == 0 {
                    msg.gas_limit =
                        (MOCK_GAS_USED as f64 * em.spec.gas_over_estimation.max(1.0)) as i64;
                }
                if msg.gas_premium.is_zero() {
                    let premium = (100.0 * (1.0 + em.spec.gas_over_premium)) as u64;
                    msg.gas_premium = TokenAmount::from_atto(premium);
                }
                if msg.gas_fee_cap.is_zero() {
                    msg.gas_fee_cap = base_fee.clone() + msg.gas_premium.clone();
                }
                crate::gas::cap_gas_fee(&mut msg, &em.spec.max_fee);
                Ok(msg)
            })
            .collect())
    }

    async fn mpool_push(&self, msg: &SignedMessage) -> Result<Cid> {
        self.push_count.fetch_add(1, Ordering::SeqCst);
        if *self.fail_push.lock() {
            return Err(Error::transient("mpool rejected message"));
        }
        let cid = msg.cid()?;
        let mut inner = self.inner.lock();
        let dup = inner
            .mpool
            .iter()
            .any(|m| m.cid().ok().as_ref() == Some(&cid));
        if !dup {
            inner.mpool.push(msg.clone());
        }
        Ok(cid)
    }

    async fn state_search_msg(&self, signed_cid: &Cid) -> Result<Option<MsgLookup>> {
        Ok(self.inner.lock().lookups.get(signed_cid).cloned())
    }

    async fn state_network_params(&self) -> Result<NetworkParams> {
        Ok(NetworkParams {
            network_name: "mocknet".to_string(),
            block_delay_secs: self.block_delay_secs,
        })
    }
}

fn mock_tipset(height: i64, parents: &TipsetKey, base_fee: &TokenAmount, mint: u64) -> Tipset {
    let cid = Cid::from_cbor_blake2b256(&(height, parents.to_string(), mint))
        .expect("cbor never fails for test keys");
    Tipset::new(
        TipsetKey::new(vec![cid]),
        parents.clone(),
        height,
        base_fee.clone(),
        height as u64 * 30,
    )
}

/// Mock remote wallet holding a mutable address set.
#[derive(Default)]
pub struct TestWallet {
    addrs: Mutex<Vec<Address>>,
    reject: Mutex<bool>,
}

impl TestWallet {
    pub fn new(addrs: Vec<Address>) -> Self {
        Self {
            addrs: Mutex::new(addrs),
            reject: Mutex::new(false),
        }
    }

    pub fn add_address(&self, addr: Address) {
        self.addrs.lock().push(addr);
    }

    pub fn remove_address(&self, addr: &Address) {
        self.addrs.lock().retain(|a| a != addr);
    }

    /// Make every signing request fail with an explicit rejection.
    pub fn set_reject(&self, reject: bool) {
        *self.reject.lock() = reject;
    }
}

#[async_trait]
impl WalletProvider for TestWallet {
    async fn wallet_list(&self) -> Result<Vec<Address>> {
        Ok(self.addrs.lock().clone())
    }

    async fn wallet_sign(
        &self,
        addr: &Address,
        _accounts: &[String],
        to_sign: &[u8],
        _meta: &SignMeta,
    ) -> Result<Signature> {
        if *self.reject.lock() {
            return Err(Error::Signing("rejected by policy".to_string()));
        }
        if !self.addrs.lock().contains(addr) {
            return Err(Error::Signing(format!("unknown address {addr}")));
        }
        // Deterministic stand-in signature bound to signer and payload.
        let mut seed = addr.to_bytes();
        seed.extend_from_slice(to_sign);
        let digest = Code::Blake2b256.digest(&seed);
        let mut bytes = digest.digest().to_vec();
        bytes.resize(65, 0);
        Ok(Signature::new_secp256k1(bytes))
    }
}
