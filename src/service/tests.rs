// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! End-to-end lifecycle scenarios, driven deterministically: the harness
//! ticks the selection pipeline, the publisher and the reconciler by hand
//! against the mock chain, so every assertion runs on settled state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::blocks::Tipset;
use crate::config::{AddressConfig, Config, MessageServiceConfig, PublisherConfig};
use crate::db::{AddressRepo, MemRepo, MessageRepo, SharedParamsRepo};
use crate::message::{SignedMessage, UnsignedMessage};
use crate::provider::test_provider::{TestNode, TestWallet};
use crate::provider::{HeadChange, NodeProvider};
use crate::publisher::Publisher;
use crate::reconciler::StateReconciler;
use crate::registry::{AddressRegistry, WalletHandle};
use crate::selector::worker::{SelectResult, SelectTick, Worker};
use crate::service::MessagerService;
use crate::types::{Message, MessageState, ReplaceMsgParams, SendSpec, SharedSpec};

struct Harness {
    repo: Arc<MemRepo>,
    node: Arc<TestNode>,
    wallet: Arc<TestWallet>,
    registry: Arc<AddressRegistry>,
    publisher: Publisher,
    reconciler: StateReconciler,
    cfg: Arc<MessageServiceConfig>,
    msg_tx: mpsc::Sender<Vec<SignedMessage>>,
    // keeps the workers' emit channel open, drained nowhere: the harness
    // publishes batches by hand for determinism
    _msg_rx: mpsc::Receiver<Vec<SignedMessage>>,
}

async fn harness(addrs: &[Address]) -> Harness {
    let repo = Arc::new(MemRepo::new());
    let node = Arc::new(TestNode::new());
    let wallet = Arc::new(TestWallet::new(addrs.to_vec()));
    for addr in addrs {
        node.set_actor(*addr, 0, TokenAmount::from_atto(u64::MAX));
    }
    let registry = AddressRegistry::new(
        repo.clone(),
        node.clone(),
        vec![WalletHandle {
            id: Uuid::new_v4(),
            name: "default".into(),
            api: wallet.clone(),
        }],
        AddressConfig {
            remote_wallet_sweep_interval: Duration::from_millis(50),
            amend_retry_delay: Duration::from_millis(30),
        },
    );
    registry.sweep().await;
    let cfg = Arc::new(MessageServiceConfig::default());
    let (publisher, _) = Publisher::new(
        node.clone(),
        PublisherConfig {
            buffer: 1024,
            ..PublisherConfig::default()
        },
    );
    let (msg_tx, msg_rx) = mpsc::channel(1024);
    Harness {
        reconciler: StateReconciler::new(repo.clone(), node.clone(), cfg.clone(), 30),
        repo,
        node,
        wallet,
        registry,
        publisher,
        cfg,
        msg_tx,
        _msg_rx: msg_rx,
    }
}

impl Harness {
    fn push_unfill(&self, id: &str, from: Address) -> Message {
        let unsigned =
            UnsignedMessage::transfer(from, Address::new_id(900), TokenAmount::from_atto(1));
        let msg = Message::new_unfill(id, unsigned, SendSpec::default(), "default");
        self.repo.create_message(&msg).unwrap();
        msg
    }

    fn worker(&self, addr: Address) -> Worker {
        Worker {
            addr,
            repo: self.repo.clone(),
            node: self.node.clone(),
            registry: self.registry.clone(),
            cfg: self.cfg.clone(),
            msg_tx: self.msg_tx.clone(),
        }
    }

    /// One selection tick for one sender, persisted, nothing emitted yet.
    async fn select(&self, addr: Address, ts: &Arc<Tipset>) -> SelectResult {
        let worker = self.worker(addr);
        let addr_info = self.repo.get_address(&addr).unwrap();
        let shared = self
            .repo
            .get_shared_params()
            .unwrap_or_else(|_| SharedSpec::default());
        let sel_msg_num = if addr_info.sel_msg_num == 0 {
            shared.sel_msg_num
        } else {
            addr_info.sel_msg_num
        };
        let tick = SelectTick {
            applied: Arc::new(HashMap::new()),
            addr_info,
            tipset: ts.clone(),
            sel_msg_num,
            shared: Arc::new(shared),
        };
        let result = worker.select(tick).await.unwrap();
        worker.save_selected(&result).unwrap();
        result
    }

    /// Selection tick plus mempool publication for a set of senders.
    async fn select_and_publish(&self, addrs: &[Address], ts: &Arc<Tipset>) {
        for addr in addrs {
            let result = self.select(*addr, ts).await;
            let mut batch = result.to_push;
            batch.extend(result.selected.iter().filter_map(Message::signed_message));
            if !batch.is_empty() {
                self.publisher.publish_batch(batch).await;
            }
        }
    }

    async fn apply(&self, ts: &Arc<Tipset>) {
        self.reconciler
            .process_head_change(&HeadChange {
                applied: vec![ts.clone()],
                reverted: vec![],
            })
            .await
            .unwrap();
    }

    async fn revert(&self, tipsets: Vec<Arc<Tipset>>) {
        self.reconciler
            .process_head_change(&HeadChange {
                applied: vec![],
                reverted: tipsets,
            })
            .await
            .unwrap();
    }
}

fn senders(n: u64) -> Vec<Address> {
    (0..n).map(|i| Address::new_id(1000 + i)).collect()
}

/// Ten senders, ten messages each; the chain advances and every message
/// reaches `OnChain` with the linkage the receipt lookup reports.
#[tokio::test]
async fn normal_flow_delivers_every_message() {
    let addrs = senders(10);
    let h = harness(&addrs).await;
    for addr in &addrs {
        for i in 0..10 {
            h.push_unfill(&format!("{addr}-{i}"), *addr);
        }
    }

    let head = h.node.head();
    h.select_and_publish(&addrs, &head).await;
    let mined = h.node.advance();
    h.apply(&mined).await;

    for addr in &addrs {
        for i in 0..10 {
            let msg = h.repo.get_message(&format!("{addr}-{i}")).unwrap();
            assert_eq!(msg.state, MessageState::OnChain, "message {}", msg.id);
            let lookup = h
                .node
                .state_search_msg(&msg.signed_cid.unwrap())
                .await
                .unwrap()
                .expect("landed message has a lookup");
            assert_eq!(msg.height, lookup.height);
            assert_eq!(msg.tipset_key, lookup.tipset);
            assert_eq!(msg.receipt.as_ref(), Some(&lookup.receipt));
        }
        // contiguous nonces 0..10 were assigned
        let mut nonces: Vec<u64> = h
            .repo
            .list_messages_by_address(addr)
            .unwrap()
            .iter()
            .map(Message::nonce)
            .collect();
        nonces.sort_unstable();
        assert_eq!(nonces, (0..10).collect::<Vec<_>>());
        assert_eq!(h.repo.get_address(addr).unwrap().nonce, 10);
    }
}

/// After landing, three tipsets are reverted: their messages return to
/// `Fill`, get re-pushed and land again on the new branch.
#[tokio::test]
async fn reorg_repushes_and_relands_messages() {
    let addrs = senders(5);
    let h = harness(&addrs).await;

    let mut mined = Vec::new();
    for round in 0..3 {
        for addr in &addrs {
            for i in 0..4 {
                h.push_unfill(&format!("{addr}-{round}-{i}"), *addr);
            }
        }
        let head = h.node.head();
        h.select_and_publish(&addrs, &head).await;
        let ts = h.node.advance();
        h.apply(&ts).await;
        mined.push(ts);
    }
    let all_ids: Vec<String> = h.repo.list_messages().unwrap().iter().map(|m| m.id.clone()).collect();
    assert_eq!(all_ids.len(), 60);

    let reverted = h.node.revert(3);
    assert_eq!(reverted.len(), 3);
    h.revert(reverted).await;

    let back_to_fill = h
        .repo
        .list_messages()
        .unwrap()
        .iter()
        .filter(|m| m.state == MessageState::Fill)
        .count();
    assert!(back_to_fill > 1, "a reorg of three tipsets reverts messages");

    // the next ticks re-push everything and the new branch absorbs it
    for _ in 0..3 {
        let head = h.node.head();
        h.select_and_publish(&addrs, &head).await;
        let ts = h.node.advance();
        h.apply(&ts).await;
    }
    for id in all_ids {
        let msg = h.repo.get_message(&id).unwrap();
        assert_eq!(msg.state, MessageState::OnChain, "message {id}");
        assert!(!msg.tipset_key.is_empty());
    }
}

/// Out-of-band replacements land for twenty filled messages; those twenty
/// flip to `NonceConflict` untouched while the replacements' receipts are
/// recorded on chain.
#[tokio::test]
async fn external_replacement_flags_nonce_conflicts() {
    let addrs = senders(10);
    let h = harness(&addrs).await;
    for addr in &addrs {
        for i in 0..20 {
            h.push_unfill(&format!("{addr}-{i}"), *addr);
        }
    }
    let head = h.node.head();
    for addr in &addrs {
        let result = h.select(*addr, &head).await;
        assert_eq!(result.selected.len(), 20);
        assert!(result.errors.is_empty());
        let batch: Vec<SignedMessage> = result
            .selected
            .iter()
            .filter_map(Message::signed_message)
            .collect();
        h.publisher.publish_batch(batch).await;
    }

    // two conflicting sends per sender: same (from, nonce), different
    // method, enough of a premium bump to win replace-by-fee
    let mut conflicted: Vec<(String, SignedMessage)> = Vec::new();
    for addr in &addrs {
        let filled = h.repo.list_filled_messages(addr).unwrap();
        for ours in filled.iter().take(2) {
            let mut replacement = ours.message.clone();
            replacement.method_num = 1;
            replacement.gas_limit = replacement.gas_limit * 3 / 2;
            replacement.gas_fee_cap = replacement.gas_fee_cap.clone() * 2u64;
            replacement.gas_premium = replacement.gas_premium.clone() * 2u64;
            let smsg = SignedMessage::new_from_parts(
                replacement,
                ours.signature.clone().expect("filled message is signed"),
            );
            h.node.push_external(smsg.clone());
            conflicted.push((ours.id.clone(), smsg));
        }
    }
    assert_eq!(conflicted.len(), 20);

    let mined = h.node.advance();
    h.apply(&mined).await;

    for (id, replacement) in &conflicted {
        let ours = h.repo.get_message(id).unwrap();
        assert_eq!(ours.state, MessageState::NonceConflict, "message {id}");
        assert!(ours.error_msg.contains("replaced on chain"));
        // our copy is untouched apart from the state flip
        assert_ne!(Some(replacement.cid().unwrap()), ours.signed_cid);

        let lookup = h
            .node
            .state_search_msg(&replacement.cid().unwrap())
            .await
            .unwrap()
            .expect("replacement landed");
        assert_eq!(lookup.height, mined.epoch());
    }
    let on_chain = h
        .repo
        .list_messages()
        .unwrap()
        .iter()
        .filter(|m| m.state == MessageState::OnChain)
        .count();
    assert_eq!(on_chain, 180);
}

/// A candidate the estimator rejects keeps `UnFill` plus an error string;
/// the next candidate takes the nonce instead.
#[tokio::test]
async fn estimation_failure_skips_candidate_without_burning_nonce() {
    let addrs = senders(1);
    let from = addrs[0];
    let h = harness(&addrs).await;

    let mut bad = h.push_unfill("bad", from);
    bad.message.gas_limit = -1;
    bad.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
    h.repo.save_message(&bad).unwrap();
    h.push_unfill("good", from);

    let head = h.node.head();
    let result = h.select(from, &head).await;
    assert_eq!(result.selected.len(), 1);
    assert_eq!(result.selected[0].id, "good");
    assert_eq!(result.selected[0].nonce(), 0);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].id, "bad");

    let bad_after = h.repo.get_message("bad").unwrap();
    assert_eq!(bad_after.state, MessageState::UnFill);
    assert!(
        bad_after.error_msg.starts_with("gas estimate: "),
        "got {:?}",
        bad_after.error_msg
    );

    let batch: Vec<SignedMessage> = result
        .selected
        .iter()
        .filter_map(Message::signed_message)
        .collect();
    h.publisher.publish_batch(batch).await;
    let mined = h.node.advance();
    h.apply(&mined).await;
    assert_eq!(
        h.repo.get_message("good").unwrap().state,
        MessageState::OnChain
    );
}

/// The remote wallet drops an address: unfilled messages flip to
/// `NoWallet` within one sweep, and once the last fill lands the address
/// leaves the cache.
#[tokio::test]
async fn wallet_removal_parks_then_retires_the_address() {
    let addrs = senders(1);
    let from = addrs[0];
    let h = harness(&addrs).await;

    for i in 0..3 {
        h.push_unfill(&format!("fill-{i}"), from);
    }
    let head = h.node.head();
    h.select_and_publish(&addrs, &head).await;
    for i in 0..5 {
        h.push_unfill(&format!("unfill-{i}"), from);
    }
    assert_eq!(h.repo.list_filled_messages(&from).unwrap().len(), 3);

    let cancel = CancellationToken::new();
    let tasks = h.registry.start(cancel.clone());
    h.wallet.remove_address(&from);
    h.registry.sweep().await;

    for i in 0..5 {
        assert_eq!(
            h.repo.get_message(&format!("unfill-{i}")).unwrap().state,
            MessageState::NoWallet
        );
    }
    assert_eq!(
        h.repo.get_address(&from).unwrap().state,
        crate::types::AddressState::Notfound
    );
    // fills are still pending, the address must survive amendment
    tokio::time::sleep(Duration::from_millis(90)).await;
    assert!(h.registry.contains(&from));

    let mined = h.node.advance();
    h.apply(&mined).await;
    assert!(h.repo.list_filled_messages(&from).unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(!h.registry.contains(&from));
    assert!(!h.repo.has_address(&from).unwrap());

    cancel.cancel();
    for t in tasks {
        let _ = t.await;
    }
}

/// Out-of-band sends moved the actor nonce ahead of our cursor; the next
/// tick jumps the cursor forward and assigns from there.
#[tokio::test]
async fn nonce_jump_follows_chain_state() {
    let addrs = senders(1);
    let from = addrs[0];
    let h = harness(&addrs).await;
    h.repo.update_nonce(&from, 10).unwrap();
    h.node.set_actor(from, 15, TokenAmount::from_atto(u64::MAX));

    h.push_unfill("m", from);
    let head = h.node.head();
    let result = h.select(from, &head).await;

    assert_eq!(result.selected.len(), 1);
    assert_eq!(result.selected[0].nonce(), 15);
    assert_eq!(h.repo.get_address(&from).unwrap().nonce, 16);
}

/// Re-push includes exactly the fills at or above the on-chain nonce.
#[tokio::test]
async fn repush_set_respects_the_chain_nonce() {
    let addrs = senders(1);
    let from = addrs[0];
    let h = harness(&addrs).await;
    for i in 0..4 {
        h.push_unfill(&format!("m{i}"), from);
    }
    let head = h.node.head();
    h.select(from, &head).await;
    assert_eq!(h.repo.list_filled_messages(&from).unwrap().len(), 4);

    // nonces 0 and 1 land out-of-band (e.g. another relay pushed them)
    h.node.set_actor(from, 2, TokenAmount::from_atto(u64::MAX));
    let result = h.select(from, &head).await;
    let mut repush: Vec<u64> = result.to_push.iter().map(SignedMessage::sequence).collect();
    repush.sort_unstable();
    assert_eq!(repush, vec![2, 3]);
}

/// A wallet rejection aborts the pipeline for the tick; nothing is filled
/// and the candidate records the signing error.
#[tokio::test]
async fn signing_rejection_aborts_the_tick() {
    let addrs = senders(1);
    let from = addrs[0];
    let h = harness(&addrs).await;
    h.push_unfill("m0", from);
    h.push_unfill("m1", from);
    h.wallet.set_reject(true);

    let head = h.node.head();
    let result = h.select(from, &head).await;
    assert!(result.selected.is_empty());
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].err.starts_with("sign msg: "));
    assert_eq!(h.repo.get_address(&from).unwrap().nonce, 0);

    let failed = h.repo.get_message(&result.errors[0].id).unwrap();
    assert_eq!(failed.state, MessageState::UnFill);
    assert!(failed.error_msg.starts_with("sign msg: "));
}

/// `replace_message` supersedes a fill in place: new row, same nonce,
/// bumped premium, old row flagged `Replaced`.
#[tokio::test]
async fn replace_message_supersedes_in_place() {
    let addrs = senders(1);
    let from = addrs[0];
    let h = harness(&addrs).await;
    let service = MessagerService::new(
        h.repo.clone(),
        h.node.clone(),
        vec![WalletHandle {
            id: Uuid::new_v4(),
            name: "default".into(),
            api: h.wallet.clone(),
        }],
        Config::default(),
    )
    .await
    .unwrap();
    service.registry().sweep().await;

    h.push_unfill("m0", from);
    let head = h.node.head();
    h.select(from, &head).await;
    let old = h.repo.get_message("m0").unwrap();

    let new = service
        .replace_message(ReplaceMsgParams {
            id: "m0".into(),
            new_id: "m0-replaced".into(),
            auto: true,
            gas_limit: 0,
            gas_fee_cap: None,
            gas_premium: None,
            max_fee: None,
            gas_over_premium: 0.0,
        })
        .await
        .unwrap();

    assert_eq!(new.nonce(), old.nonce());
    assert_eq!(new.state, MessageState::Fill);
    assert!(new.message.gas_premium > old.message.gas_premium);
    assert_eq!(
        h.repo.get_message("m0").unwrap().state,
        MessageState::Replaced
    );
    // invariant: the two rows sharing (from, nonce) are fill + replaced
    let same_nonce: Vec<MessageState> = h
        .repo
        .list_messages_by_address(&from)
        .unwrap()
        .iter()
        .filter(|m| m.nonce() == old.nonce())
        .map(|m| m.state)
        .collect();
    assert_eq!(same_nonce.len(), 2);
    assert!(same_nonce.contains(&MessageState::Fill));
    assert!(same_nonce.contains(&MessageState::Replaced));
}

/// Invariant check over several interleaved rounds: per sender, the nonces
/// held by `Fill` and `OnChain` messages form a contiguous, duplicate-free
/// range below the address cursor, and every `Fill` nonce sits below it.
#[tokio::test]
async fn nonce_set_stays_contiguous_across_rounds() {
    let addrs = senders(3);
    let h = harness(&addrs).await;

    let mut counter = 0u64;
    for round in 0..4usize {
        for (ai, addr) in addrs.iter().enumerate() {
            // skewed load per sender per round
            for _ in 0..(1 + (round + ai) % 3) {
                h.push_unfill(&format!("r{round}-{counter}"), *addr);
                counter += 1;
            }
        }
        let head = h.node.head();
        h.select_and_publish(&addrs, &head).await;
        // every other round the chain also advances and is reconciled
        if round % 2 == 0 {
            let mined = h.node.advance();
            h.apply(&mined).await;
        }
    }

    for addr in &addrs {
        let cursor = h.repo.get_address(addr).unwrap().nonce;
        let mut nonces: Vec<u64> = h
            .repo
            .list_messages_by_address(addr)
            .unwrap()
            .iter()
            .filter(|m| matches!(m.state, MessageState::Fill | MessageState::OnChain))
            .map(Message::nonce)
            .collect();
        nonces.sort_unstable();
        let expect: Vec<u64> = (0..cursor).collect();
        assert_eq!(nonces, expect, "sender {addr} has gaps or duplicates");
        for m in h.repo.list_filled_messages(addr).unwrap() {
            assert!(m.nonce() < cursor);
        }
    }
}

/// Push validation: duplicate ids and unmanaged senders are rejected
/// synchronously.
#[tokio::test]
async fn push_message_validates_input() {
    let addrs = senders(1);
    let from = addrs[0];
    let h = harness(&addrs).await;
    let service = MessagerService::new(
        h.repo.clone(),
        h.node.clone(),
        vec![WalletHandle {
            id: Uuid::new_v4(),
            name: "default".into(),
            api: h.wallet.clone(),
        }],
        Config::default(),
    )
    .await
    .unwrap();
    service.registry().sweep().await;

    let unsigned =
        UnsignedMessage::transfer(from, Address::new_id(900), TokenAmount::from_atto(1));
    service
        .push_message("m0", unsigned.clone(), SendSpec::default())
        .unwrap();
    assert!(matches!(
        service.push_message("m0", unsigned, SendSpec::default()),
        Err(crate::errors::Error::Validation(_))
    ));

    let stranger = UnsignedMessage::transfer(
        Address::new_id(4242),
        Address::new_id(900),
        TokenAmount::from_atto(1),
    );
    assert!(matches!(
        service.push_message("m1", stranger, SendSpec::default()),
        Err(crate::errors::Error::NotFound(_))
    ));
}
