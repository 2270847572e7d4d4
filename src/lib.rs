// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Sparrow is a durable message relay and nonce-coordination service for
//! Filecoin-like chains. Users submit unsigned messages; the service
//! assigns monotonic per-sender nonces, estimates gas in batches, obtains
//! signatures from a remote wallet, publishes to the network and tracks
//! each message across reorgs until it is confirmed, replaced or expired.

pub mod blocks;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod db;
pub mod errors;
pub mod gas;
pub mod logger;
pub mod message;
pub mod provider;
pub mod publisher;
pub mod reconciler;
pub mod registry;
pub mod selector;
pub mod service;
pub mod types;
pub mod utils;
pub mod watcher;
