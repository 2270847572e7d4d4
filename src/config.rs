// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub wallets: Vec<WalletConfig>,
    pub db: DbConfig,
    pub node: NodeConfig,
    pub message_service: MessageServiceConfig,
    pub address: AddressConfig,
    pub publisher: PublisherConfig,
    pub log: LogConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// A stability window at or above the block delay would never fire, so
    /// it is clamped to half the delay at startup. Returns whether the
    /// configured value changed.
    pub fn clamp_stable_duration(&mut self, block_delay_secs: u64) -> bool {
        let waiting = &mut self.message_service.waiting_chain_head_stable_duration;
        if block_delay_secs <= waiting.as_secs() {
            *waiting = Duration::from_secs(block_delay_secs / 2);
            return true;
        }
        false
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Storage backend. This build ships `memory`; SQL drivers plug in
    /// behind the repository traits.
    pub db_type: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            db_type: "memory".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub url: String,
    pub token: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub name: String,
    pub url: String,
    pub token: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageServiceConfig {
    /// Tipsets a `Fill` message may wait unobserved before it expires.
    pub message_max_age: u64,
    /// Bound on ordinary chain RPCs.
    pub default_timeout: Duration,
    /// Bound on one wallet signing request.
    pub sign_message_timeout: Duration,
    /// Bound on one batch gas estimation.
    pub estimate_message_timeout: Duration,
    /// How long the head must sit still before stability-gated actions run.
    pub waiting_chain_head_stable_duration: Duration,
}

impl Default for MessageServiceConfig {
    fn default() -> Self {
        Self {
            message_max_age: 2880,
            default_timeout: Duration::from_secs(10),
            sign_message_timeout: Duration::from_secs(20),
            estimate_message_timeout: Duration::from_secs(20),
            waiting_chain_head_stable_duration: Duration::from_secs(8),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressConfig {
    /// Cadence of the remote wallet sync tick.
    pub remote_wallet_sweep_interval: Duration,
    /// Delay before a parked address is re-checked for retirement.
    pub amend_retry_delay: Duration,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            remote_wallet_sweep_interval: Duration::from_secs(10),
            amend_retry_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Capacity of the bounded channel between workers and the publisher.
    pub buffer: usize,
    /// Forward pushed messages on a broadcast topic for observers.
    pub enable_pubsub: bool,
    /// Sign and persist but never hit the mempool. For dry runs.
    pub skip_push_message: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            buffer: 30,
            enable_pubsub: false,
            skip_push_message: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filters: Vec<LogValue>,
}

impl LogConfig {
    pub fn to_filter_string(&self) -> String {
        self.filters
            .iter()
            .map(|f| format!("{}={}", f.module, f.level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filters: vec![LogValue::new("sparrow", "info")],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogValue {
    pub module: String,
    pub level: String,
}

impl LogValue {
    pub fn new(module: &str, level: &str) -> Self {
        Self {
            module: module.to_string(),
            level: level.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_roundtrip_of_defaults() {
        let cfg = Config::default();
        let raw = toml::to_string(&cfg).expect("serialize config");
        let back: Config = toml::from_str(&raw).expect("parse config");
        assert_eq!(cfg, back);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [node]
            url = "/ip4/127.0.0.1/tcp/3453"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.node.url, "/ip4/127.0.0.1/tcp/3453");
        assert_eq!(cfg.publisher.buffer, 30);
        assert_eq!(cfg.message_service.message_max_age, 2880);
    }

    #[test]
    fn stable_duration_clamps_to_half_block_delay() {
        let mut cfg = Config::default();
        // 4s blocks on a devnet, 8s window would never fire
        assert!(cfg.clamp_stable_duration(4));
        assert_eq!(
            cfg.message_service.waiting_chain_head_stable_duration,
            Duration::from_secs(2)
        );

        let mut cfg = Config::default();
        assert!(!cfg.clamp_stable_duration(30));
        assert_eq!(
            cfg.message_service.waiting_chain_head_stable_duration,
            Duration::from_secs(8)
        );
    }
}
