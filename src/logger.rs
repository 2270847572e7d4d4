// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::LogConfig;

/// Console logger. `RUST_LOG` overrides the configured directive list.
pub fn setup_logger(cfg: &LogConfig) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(get_env_filter(cfg)))
        .init();
}

fn get_env_filter(cfg: &LogConfig) -> EnvFilter {
    use std::env::{self, VarError};
    match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(s) => EnvFilter::new(s),
        Err(VarError::NotPresent) => {
            EnvFilter::try_new(cfg.to_filter_string()).unwrap_or_default()
        }
        Err(VarError::NotUnicode(_)) => EnvFilter::default(),
    }
}
