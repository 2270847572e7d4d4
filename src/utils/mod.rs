// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

pub mod cid;

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::errors::{Error, Result};

/// Retry an async operation with exponential backoff. Only transient failures
/// are retried; any other error kind is returned immediately.
pub async fn retry<F, Fut, T>(max_attempts: usize, initial_delay: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!("attempt {attempt} failed, retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map an arbitrary error into the transient kind, for RPC call sites.
pub fn transient<E: std::fmt::Display>(e: E) -> Error {
    Error::Transient(e.to_string())
}
