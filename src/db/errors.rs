// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Repository error. `NotFound` is a distinguished result, not a storage
/// failure; callers branch on it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("record not found")]
    NotFound,
    #[error("duplicate key: {0}")]
    Duplicate(String),
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn other(msg: impl std::fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }
}
