// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Messager error. Component boundaries translate low-level failures into one
/// of these kinds; the API layer maps them to user-visible codes.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input from an API caller. Never retried.
    #[error("validation: {0}")]
    Validation(String),
    /// Missing row or unknown entity, distinguished from storage failures.
    #[error("not found: {0}")]
    NotFound(String),
    /// Chain node or wallet RPC failure, retriable with bounded backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// The wallet explicitly rejected a signing request.
    #[error("signing failed: {0}")]
    Signing(String),
    /// Per-candidate gas estimation failure, non-fatal for the pipeline.
    #[error("estimation failed: {0}")]
    Estimation(String),
    /// A state-machine invariant did not hold for a message.
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("db: {0}")]
    Db(#[from] crate::db::errors::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] fvm_ipld_encoding::Error),
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn other(msg: impl std::fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }

    pub fn transient(msg: impl std::fmt::Display) -> Self {
        Error::Transient(msg.to_string())
    }

    /// True when retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Transient("rpc deadline exceeded".to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
