// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod signed_message;
mod unsigned_message;

pub use signed_message::SignedMessage;
pub use unsigned_message::UnsignedMessage;
