// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// The outcomes that end a transaction attempt early.
///
/// None of these escapes [`crate::Thread::transaction`]; they drive the
/// re-execution loop. A body closure should propagate them with `?` and
/// otherwise never construct them itself, except through [`crate::Tx::retry`].
#[derive(DeriveError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// A conflicting access was detected and the attempt must restart.
    #[error("conflicting access, transaction restarts")]
    Conflict,

    /// A peer transaction aborted this one remotely.
    #[error("aborted by peer transaction")]
    Aborted,

    /// The transaction asked to block until one of its read values changes.
    #[error("retry requested on current read set")]
    Retry,

    /// A transaction log outgrew its hard bound.
    #[error("transaction log capacity exceeded")]
    Capacity,
}

/// Errors surfaced to the caller of the runtime facade.
#[derive(DeriveError, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// An unknown value was given for a configuration selector.
    #[error("unknown {what} `{value}`")]
    Config {
        what: &'static str,
        value: String,
    },

    /// A bounded execution strategy gave up before the transaction committed.
    #[error("gave up after {0} attempts")]
    Exhausted(usize),
}
