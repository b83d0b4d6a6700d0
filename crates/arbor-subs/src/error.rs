// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Subscription failures.
use arbor_query::hash::HashError;
use arbor_query::{CompileError, ExecError, StorageError, SubscriptionId};
use thiserror::Error;

/// Failure of one subscription operation.
///
/// Refresh failures are caught per subscription by the drain loop and logged;
/// the subscription is retried on its next triggering write.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The GetSpec does not compile.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// Executing the GetSpec failed.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// A bookkeeping call to storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The result could not be hashed.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// An envelope or definition could not be encoded.
    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    /// A persisted definition could not be decoded.
    #[error("persisted subscription {id} is invalid: {reason}")]
    Decode {
        /// Subscription id the definition was stored under.
        id: SubscriptionId,
        /// Parser message.
        reason: String,
    },
    /// No live subscription has this id.
    #[error("unknown subscription {0}")]
    Unknown(SubscriptionId),
    /// The manager task is gone.
    #[error("subscription manager stopped")]
    Closed,
}
