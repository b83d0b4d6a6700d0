// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
use arbor_query::{NodeId, StorageError};
use thiserror::Error;

/// Errors produced by the write language.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The payload is not an object or a directive has the wrong shape.
    #[error("invalid set payload: {0}")]
    InvalidPayload(String),
    /// Neither `$id` nor `type` identifies the node to write.
    #[error("set needs $id or type")]
    MissingIdentity,
    /// The type is not declared in the schema.
    #[error("unknown type {0}")]
    UnknownType(String),
    /// The field is not declared for the node's type.
    #[error("unknown field {field} on type {type_name}")]
    UnknownField {
        /// Node type.
        type_name: String,
        /// Offending field.
        field: String,
    },
    /// A text field was written with a plain string and no `$language`.
    #[error("text field {0} needs $language")]
    MissingLanguage(String),
    /// An edge names a node that does not exist.
    #[error("node {0} does not exist")]
    UnknownNode(NodeId),
    /// The root cannot be re-parented or removed.
    #[error("the root node cannot be {0}")]
    RootImmutable(&'static str),
    /// The write could not reach the underlying tables.
    #[error(transparent)]
    Storage(#[from] StorageError),
}
