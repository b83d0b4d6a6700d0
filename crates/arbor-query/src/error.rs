// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error types of the query core.
use thiserror::Error;

use crate::storage::StorageError;

/// Malformed GetSpec or filter. Reported to the caller; aborts that query only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// `$filter` could not be parsed.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    /// Filter operator not supported for the given field or value.
    #[error("unsupported operator {operator} on field {field}")]
    UnsupportedOperator {
        /// Operator as written.
        operator: String,
        /// Field the operator was applied to.
        field: String,
    },
    /// Filter leaf names a field no type declares.
    #[error("unknown field {0} in filter")]
    UnknownFilterField(String),
    /// Filter or `$inherit` names a type the schema does not know.
    #[error("unknown type {0}")]
    UnknownType(String),
    /// `$list` and `$find` at the same level.
    #[error("if using $list put $find in list (at {0:?})")]
    ListWithFind(String),
    /// `$find` or `$list` with no traversal to follow.
    #[error("$find or $list at {0:?} needs traverse")]
    NeedsTraverse(String),
    /// A directive has the wrong shape.
    #[error("invalid {directive} at {path:?}: {reason}")]
    InvalidDirective {
        /// Directive key (`$inherit`, `$sort`, ...).
        directive: &'static str,
        /// Field path the directive sits under.
        path: String,
        /// What is wrong with it.
        reason: String,
    },
    /// A literal directive (`$field`, `$value`) shares its object with field selections.
    #[error("{directive} at {path:?} cannot be combined with field selections")]
    MixedDirective {
        /// Literal directive key.
        directive: &'static str,
        /// Field path.
        path: String,
    },
    /// Unknown `$` key.
    #[error("unknown directive {key} at {path:?}")]
    UnknownDirective {
        /// Key as written.
        key: String,
        /// Field path.
        path: String,
    },
    /// `$language` is not configured in the schema.
    #[error("unsupported language {0}")]
    UnsupportedLanguage(String),
    /// `$db` names a database with no schema.
    #[error("no schema for database {0}")]
    UnknownDatabase(String),
    /// The GetSpec nests deeper than the parser accepts.
    #[error("get spec nested deeper than {0} levels")]
    TooDeep(usize),
}

/// Failure of a whole query execution. No partial results are returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// Compilation of a (nested) GetSpec failed.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// A storage call failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}
