// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Node and subscription identifiers.
use std::fmt;

use serde::{Deserialize, Serialize};

/// Length of the type prefix that leads every node id (`"te"` in `"te1"`).
pub const TYPE_PREFIX_LEN: usize = 2;

/// Id of the hierarchy root node.
pub const ROOT_ID: &str = "root";

/// Type prefix reported for the root node.
pub const ROOT_PREFIX: &str = "ro";

/// Identifier of a node in the hierarchy.
///
/// Ids are opaque strings whose first two characters name the node type
/// (`"ma1"` is a `match` when the schema maps prefix `ma` to `match`). The
/// root node is the only exception and is always [`ROOT_ID`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wraps a raw id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The root node id.
    pub fn root() -> Self {
        Self(ROOT_ID.to_owned())
    }

    /// Returns `true` for the hierarchy root.
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_ID
    }

    /// Two-character type prefix (`"ro"` for the root).
    pub fn type_prefix(&self) -> &str {
        if self.is_root() {
            return ROOT_PREFIX;
        }
        self.0
            .char_indices()
            .nth(TYPE_PREFIX_LEN)
            .map_or(self.0.as_str(), |(end, _)| &self.0[..end])
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a live subscription (hex digest of its GetSpec).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Wraps a raw subscription id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_prefix_takes_first_two_chars() {
        assert_eq!(NodeId::new("te1").type_prefix(), "te");
        assert_eq!(NodeId::new("maABCDEF").type_prefix(), "ma");
        assert_eq!(NodeId::root().type_prefix(), ROOT_PREFIX);
    }

    #[test]
    fn short_ids_do_not_panic() {
        assert_eq!(NodeId::new("t").type_prefix(), "t");
        assert_eq!(NodeId::new("").type_prefix(), "");
    }
}
