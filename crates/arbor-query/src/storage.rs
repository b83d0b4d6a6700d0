// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Storage command protocol consumed by the query core.
//!
//! The storage engine itself (hierarchy bookkeeping, the filter evaluator,
//! subscription markers, pub/sub) lives outside this crate. Everything the
//! compiler and executor need from it goes through [`Storage`].
use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::filter::FilterProgram;
use crate::ident::{NodeId, SubscriptionId};
use crate::marker::Marker;

/// Name of the hierarchy every hierarchy command operates on.
pub const HIERARCHY: &str = "___hierarchy";

/// Transport or command failure reported by the storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The engine rejected the command.
    #[error("command {command} failed: {message}")]
    Command {
        /// Command name (`hierarchy.find`, `inherit`, ...).
        command: &'static str,
        /// Engine supplied reason.
        message: String,
    },
    /// The named database does not exist.
    #[error("unknown database {0}")]
    UnknownDatabase(String),
    /// The connection to the engine is gone.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Hierarchy edge a traversal follows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Traversal {
    /// The start nodes themselves.
    Node,
    /// Direct children.
    Children,
    /// Direct parents.
    Parents,
    /// All ancestors, nearest first.
    Ancestors,
    /// All descendants, breadth first.
    Descendants,
    /// Nodes listed in a references field of the start node.
    Field(String),
}

impl Traversal {
    /// Traversal implied by a field name (`children` implies [`Traversal::Children`]).
    ///
    /// Returns `None` for names that are not hierarchy fields; custom edges are
    /// resolved against the schema by the caller.
    pub fn from_field_name(name: &str) -> Option<Self> {
        match name {
            "children" => Some(Self::Children),
            "parents" => Some(Self::Parents),
            "ancestors" => Some(Self::Ancestors),
            "descendants" => Some(Self::Descendants),
            _ => None,
        }
    }

    /// Wire name of the traversal direction.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Node => "node",
            Self::Children => "children",
            Self::Parents => "parents",
            Self::Ancestors => "ancestors",
            Self::Descendants => "descendants",
            Self::Field(name) => name,
        }
    }

    /// Field names whose modification can change the traversal's membership.
    ///
    /// Every write to an edge updates both ends, so hierarchy traversals watch
    /// `parents` and `children` alike.
    pub fn structural_fields(&self) -> Vec<String> {
        match self {
            Self::Node => Vec::new(),
            Self::Children | Self::Descendants | Self::Parents | Self::Ancestors => {
                vec!["children".to_owned(), "parents".to_owned()]
            }
            Self::Field(name) => vec![name.clone()],
        }
    }
}

impl fmt::Display for Traversal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// Sort key of a list query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sort {
    /// Field to sort by.
    pub field: String,
    /// Direction.
    pub order: Order,
}

/// What a `hierarchy.find` returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindMode {
    /// Ordered node ids.
    Ids,
    /// Object values of `field` merged across matches, earliest match wins.
    Merge {
        /// Object field to merge.
        field: String,
    },
}

/// Arguments of `hierarchy.find(db, bfs, direction, mode, rootId, filter...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindQuery {
    /// Edge to walk.
    pub direction: Traversal,
    /// Result shape.
    pub mode: FindMode,
    /// Start nodes; matches are de-duplicated across roots in order.
    pub roots: Vec<NodeId>,
    /// Filter evaluated against every candidate. The roots are candidates
    /// only for [`Traversal::Node`].
    pub filter: Option<FilterProgram>,
    /// Engine side sort. When the engine cannot sort by the key it replies
    /// with `sorted: false` and ignores `offset` and `limit`.
    pub sort: Option<Sort>,
    /// Matches to skip.
    pub offset: usize,
    /// Maximum number of matches.
    pub limit: Option<usize>,
}

impl FindQuery {
    /// Id query with no filter, sort or paging.
    pub fn ids(direction: Traversal, root: NodeId) -> Self {
        Self {
            direction,
            mode: FindMode::Ids,
            roots: vec![root],
            filter: None,
            sort: None,
            offset: 0,
            limit: None,
        }
    }
}

/// Reply of `hierarchy.find`.
#[derive(Debug, Clone, PartialEq)]
pub enum FindReply {
    /// Node ids in traversal order.
    Ids {
        /// Matching ids.
        ids: Vec<NodeId>,
        /// `true` when the engine applied the requested sort.
        sorted: bool,
    },
    /// Merged object for [`FindMode::Merge`].
    Merged(serde_json::Map<String, Value>),
}

/// One `[nodeId, field, value]` triple returned by `inherit`.
#[derive(Debug, Clone, PartialEq)]
pub struct InheritHit {
    /// Node the value was found on.
    pub node: NodeId,
    /// Field path the value was read from.
    pub field: String,
    /// Raw value.
    pub value: Value,
}

/// Kind of a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// A field changed.
    Changed,
    /// The node was removed.
    Deleted,
}

/// Notification emitted by the engine after a write.
///
/// `channel` encodes the node id and field path as `"<id>.<field.path>"`;
/// deletions use the bare id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Database written to.
    pub db: String,
    /// `"<id>.<field.path>"` or `"<id>"`.
    pub channel: String,
    /// Change kind.
    pub kind: ChangeKind,
}

impl ChangeNotification {
    /// Field change notification for `id.field`.
    pub fn changed(db: impl Into<String>, id: &NodeId, field: &str) -> Self {
        Self {
            db: db.into(),
            channel: format!("{id}.{field}"),
            kind: ChangeKind::Changed,
        }
    }

    /// Deletion notification for `id`.
    pub fn deleted(db: impl Into<String>, id: &NodeId) -> Self {
        Self {
            db: db.into(),
            channel: id.to_string(),
            kind: ChangeKind::Deleted,
        }
    }

    /// Splits the channel into node id and field path segments.
    pub fn split(&self) -> (NodeId, Vec<&str>) {
        let mut parts = self.channel.split('.');
        let id = NodeId::new(parts.next().unwrap_or_default());
        (id, parts.filter(|s| !s.is_empty()).collect())
    }
}

/// Storage engine command protocol.
///
/// Implementations must be safe to share between tasks; the query core never
/// holds a lock across a call.
#[async_trait]
pub trait Storage: Send + Sync {
    /// `hierarchy.find`: breadth-first traversal with filter, sort and paging.
    async fn find(&self, db: &str, query: &FindQuery) -> Result<FindReply, StorageError>;

    /// `inherit`: nearest-first `[node, field, value]` triples from `root` and
    /// its ancestors whose type prefix is in `type_prefixes` (any when empty).
    /// At most one hit per requested field.
    async fn inherit(
        &self,
        db: &str,
        root: &NodeId,
        type_prefixes: &[String],
        fields: &[String],
    ) -> Result<Vec<InheritHit>, StorageError>;

    /// Reads one (possibly nested) field of a node.
    async fn get_field(
        &self,
        db: &str,
        id: &NodeId,
        field: &str,
    ) -> Result<Option<Value>, StorageError>;

    /// Returns `true` when the node exists.
    async fn exists(&self, db: &str, id: &NodeId) -> Result<bool, StorageError>;

    /// Resolves an alias to a node id.
    async fn resolve_alias(&self, db: &str, alias: &str) -> Result<Option<NodeId>, StorageError>;

    /// `subscriptions.addMarker`. Returns `true` when the marker was not
    /// registered before.
    async fn add_marker(&self, db: &str, marker: &Marker) -> Result<bool, StorageError>;

    /// `subscriptions.refresh`: re-applies the markers of a subscription.
    async fn refresh_markers(&self, db: &str, subscription: &SubscriptionId)
        -> Result<(), StorageError>;

    /// `subscriptions.del`: drops every marker and missing-key registration of
    /// a subscription. Returns the number of markers removed.
    async fn remove_markers(&self, db: &str, subscription: &SubscriptionId)
        -> Result<usize, StorageError>;

    /// `subscriptions.addMissing`: notify the subscription once any of `ids`
    /// comes into existence.
    async fn add_missing(
        &self,
        db: &str,
        subscription: &SubscriptionId,
        ids: &[String],
    ) -> Result<(), StorageError>;

    /// `hget`.
    async fn hget(&self, db: &str, key: &str, field: &str) -> Result<Option<String>, StorageError>;

    /// `hset`.
    async fn hset(&self, db: &str, key: &str, field: &str, value: &str)
        -> Result<(), StorageError>;

    /// `hdel`. Returns `true` when the field existed.
    async fn hdel(&self, db: &str, key: &str, field: &str) -> Result<bool, StorageError>;

    /// `hgetall`.
    async fn hgetall(&self, db: &str, key: &str)
        -> Result<BTreeMap<String, String>, StorageError>;

    /// Publishes `payload` on a pub/sub channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn notification_channel_splits_into_id_and_path() {
        let n = ChangeNotification::changed("default", &NodeId::new("te1"), "image.thumb");
        let (id, path) = n.split();
        assert_eq!(id, NodeId::new("te1"));
        assert_eq!(path, vec!["image", "thumb"]);

        let d = ChangeNotification::deleted("default", &NodeId::new("te1"));
        let (id, path) = d.split();
        assert_eq!(id.as_str(), "te1");
        assert!(path.is_empty());
    }

    #[test]
    fn traversal_from_field_name() {
        assert_eq!(
            Traversal::from_field_name("children"),
            Some(Traversal::Children)
        );
        assert_eq!(Traversal::from_field_name("title"), None);
    }
}
