// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Subscription markers: the dependencies a query had on the store.
use std::collections::BTreeSet;

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::filter::FilterProgram;
use crate::ident::{NodeId, SubscriptionId};
use crate::storage::{Storage, StorageError, Traversal};

/// Traversal part of a marker: writes to nodes reached this way matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkerTraversal {
    /// Edge followed from the marker node.
    pub direction: Traversal,
    /// Filter the traversal applied.
    pub filter: Option<FilterProgram>,
}

/// One dependency of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Marker {
    /// Owning subscription.
    pub subscription: SubscriptionId,
    /// Node the dependency starts at.
    pub node: NodeId,
    /// Fields read.
    pub fields: BTreeSet<String>,
    /// Present for find, list and inherit dependencies.
    pub traversal: Option<MarkerTraversal>,
}

impl Marker {
    /// Plain field dependency on `node`.
    pub fn node<I, S>(subscription: SubscriptionId, node: NodeId, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subscription,
            node,
            fields: fields.into_iter().map(Into::into).collect(),
            traversal: None,
        }
    }

    /// Dependency on the nodes a traversal from `node` reaches.
    pub fn traversal<I, S>(
        subscription: SubscriptionId,
        node: NodeId,
        fields: I,
        direction: Traversal,
        filter: Option<FilterProgram>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            traversal: Some(MarkerTraversal { direction, filter }),
            ..Self::node(subscription, node, fields)
        }
    }
}

/// Receives markers while a query executes under a subscription.
#[async_trait]
pub trait MarkerRegistrar: Send + Sync {
    /// Registers `marker`. Returns `true` when it was not registered before.
    async fn register(&mut self, db: &str, marker: Marker) -> Result<bool, StorageError>;
}

/// Registrar forwarding to `subscriptions.addMarker`, skipping repeats locally.
pub struct StorageRegistrar<'a> {
    storage: &'a dyn Storage,
    seen: FxHashSet<(String, Marker)>,
}

impl<'a> StorageRegistrar<'a> {
    /// Registrar over `storage`.
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self {
            storage,
            seen: FxHashSet::default(),
        }
    }

    /// Markers registered through this registrar, in no particular order.
    pub fn markers(&self) -> impl Iterator<Item = (&str, &Marker)> {
        self.seen.iter().map(|(db, m)| (db.as_str(), m))
    }
}

#[async_trait]
impl MarkerRegistrar for StorageRegistrar<'_> {
    async fn register(&mut self, db: &str, marker: Marker) -> Result<bool, StorageError> {
        let key = (db.to_owned(), marker);
        if self.seen.contains(&key) {
            return Ok(false);
        }
        let added = self.storage.add_marker(db, &key.1).await?;
        self.seen.insert(key);
        Ok(added)
    }
}
