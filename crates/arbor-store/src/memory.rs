// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! [`MemoryStore`]: the storage protocol over in-memory tables.
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use arbor_query::schema::Schemas;
use arbor_query::storage::{FindMode, FindQuery, FindReply, InheritHit, Order, Sort, Traversal};
use arbor_query::{ChangeNotification, Marker, NodeId, Storage, StorageError, SubscriptionId};
use async_trait::async_trait;
use rustc_hash::FxHashSet;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::graph::Database;
use crate::rpn;
use crate::write;

/// Capacity of the change and pub/sub broadcast channels.
pub const CHANNEL_CAPACITY: usize = 4096;

/// A message published on a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Channel name.
    pub channel: String,
    /// Payload as sent.
    pub payload: String,
}

/// In-process storage engine.
///
/// One set of tables per schema in the [`Schemas`] it was built with. Writes
/// go through [`MemoryStore::set`] and [`MemoryStore::delete`]; every write
/// fans its change notifications out on [`MemoryStore::changes`].
pub struct MemoryStore {
    schemas: Schemas,
    dbs: Mutex<BTreeMap<String, Database>>,
    changes: broadcast::Sender<ChangeNotification>,
    published: broadcast::Sender<Published>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Empty store with one database per schema.
    #[must_use]
    pub fn new(schemas: Schemas) -> Self {
        let dbs = schemas
            .databases()
            .map(|name| (name.to_owned(), Database::default()))
            .collect();
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (published, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            schemas,
            dbs: Mutex::new(dbs),
            changes,
            published,
            available: AtomicBool::new(true),
        }
    }

    /// Schemas the store validates writes against.
    pub fn schemas(&self) -> &Schemas {
        &self.schemas
    }

    /// Receiver of every change notification emitted after this call.
    pub fn changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.subscribe()
    }

    /// Receiver of every message published after this call.
    pub fn published(&self) -> broadcast::Receiver<Published> {
        self.published.subscribe()
    }

    /// Simulates losing (or regaining) the connection: while unavailable
    /// every protocol command fails with [`StorageError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::SeqCst);
    }

    /// Applies a set payload to `db`. Returns the id written.
    #[instrument(skip(self, payload))]
    pub async fn set(&self, db: &str, payload: &Value) -> Result<NodeId, StoreError> {
        self.check()?;
        let schema = self
            .schemas
            .get(db)
            .ok_or_else(|| StorageError::UnknownDatabase(db.to_owned()))?;
        let applied = {
            let mut dbs = self.dbs.lock().await;
            let tables = dbs
                .get_mut(db)
                .ok_or_else(|| StorageError::UnknownDatabase(db.to_owned()))?;
            write::set(db, tables, schema, payload)?
        };
        debug!(id = %applied.id, changes = applied.changes.len(), "set applied");
        self.emit(applied.changes);
        Ok(applied.id)
    }

    /// Removes `id` and every descendant left without parents. Returns the
    /// removed ids; empty when `id` did not exist.
    #[instrument(skip(self))]
    pub async fn delete(&self, db: &str, id: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        self.check()?;
        let applied = {
            let mut dbs = self.dbs.lock().await;
            let tables = dbs
                .get_mut(db)
                .ok_or_else(|| StorageError::UnknownDatabase(db.to_owned()))?;
            write::delete(db, tables, id)?
        };
        debug!(removed = applied.removed.len(), "delete applied");
        self.emit(applied.changes);
        Ok(applied.removed)
    }

    /// Markers currently registered for `subscription`.
    pub async fn markers(&self, db: &str, subscription: &SubscriptionId) -> Vec<Marker> {
        let dbs = self.dbs.lock().await;
        dbs.get(db)
            .and_then(|d| d.markers.get(subscription))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscriptions waiting for `key` (an id or alias) to exist.
    pub async fn waiting_for(&self, db: &str, key: &str) -> Vec<SubscriptionId> {
        let dbs = self.dbs.lock().await;
        dbs.get(db)
            .and_then(|d| d.missing.get(key))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn emit(&self, changes: Vec<ChangeNotification>) {
        for change in changes {
            // No receivers is fine: nobody is listening yet.
            let _ = self.changes.send(change);
        }
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.available.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory store switched off".to_owned()))
        }
    }

    async fn with_db<T>(&self, db: &str, f: impl FnOnce(&mut Database) -> T) -> Result<T, StorageError> {
        self.check()?;
        let mut dbs = self.dbs.lock().await;
        let tables = dbs
            .get_mut(db)
            .ok_or_else(|| StorageError::UnknownDatabase(db.to_owned()))?;
        Ok(f(tables))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Schemas::default())
    }
}

fn find(tables: &Database, query: &FindQuery) -> Result<FindReply, StorageError> {
    let mut seen = FxHashSet::default();
    let mut matches = Vec::new();
    for root in &query.roots {
        for candidate in tables.walk(root, query.direction.clone()) {
            if !seen.insert(candidate.clone()) {
                continue;
            }
            let keep = match &query.filter {
                Some(program) => rpn::evaluate(program, tables, &candidate).map_err(|e| {
                    StorageError::Command {
                        command: "hierarchy.find",
                        message: e.to_string(),
                    }
                })?,
                None => true,
            };
            if keep {
                matches.push(candidate);
            }
        }
    }

    if let FindMode::Merge { field } = &query.mode {
        let mut merged = Map::new();
        for id in &matches {
            if let Some(Value::Object(values)) = tables.field(id, field) {
                for (key, value) in values {
                    merged.entry(key).or_insert(value);
                }
            }
        }
        return Ok(FindReply::Merged(merged));
    }

    let sorted = match &query.sort {
        // Only top-level scalar keys are indexed for sorting.
        Some(sort) if sort.field.contains('.') => false,
        Some(sort) => {
            sort_by_field(tables, &mut matches, sort);
            true
        }
        None => true,
    };
    if sorted {
        matches = matches
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
    }
    Ok(FindReply::Ids { ids: matches, sorted })
}

fn sort_by_field(tables: &Database, ids: &mut [NodeId], sort: &Sort) {
    let key = |id: &NodeId| tables.field(id, &sort.field);
    ids.sort_by(|a, b| {
        let (ka, kb) = (key(a), key(b));
        match (&ka, &kb) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = compare(x, y);
                if sort.order == Order::Desc {
                    ord.reverse()
                } else {
                    ord
                }
            }
        }
    });
}

fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn inherit(tables: &Database, root: &NodeId, prefixes: &[String], fields: &[String]) -> Vec<InheritHit> {
    let mut candidates = vec![root.clone()];
    candidates.extend(tables.walk(root, Traversal::Ancestors));
    let mut hits = Vec::new();
    let mut pending: Vec<&String> = fields.iter().collect();
    for (depth, node) in candidates.iter().enumerate() {
        if pending.is_empty() {
            break;
        }
        // The node itself always qualifies; ancestors must match the types.
        if depth > 0 && !prefixes.is_empty() && !prefixes.iter().any(|p| p == node.type_prefix()) {
            continue;
        }
        pending.retain(|field| match tables.field(node, field) {
            Some(value) if !is_blank(&value) => {
                hits.push(InheritHit {
                    node: node.clone(),
                    field: (*field).clone(),
                    value,
                });
                false
            }
            _ => true,
        });
    }
    hits
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn find(&self, db: &str, query: &FindQuery) -> Result<FindReply, StorageError> {
        self.with_db(db, |tables| find(tables, query)).await?
    }

    async fn inherit(
        &self,
        db: &str,
        root: &NodeId,
        type_prefixes: &[String],
        fields: &[String],
    ) -> Result<Vec<InheritHit>, StorageError> {
        self.with_db(db, |tables| inherit(tables, root, type_prefixes, fields))
            .await
    }

    async fn get_field(
        &self,
        db: &str,
        id: &NodeId,
        field: &str,
    ) -> Result<Option<Value>, StorageError> {
        self.with_db(db, |tables| tables.field(id, field).filter(|v| !v.is_null()))
            .await
    }

    async fn exists(&self, db: &str, id: &NodeId) -> Result<bool, StorageError> {
        self.with_db(db, |tables| tables.contains(id)).await
    }

    async fn resolve_alias(&self, db: &str, alias: &str) -> Result<Option<NodeId>, StorageError> {
        self.with_db(db, |tables| tables.aliases.get(alias).cloned())
            .await
    }

    async fn add_marker(&self, db: &str, marker: &Marker) -> Result<bool, StorageError> {
        self.with_db(db, |tables| {
            tables
                .markers
                .entry(marker.subscription.clone())
                .or_default()
                .insert(marker.clone())
        })
        .await
    }

    async fn refresh_markers(
        &self,
        db: &str,
        subscription: &SubscriptionId,
    ) -> Result<(), StorageError> {
        let count = self
            .with_db(db, |tables| tables.markers.get(subscription).map_or(0, |m| m.len()))
            .await?;
        debug!(%subscription, markers = count, "markers refreshed");
        Ok(())
    }

    async fn remove_markers(
        &self,
        db: &str,
        subscription: &SubscriptionId,
    ) -> Result<usize, StorageError> {
        let removed = self
            .with_db(db, |tables| {
                tables.missing.retain(|_, waiting| {
                    waiting.remove(subscription);
                    !waiting.is_empty()
                });
                tables.markers.remove(subscription).map_or(0, |m| m.len())
            })
            .await?;
        debug!(%subscription, markers = removed, "markers removed");
        Ok(removed)
    }

    async fn add_missing(
        &self,
        db: &str,
        subscription: &SubscriptionId,
        ids: &[String],
    ) -> Result<(), StorageError> {
        self.with_db(db, |tables| {
            for id in ids {
                tables
                    .missing
                    .entry(id.clone())
                    .or_default()
                    .insert(subscription.clone());
            }
        })
        .await
    }

    async fn hget(&self, db: &str, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        self.with_db(db, |tables| tables.hashes.get(key).and_then(|h| h.get(field)).cloned())
            .await
    }

    async fn hset(
        &self,
        db: &str,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), StorageError> {
        self.with_db(db, |tables| {
            tables
                .hashes
                .entry(key.to_owned())
                .or_default()
                .insert(field.to_owned(), value.to_owned());
        })
        .await
    }

    async fn hdel(&self, db: &str, key: &str, field: &str) -> Result<bool, StorageError> {
        self.with_db(db, |tables| {
            tables
                .hashes
                .get_mut(key)
                .is_some_and(|h| h.remove(field).is_some())
        })
        .await
    }

    async fn hgetall(
        &self,
        db: &str,
        key: &str,
    ) -> Result<BTreeMap<String, String>, StorageError> {
        self.with_db(db, |tables| tables.hashes.get(key).cloned().unwrap_or_default())
            .await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StorageError> {
        self.check()?;
        let _ = self.published.send(Published {
            channel: channel.to_owned(),
            payload: payload.to_owned(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;
    use arbor_query::schema::Schema;
    use serde_json::json;

    fn store() -> MemoryStore {
        let schema: Schema = serde_json::from_value(json!({
            "types": {
                "match": { "prefix": "ma", "fields": { "value": { "type": "number" } } },
                "team": { "prefix": "te", "fields": {
                    "name": { "type": "string" },
                    "meta": { "type": "object", "properties": { "a": { "type": "string" } } }
                } }
            }
        }))
        .unwrap();
        MemoryStore::new(Schemas::single(schema))
    }

    #[tokio::test]
    async fn find_pages_sorted_results() {
        let s = store();
        for (id, v) in [("ma1", 3), ("ma2", 1), ("ma3", 2)] {
            s.set("default", &json!({ "$id": id, "value": v })).await.unwrap();
        }
        let query = FindQuery {
            sort: Some(Sort {
                field: "value".into(),
                order: Order::Asc,
            }),
            offset: 1,
            limit: Some(1),
            ..FindQuery::ids(Traversal::Descendants, NodeId::root())
        };
        let reply = s.find("default", &query).await.unwrap();
        assert_eq!(
            reply,
            FindReply::Ids {
                ids: vec![NodeId::new("ma3")],
                sorted: true
            }
        );
    }

    #[tokio::test]
    async fn nested_sort_keys_are_left_to_the_caller() {
        let s = store();
        s.set("default", &json!({ "$id": "te1", "meta": { "a": "x" } })).await.unwrap();
        let query = FindQuery {
            sort: Some(Sort {
                field: "meta.a".into(),
                order: Order::Desc,
            }),
            limit: Some(0),
            ..FindQuery::ids(Traversal::Children, NodeId::root())
        };
        let reply = s.find("default", &query).await.unwrap();
        assert_eq!(
            reply,
            FindReply::Ids {
                ids: vec![NodeId::new("te1")],
                sorted: false
            }
        );
    }

    #[tokio::test]
    async fn merge_mode_keeps_the_nearest_keys() {
        let s = store();
        s.set("default", &json!({ "$id": "te1", "meta": { "a": "far" } })).await.unwrap();
        s.set("default", &json!({ "$id": "te2", "parents": ["te1"], "meta": { "a": "near" } }))
            .await
            .unwrap();
        s.set("default", &json!({ "$id": "ma1", "parents": ["te2"] })).await.unwrap();
        let query = FindQuery {
            mode: FindMode::Merge {
                field: "meta".into(),
            },
            ..FindQuery::ids(Traversal::Ancestors, NodeId::new("ma1"))
        };
        let reply = s.find("default", &query).await.unwrap();
        let FindReply::Merged(map) = reply else {
            panic!("expected merged reply");
        };
        assert_eq!(map.get("a"), Some(&json!("near")));
    }

    #[tokio::test]
    async fn inherit_prefers_the_node_then_nearest_typed_ancestor() {
        let s = store();
        s.set("default", &json!({ "$id": "te1", "name": "outer" })).await.unwrap();
        s.set("default", &json!({ "$id": "ma1", "parents": ["te1"] })).await.unwrap();
        let hits = s
            .inherit("default", &NodeId::new("ma1"), &["te".into()], &["name".into(), "value".into()])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node, NodeId::new("te1"));
        assert_eq!(hits[0].value, json!("outer"));

        let none = s
            .inherit("default", &NodeId::new("ma1"), &["ma".into()], &["name".into()])
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn writes_fan_out_change_notifications() {
        let s = store();
        let mut rx = s.changes();
        s.set("default", &json!({ "$id": "ma1", "value": 5 })).await.unwrap();
        let mut channels = Vec::new();
        while let Ok(change) = rx.try_recv() {
            channels.push(change.channel);
        }
        assert!(channels.contains(&"ma1.value".to_owned()));
        assert!(channels.contains(&"root.children".to_owned()));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_command() {
        let s = store();
        s.set_available(false);
        assert!(matches!(
            s.exists("default", &NodeId::root()).await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(matches!(
            s.exists("other", &NodeId::root()).await,
            Err(StorageError::Unavailable(_))
        ));
        s.set_available(true);
        assert!(s.exists("default", &NodeId::root()).await.unwrap());
        assert_eq!(
            s.exists("other", &NodeId::root()).await,
            Err(StorageError::UnknownDatabase("other".into()))
        );
    }

    #[tokio::test]
    async fn removing_markers_clears_every_registration() {
        let s = store();
        let sub = SubscriptionId::new("s1");
        let other = SubscriptionId::new("s2");
        let marker = Marker::node(sub.clone(), NodeId::new("te1"), ["name"]);
        assert!(s.add_marker("default", &marker).await.unwrap());
        s.add_missing("default", &sub, &["te9".into(), "ma9".into()]).await.unwrap();
        s.add_missing("default", &other, &["ma9".into()]).await.unwrap();

        assert_eq!(s.remove_markers("default", &sub).await.unwrap(), 1);
        assert!(s.markers("default", &sub).await.is_empty());
        assert!(s.waiting_for("default", "te9").await.is_empty());
        assert_eq!(s.waiting_for("default", "ma9").await, vec![other]);
        assert_eq!(s.remove_markers("default", &sub).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn hash_tables() {
        let s = store();
        s.hset("default", "___subscriptions", "abc", "{}").await.unwrap();
        assert_eq!(s.hget("default", "___subscriptions", "abc").await.unwrap(), Some("{}".into()));
        assert_eq!(s.hgetall("default", "___subscriptions").await.unwrap().len(), 1);
        assert!(s.hdel("default", "___subscriptions", "abc").await.unwrap());
        assert!(!s.hdel("default", "___subscriptions", "abc").await.unwrap());
    }
}
