// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory node tables of one database.
//!
//! A database owns its hierarchy (parent/child edges kept on both ends), the
//! raw field values of every node, the alias table, plain hash tables and the
//! subscription bookkeeping the query core registers. The root node always
//! exists and cannot be removed.
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use arbor_query::storage::Traversal;
use arbor_query::{Marker, NodeId, SubscriptionId};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value};

/// One stored node.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Node {
    /// Raw field values, including `type` and `aliases`.
    pub(crate) fields: Map<String, Value>,
    /// Parent ids in insertion order.
    pub(crate) parents: Vec<NodeId>,
    /// Child ids in insertion order.
    pub(crate) children: Vec<NodeId>,
}

/// Tables of one database.
#[derive(Debug, Clone)]
pub(crate) struct Database {
    /// Nodes keyed by id.
    pub(crate) nodes: BTreeMap<NodeId, Node>,
    /// Alias to node id.
    pub(crate) aliases: BTreeMap<String, NodeId>,
    /// Plain hash tables (`hget`/`hset`).
    pub(crate) hashes: BTreeMap<String, BTreeMap<String, String>>,
    /// Registered markers per subscription.
    pub(crate) markers: FxHashMap<SubscriptionId, FxHashSet<Marker>>,
    /// Ids and aliases subscriptions are waiting on.
    pub(crate) missing: BTreeMap<String, BTreeSet<SubscriptionId>>,
    /// Counter for generated ids.
    pub(crate) next_id: u64,
}

impl Default for Database {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        let mut root = Node::default();
        root.fields
            .insert("type".to_owned(), Value::String(arbor_query::schema::ROOT_TYPE.to_owned()));
        nodes.insert(NodeId::root(), root);
        Self {
            nodes,
            aliases: BTreeMap::new(),
            hashes: BTreeMap::new(),
            markers: FxHashMap::default(),
            missing: BTreeMap::new(),
            next_id: 0,
        }
    }
}

impl Database {
    pub(crate) fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Reads a field path. `id`, `parents`, `children`, `ancestors` and
    /// `descendants` are answered from the hierarchy.
    pub(crate) fn field(&self, id: &NodeId, path: &str) -> Option<Value> {
        let node = self.nodes.get(id)?;
        let ids = |ids: Vec<NodeId>| {
            Some(Value::Array(
                ids.into_iter().map(|id| Value::String(id.to_string())).collect(),
            ))
        };
        match path {
            "id" => Some(Value::String(id.to_string())),
            "parents" => ids(node.parents.clone()),
            "children" => ids(node.children.clone()),
            "ancestors" => ids(self.walk(id, Traversal::Ancestors)),
            "descendants" => ids(self.walk(id, Traversal::Descendants)),
            _ => {
                let mut segments = path.split('.');
                let first = segments.next()?;
                let mut current = node.fields.get(first)?;
                for segment in segments {
                    current = current.as_object()?.get(segment)?;
                }
                Some(current.clone())
            }
        }
    }

    /// Nodes reached from `start` along `direction`, in traversal order,
    /// without duplicates and without `start` itself (except for
    /// [`Traversal::Node`]).
    pub(crate) fn walk(&self, start: &NodeId, direction: Traversal) -> Vec<NodeId> {
        let Some(node) = self.nodes.get(start) else {
            return Vec::new();
        };
        match direction {
            Traversal::Node => vec![start.clone()],
            Traversal::Children => node.children.clone(),
            Traversal::Parents => node.parents.clone(),
            Traversal::Ancestors => self.bfs(start, |n| &n.parents),
            Traversal::Descendants => self.bfs(start, |n| &n.children),
            Traversal::Field(name) => match node.fields.get(&name) {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(NodeId::from)
                    .filter(|id| self.contains(id))
                    .collect(),
                Some(Value::String(s)) => {
                    let id = NodeId::from(s.as_str());
                    if self.contains(&id) {
                        vec![id]
                    } else {
                        Vec::new()
                    }
                }
                _ => Vec::new(),
            },
        }
    }

    fn bfs(&self, start: &NodeId, edges: impl Fn(&Node) -> &Vec<NodeId>) -> Vec<NodeId> {
        let mut seen: FxHashSet<&NodeId> = FxHashSet::default();
        seen.insert(start);
        let mut out = Vec::new();
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            for next in edges(node) {
                if seen.insert(next) {
                    out.push(next.clone());
                    queue.push_back(next);
                }
            }
        }
        out
    }

    /// Adds the edge `parent -> child` on both ends. Returns `false` when it
    /// already existed.
    pub(crate) fn link(&mut self, parent: &NodeId, child: &NodeId) -> bool {
        let Some(p) = self.nodes.get_mut(parent) else {
            return false;
        };
        if p.children.contains(child) {
            return false;
        }
        p.children.push(child.clone());
        if let Some(c) = self.nodes.get_mut(child) {
            c.parents.push(parent.clone());
        }
        true
    }

    /// Removes the edge `parent -> child` on both ends. Returns `false` when
    /// there was none.
    pub(crate) fn unlink(&mut self, parent: &NodeId, child: &NodeId) -> bool {
        let Some(p) = self.nodes.get_mut(parent) else {
            return false;
        };
        let before = p.children.len();
        p.children.retain(|c| c != child);
        let removed = p.children.len() != before;
        if let Some(c) = self.nodes.get_mut(child) {
            c.parents.retain(|x| x != parent);
        }
        removed
    }

    /// Generates an unused id with `prefix`.
    pub(crate) fn generate_id(&mut self, prefix: &str) -> NodeId {
        loop {
            self.next_id += 1;
            let id = NodeId::new(format!("{prefix}{:08x}", self.next_id));
            if !self.contains(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> Database {
        // root -> a -> b -> d, root -> c -> d
        let mut db = Database::default();
        for id in ["a", "b", "c", "d"] {
            db.nodes.insert(NodeId::new(id), Node::default());
        }
        db.link(&NodeId::root(), &NodeId::new("a"));
        db.link(&NodeId::new("a"), &NodeId::new("b"));
        db.link(&NodeId::root(), &NodeId::new("c"));
        db.link(&NodeId::new("b"), &NodeId::new("d"));
        db.link(&NodeId::new("c"), &NodeId::new("d"));
        db
    }

    fn names(ids: &[NodeId]) -> Vec<&str> {
        ids.iter().map(NodeId::as_str).collect()
    }

    #[test]
    fn ancestors_are_nearest_first_without_duplicates() {
        let db = tree();
        let ancestors = db.walk(&NodeId::new("d"), Traversal::Ancestors);
        assert_eq!(names(&ancestors), vec!["b", "c", "a", "root"]);
    }

    #[test]
    fn descendants_are_breadth_first() {
        let db = tree();
        let descendants = db.walk(&NodeId::root(), Traversal::Descendants);
        assert_eq!(names(&descendants), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn edges_are_kept_on_both_ends() {
        let mut db = tree();
        assert!(!db.link(&NodeId::new("a"), &NodeId::new("b")));
        assert!(db.unlink(&NodeId::new("c"), &NodeId::new("d")));
        assert_eq!(names(&db.nodes[&NodeId::new("d")].parents), vec!["b"]);
        assert_eq!(db.field(&NodeId::new("c"), "children"), Some(json!([])));
    }

    #[test]
    fn nested_fields_are_read_by_path() {
        let mut db = tree();
        if let Some(node) = db.nodes.get_mut(&NodeId::new("a")) {
            node.fields.insert("image".into(), json!({ "thumb": "t.png" }));
        }
        assert_eq!(db.field(&NodeId::new("a"), "image.thumb"), Some(json!("t.png")));
        assert_eq!(db.field(&NodeId::new("a"), "image.full"), None);
        assert_eq!(db.field(&NodeId::new("a"), "id"), Some(json!("a")));
    }
}
