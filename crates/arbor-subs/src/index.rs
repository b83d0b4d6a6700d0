// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Subscription index: a prefix tree over field path segments, per database.
//!
//! Every segment holds three buckets: exact node ids, type prefixes and a
//! wildcard. Resolving `"<id>.<a.b>"` walks `a` then `b` and unions the
//! buckets met on the way, so a dependency on `title` is hit by a write to
//! `title.en`. A write that stops above registered paths (`theme` when
//! `theme.color` is watched) hits the whole subtree below it. Dependencies on
//! [`ANY_FIELD`](crate::deps::ANY_FIELD) live at the tree root.
//!
//! Type and wildcard hits come back as candidates; their containment is
//! checked by the caller.
use std::collections::BTreeSet;

use arbor_query::{NodeId, SubscriptionId};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::deps::{Containment, Dependency, Target, ANY_FIELD};

/// Default cap of the resolve cache.
pub const DEFAULT_CACHE_CAP: usize = 100_000;

#[derive(Debug, Default)]
struct Segment {
    children: FxHashMap<String, Segment>,
    exact: FxHashMap<NodeId, FxHashSet<SubscriptionId>>,
    typed: FxHashMap<String, FxHashSet<(SubscriptionId, Containment)>>,
    any: FxHashSet<(SubscriptionId, Containment)>,
}

impl Segment {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.exact.is_empty() && self.typed.is_empty() && self.any.is_empty()
    }

    fn collect(&self, id: &NodeId, hits: &mut Hits) {
        if let Some(subs) = self.exact.get(id) {
            hits.direct.extend(subs.iter().cloned());
        }
        if let Some(entries) = self.typed.get(id.type_prefix()) {
            hits.candidates.extend(entries.iter().cloned());
        }
        hits.candidates.extend(self.any.iter().cloned());
    }

    fn attach(&mut self, sub: &SubscriptionId, target: &Target) {
        match target {
            Target::Node(id) => {
                self.exact.entry(id.clone()).or_default().insert(sub.clone());
            }
            Target::Prefix { prefix, containment } => {
                self.typed
                    .entry(prefix.clone())
                    .or_default()
                    .insert((sub.clone(), containment.clone()));
            }
            Target::Any(containment) => {
                self.any.insert((sub.clone(), containment.clone()));
            }
        }
    }

    fn detach_here(&mut self, sub: &SubscriptionId, target: &Target) {
        match target {
            Target::Node(id) => {
                if let Some(subs) = self.exact.get_mut(id) {
                    subs.remove(sub);
                    if subs.is_empty() {
                        self.exact.remove(id);
                    }
                }
            }
            Target::Prefix { prefix, containment } => {
                if let Some(entries) = self.typed.get_mut(prefix) {
                    entries.remove(&(sub.clone(), containment.clone()));
                    if entries.is_empty() {
                        self.typed.remove(prefix);
                    }
                }
            }
            Target::Any(containment) => {
                self.any.remove(&(sub.clone(), containment.clone()));
            }
        }
    }

    // Removes the entry at `segments` and prunes segments left empty.
    fn detach(&mut self, segments: &[&str], sub: &SubscriptionId, target: &Target) {
        let Some((first, rest)) = segments.split_first() else {
            self.detach_here(sub, target);
            return;
        };
        if let Some(child) = self.children.get_mut(*first) {
            child.detach(rest, sub, target);
            if child.is_empty() {
                self.children.remove(*first);
            }
        }
    }
}

/// Subscriptions a change hit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hits {
    /// Hit through an exact id entry.
    pub direct: BTreeSet<SubscriptionId>,
    /// Hit through a type prefix or wildcard entry; containment still unchecked.
    pub candidates: BTreeSet<(SubscriptionId, Containment)>,
}

impl Hits {
    /// `true` when nothing was hit.
    pub fn is_empty(&self) -> bool {
        self.direct.is_empty() && self.candidates.is_empty()
    }
}

/// Prefix tree of all live subscriptions' dependencies.
#[derive(Debug)]
pub struct SubscriptionIndex {
    dbs: FxHashMap<String, Segment>,
    entries: FxHashMap<SubscriptionId, BTreeSet<Dependency>>,
    cache: FxHashMap<(String, String), Hits>,
    cache_cap: usize,
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAP)
    }
}

fn segments(field: &str) -> Vec<&str> {
    if field == ANY_FIELD {
        Vec::new()
    } else {
        field.split('.').filter(|s| !s.is_empty()).collect()
    }
}

impl SubscriptionIndex {
    /// Empty index whose resolve cache is flushed above `cache_cap` entries.
    #[must_use]
    pub fn new(cache_cap: usize) -> Self {
        Self {
            dbs: FxHashMap::default(),
            entries: FxHashMap::default(),
            cache: FxHashMap::default(),
            cache_cap,
        }
    }

    /// Number of indexed subscriptions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no subscription is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `true` when `sub` is indexed.
    pub fn contains(&self, sub: &SubscriptionId) -> bool {
        self.entries.contains_key(sub)
    }

    /// Dependencies indexed for `sub`.
    pub fn dependencies(&self, sub: &SubscriptionId) -> Option<&BTreeSet<Dependency>> {
        self.entries.get(sub)
    }

    /// Replaces the dependencies of `sub`.
    pub fn insert(&mut self, sub: &SubscriptionId, deps: BTreeSet<Dependency>) {
        self.remove(sub);
        for dep in &deps {
            let mut segment = self.dbs.entry(dep.db.clone()).or_default();
            for part in segments(&dep.field) {
                segment = segment.children.entry(part.to_owned()).or_default();
            }
            segment.attach(sub, &dep.target);
        }
        self.entries.insert(sub.clone(), deps);
        self.cache.clear();
    }

    /// Drops every entry of `sub`. Returns `false` when it was not indexed.
    pub fn remove(&mut self, sub: &SubscriptionId) -> bool {
        let Some(deps) = self.entries.remove(sub) else {
            return false;
        };
        for dep in &deps {
            if let Some(root) = self.dbs.get_mut(&dep.db) {
                root.detach(&segments(&dep.field), sub, &dep.target);
                if root.is_empty() {
                    self.dbs.remove(&dep.db);
                }
            }
        }
        self.cache.clear();
        true
    }

    /// Discards the whole tree and indexes `all` from scratch.
    pub fn rebuild<I>(&mut self, all: I)
    where
        I: IntoIterator<Item = (SubscriptionId, BTreeSet<Dependency>)>,
    {
        self.dbs.clear();
        self.entries.clear();
        self.cache.clear();
        for (sub, deps) in all {
            self.insert(&sub, deps);
        }
    }

    /// Subscriptions a change of `id` at `path` hits in `db`.
    pub fn resolve(&mut self, db: &str, id: &NodeId, path: &[&str]) -> Hits {
        let key = (db.to_owned(), format!("{id}.{}", path.join(".")));
        if let Some(hits) = self.cache.get(&key) {
            return hits.clone();
        }
        let hits = self.walk(db, id, path);
        if self.cache.len() >= self.cache_cap {
            self.cache.clear();
        }
        self.cache.insert(key, hits.clone());
        hits
    }

    /// Subscriptions depending on any field of `id` in `db`. Used when the
    /// node is deleted; not cached.
    pub fn resolve_node(&self, db: &str, id: &NodeId) -> Hits {
        let mut hits = Hits::default();
        let Some(root) = self.dbs.get(db) else {
            return hits;
        };
        let mut stack = vec![root];
        while let Some(segment) = stack.pop() {
            segment.collect(id, &mut hits);
            stack.extend(segment.children.values());
        }
        hits
    }

    fn walk(&self, db: &str, id: &NodeId, path: &[&str]) -> Hits {
        let mut hits = Hits::default();
        let Some(mut segment) = self.dbs.get(db) else {
            return hits;
        };
        segment.collect(id, &mut hits);
        for part in path {
            match segment.children.get(*part) {
                Some(next) => {
                    segment = next;
                    segment.collect(id, &mut hits);
                }
                None => return hits,
            }
        }
        if !path.is_empty() {
            let mut stack: Vec<&Segment> = segment.children.values().collect();
            while let Some(below) = stack.pop() {
                below.collect(id, &mut hits);
                stack.extend(below.children.values());
            }
        }
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(target: Target, field: &str) -> Dependency {
        Dependency {
            db: "default".to_owned(),
            target,
            field: field.to_owned(),
        }
    }

    fn sub(name: &str) -> SubscriptionId {
        SubscriptionId::new(name)
    }

    fn node(id: &str) -> Target {
        Target::Node(NodeId::new(id))
    }

    fn index() -> SubscriptionIndex {
        let mut index = SubscriptionIndex::default();
        let prefix = |p: &str| Target::Prefix {
            prefix: p.to_owned(),
            containment: Containment::Always,
        };
        index.insert(&sub("exact"), [dep(node("te1"), "title")].into());
        index.insert(&sub("typed"), [dep(prefix("te"), "title")].into());
        index.insert(&sub("any"), [dep(Target::Any(Containment::Always), "title")].into());
        index.insert(&sub("other-node"), [dep(node("te2"), "title")].into());
        index.insert(&sub("other-type"), [dep(prefix("ma"), "title")].into());
        index.insert(&sub("other-field"), [dep(node("te1"), "name")].into());
        index
    }

    #[test]
    fn title_write_hits_exact_typed_and_wildcard_entries_only() {
        let mut index = index();
        let hits = index.resolve("default", &NodeId::new("te1"), &["title"]);
        assert_eq!(hits.direct, BTreeSet::from([sub("exact")]));
        let candidates: BTreeSet<_> = hits.candidates.into_iter().map(|(s, _)| s).collect();
        assert_eq!(candidates, BTreeSet::from([sub("any"), sub("typed")]));
    }

    #[test]
    fn deeper_writes_hit_shallower_entries() {
        let mut index = index();
        let hits = index.resolve("default", &NodeId::new("te1"), &["title", "en"]);
        assert!(hits.direct.contains(&sub("exact")));
        assert!(!hits.direct.contains(&sub("other-field")));
    }

    #[test]
    fn shallower_writes_hit_the_subtree() {
        let mut index = SubscriptionIndex::default();
        index.insert(&sub("color"), [dep(node("sp1"), "theme.color")].into());
        let hits = index.resolve("default", &NodeId::new("sp1"), &["theme"]);
        assert_eq!(hits.direct, BTreeSet::from([sub("color")]));
        assert!(index.resolve("default", &NodeId::new("sp1"), &["title"]).is_empty());
    }

    #[test]
    fn any_field_entries_sit_at_the_root() {
        let mut index = SubscriptionIndex::default();
        index.insert(&sub("all"), [dep(node("ma1"), ANY_FIELD)].into());
        let hits = index.resolve("default", &NodeId::new("ma1"), &["value"]);
        assert_eq!(hits.direct, BTreeSet::from([sub("all")]));
    }

    #[test]
    fn node_lookups_cover_every_field() {
        let mut index = index();
        index.insert(&sub("nested"), [dep(node("te1"), "meta.a")].into());
        let hits = index.resolve_node("default", &NodeId::new("te1"));
        assert_eq!(
            hits.direct,
            BTreeSet::from([sub("exact"), sub("nested"), sub("other-field")])
        );
        let candidates: BTreeSet<_> = hits.candidates.into_iter().map(|(s, _)| s).collect();
        assert_eq!(candidates, BTreeSet::from([sub("any"), sub("typed")]));
        assert!(index.resolve_node("other", &NodeId::new("te1")).is_empty());
    }

    #[test]
    fn removal_prunes_and_invalidates_the_cache() {
        let mut index = index();
        assert!(!index.resolve("default", &NodeId::new("te1"), &["title"]).direct.is_empty());
        assert!(index.remove(&sub("exact")));
        assert!(!index.remove(&sub("exact")));
        assert!(index.resolve("default", &NodeId::new("te1"), &["title"]).direct.is_empty());
        for name in ["typed", "any", "other-node", "other-type", "other-field"] {
            index.remove(&sub(name));
        }
        assert!(index.is_empty());
        assert!(index.dbs.is_empty());
    }

    #[test]
    fn rebuild_replaces_instead_of_merging() {
        let mut index = index();
        index.rebuild([(sub("fresh"), BTreeSet::from([dep(node("ma1"), "value")]))]);
        assert_eq!(index.len(), 1);
        assert!(index.resolve("default", &NodeId::new("te1"), &["title"]).is_empty());
        assert!(!index.resolve("default", &NodeId::new("ma1"), &["value"]).is_empty());
    }

    #[test]
    fn resolve_cache_is_flushed_above_the_cap() {
        let mut index = SubscriptionIndex::new(2);
        index.insert(&sub("a"), [dep(node("ma1"), "value")].into());
        for i in 0..5 {
            index.resolve("default", &NodeId::new(format!("ma{i}")), &["value"]);
        }
        assert!(index.cache.len() <= 2);
    }
}
