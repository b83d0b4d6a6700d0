// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Memoised containment checks.
use arbor_query::NodeId;
use rustc_hash::FxHashMap;

use crate::deps::Containment;

/// Default entry cap of [`MembershipCache`].
pub const DEFAULT_MEMBERSHIP_CAP: usize = 100_000;

/// Results of `(db, node, containment)` checks.
///
/// Any hierarchy write can change every answer, so the owner clears the cache
/// on `parents` / `children` notifications. Above the cap it is flushed
/// wholesale.
#[derive(Debug)]
pub struct MembershipCache {
    entries: FxHashMap<(String, NodeId, Containment), bool>,
    cap: usize,
}

impl Default for MembershipCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEMBERSHIP_CAP)
    }
}

impl MembershipCache {
    /// Empty cache holding at most `cap` entries.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            entries: FxHashMap::default(),
            cap,
        }
    }

    /// Cached answer, if any.
    pub fn get(&self, db: &str, node: &NodeId, containment: &Containment) -> Option<bool> {
        self.entries
            .get(&(db.to_owned(), node.clone(), containment.clone()))
            .copied()
    }

    /// Records an answer.
    pub fn insert(&mut self, db: &str, node: &NodeId, containment: &Containment, member: bool) {
        if self.entries.len() >= self.cap {
            self.entries.clear();
        }
        self.entries
            .insert((db.to_owned(), node.clone(), containment.clone()), member);
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached answers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_query::storage::Traversal;

    #[test]
    fn flushes_wholesale_at_the_cap() {
        let mut cache = MembershipCache::new(3);
        let within = Containment::Within {
            root: NodeId::new("te1"),
            direction: Traversal::Descendants,
        };
        for i in 0..3 {
            cache.insert("default", &NodeId::new(format!("ma{i}")), &within, true);
        }
        assert_eq!(cache.len(), 3);
        cache.insert("default", &NodeId::new("ma9"), &within, false);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("default", &NodeId::new("ma9"), &within), Some(false));
        assert_eq!(cache.get("default", &NodeId::new("ma0"), &within), None);
    }
}
