//! Insert-only cache of fetched objects, keyed by content hash.
//!
//! Content-addressed objects never change, so entries are never evicted,
//! invalidated, or replaced. The cache is owned by a client and shared by
//! every job that uses that client.

use super::{Blob, Node, ObjectKind, Tree};
use crate::types::ObjectId;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;

#[derive(Default)]
struct CacheInner {
    trees: HashMap<ObjectId, Arc<Tree>>,
    blobs: HashMap<ObjectId, Arc<Blob>>,
    /// Child hash -> hashes of trees known to list it. Diagnostic only.
    referrers: HashMap<ObjectId, HashSet<ObjectId>>,
}

/// Entry counts for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub trees: usize,
    pub blobs: usize,
}

/// Thread-safe object cache.
///
/// Trees are only inserted once all of their descendants are present, so a
/// cached tree is always complete.
#[derive(Default)]
pub struct ObjectCache {
    inner: RwLock<CacheInner>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, kind: ObjectKind, id: &ObjectId) -> Option<Node> {
        match kind {
            ObjectKind::Tree => self.get_tree(id).map(Node::Tree),
            ObjectKind::Blob => self.get_blob(id).map(Node::Blob),
        }
    }

    pub fn get_tree(&self, id: &ObjectId) -> Option<Arc<Tree>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.trees.get(id).cloned()
    }

    pub fn get_blob(&self, id: &ObjectId) -> Option<Arc<Blob>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.blobs.get(id).cloned()
    }

    /// Insert a node unless its hash is already present.
    ///
    /// Returns the node now stored under the hash: the argument on first
    /// insert, otherwise the earlier entry (a redundant concurrent fetch
    /// loses and is dropped).
    pub fn insert(&self, node: Node) -> Node {
        match node {
            Node::Tree(tree) => Node::Tree(self.insert_tree(tree)),
            Node::Blob(blob) => Node::Blob(self.insert_blob(blob)),
        }
    }

    pub fn insert_tree(&self, tree: Arc<Tree>) -> Arc<Tree> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = inner.trees.get(tree.id()) {
            trace!(object = %tree.id(), "tree already cached");
            return existing.clone();
        }

        for child in tree.children() {
            inner
                .referrers
                .entry(child.id().clone())
                .or_default()
                .insert(tree.id().clone());
        }
        inner.trees.insert(tree.id().clone(), tree.clone());
        trace!(object = %tree.id(), entries = tree.len(), "cached tree");
        tree
    }

    pub fn insert_blob(&self, blob: Arc<Blob>) -> Arc<Blob> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let stored = inner
            .blobs
            .entry(blob.id().clone())
            .or_insert_with(|| blob.clone());
        trace!(object = %stored.id(), "cached blob");
        stored.clone()
    }

    /// Trees known to list `id` as a direct child, sorted by hash.
    ///
    /// Only trees that made it into this cache are counted.
    pub fn referrers(&self, id: &ObjectId) -> Vec<ObjectId> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<ObjectId> = inner
            .referrers
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        found.sort();
        found
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.trees.contains_key(id) || inner.blobs.contains_key(id)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            trees: inner.trees.len(),
            blobs: inner.blobs.len(),
        }
    }

    pub fn len(&self) -> usize {
        let stats = self.stats();
        stats.trees + stats.blobs
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ObjectCache")
            .field("trees", &stats.trees)
            .field("blobs", &stats.blobs)
            .finish()
    }
}
