//! Client for the remote object store.
//!
//! [`Client::get_tree`] rebuilds the object graph of a tree from its hash,
//! consulting the shared [`ObjectCache`] before every remote call and filling
//! it as objects are discovered. Shared subtrees and files are fetched at most
//! once per client lifetime.

pub mod api;
pub mod listing;

pub use api::{ApiError, CommitStatus, GithubApi, RemoteApi, StatusState};
pub use listing::{ChildRef, ListingError};

use crate::errors::ErrorCode;
use crate::object::{Blob, Node, ObjectCache, ObjectKind, Tree};
use crate::types::{ObjectId, Repository};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors from [`Client::get_tree`] and [`Client::get_blob`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to fetch {kind} {id}: {source}")]
    Api {
        kind: ObjectKind,
        id: ObjectId,
        #[source]
        source: ApiError,
    },

    #[error("failed to parse {kind} {id}: {source}")]
    Parse {
        kind: ObjectKind,
        id: ObjectId,
        #[source]
        source: ListingError,
    },
}

impl FetchError {
    /// Object the failure occurred on.
    pub fn object(&self) -> (ObjectKind, &ObjectId) {
        match self {
            Self::Api { kind, id, .. } | Self::Parse { kind, id, .. } => (*kind, id),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { source, .. } if source.is_not_found())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Api { source, .. } => source.code(),
            Self::Parse {
                kind: ObjectKind::Tree,
                ..
            } => ErrorCode::FetchListingMalformed,
            Self::Parse {
                kind: ObjectKind::Blob,
                ..
            } => ErrorCode::FetchBlobMalformed,
        }
    }
}

type TreeFuture<'a> = Pin<Box<dyn Future<Output = Result<Arc<Tree>, FetchError>> + Send + 'a>>;

/// Long-lived client: one remote API handle plus the object cache every job
/// using this client shares.
#[derive(Clone)]
pub struct Client {
    api: Arc<dyn RemoteApi>,
    cache: Arc<ObjectCache>,
}

impl Client {
    pub fn new(api: Arc<dyn RemoteApi>) -> Self {
        Self::with_cache(api, Arc::new(ObjectCache::new()))
    }

    pub fn with_cache(api: Arc<dyn RemoteApi>, cache: Arc<ObjectCache>) -> Self {
        Self { api, cache }
    }

    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    /// Return the complete tree `id` of `repo`.
    ///
    /// A cached tree is returned without any remote call. On failure nothing
    /// is returned, but objects cached before the failure stay cached and
    /// make a retry cheaper.
    #[instrument(skip(self, repo), fields(repo = %repo.full_name(), tree = %id))]
    pub async fn get_tree(&self, id: &ObjectId, repo: &Repository) -> Result<Arc<Tree>, FetchError> {
        let tree = self.build_tree(id, repo).await?;
        debug!(
            entries = tree.len(),
            cached_trees = self.cache.stats().trees,
            cached_blobs = self.cache.stats().blobs,
            "tree ready"
        );
        Ok(tree)
    }

    /// Return blob `id` of `repo`, fetching it if it is not cached.
    pub async fn get_blob(&self, id: &ObjectId, repo: &Repository) -> Result<Arc<Blob>, FetchError> {
        if let Some(blob) = self.cache.get_blob(id) {
            return Ok(blob);
        }

        let raw = self
            .api
            .get_blob(&repo.owner.login, &repo.name, id.as_str())
            .await
            .map_err(|source| FetchError::Api {
                kind: ObjectKind::Blob,
                id: id.clone(),
                source,
            })?;
        let blob = listing::parse_blob(id, &raw).map_err(|source| FetchError::Parse {
            kind: ObjectKind::Blob,
            id: id.clone(),
            source,
        })?;
        debug!(object = %id, "fetched blob");
        Ok(self.cache.insert_blob(Arc::new(blob)))
    }

    fn build_tree<'a>(&'a self, id: &'a ObjectId, repo: &'a Repository) -> TreeFuture<'a> {
        Box::pin(async move {
            if let Some(tree) = self.cache.get_tree(id) {
                return Ok(tree);
            }

            let raw = self
                .api
                .get_tree_listing(&repo.owner.login, &repo.name, id.as_str())
                .await
                .map_err(|source| FetchError::Api {
                    kind: ObjectKind::Tree,
                    id: id.clone(),
                    source,
                })?;
            let children =
                listing::parse_tree_listing(id, &raw).map_err(|source| FetchError::Parse {
                    kind: ObjectKind::Tree,
                    id: id.clone(),
                    source,
                })?;
            debug!(object = %id, children = children.len(), "fetched tree listing");

            let mut tree = Tree::new(id.clone());
            for child in children {
                let node = match child.kind {
                    ObjectKind::Blob => Node::Blob(self.get_blob(&child.id, repo).await?),
                    ObjectKind::Tree => Node::Tree(self.build_tree(&child.id, repo).await?),
                };
                tree.attach_child(child.name, child.mode, node)
                    .map_err(|err| FetchError::Parse {
                        kind: ObjectKind::Tree,
                        id: id.clone(),
                        source: err.into(),
                    })?;
            }

            // Inserted only once complete, so a cached tree is never partial.
            Ok(self.cache.insert_tree(Arc::new(tree)))
        })
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("cache", &self.cache).finish()
    }
}
