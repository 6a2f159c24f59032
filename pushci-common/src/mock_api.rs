//! In-memory [`RemoteApi`] for tests.
//!
//! Serves canned tree listings and blobs in the same JSON shapes the GitHub
//! API returns, counts every call per object, and can inject failures or a
//! per-call delay. It never opens a socket.

use crate::ghclient::{ApiError, RemoteApi};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Failure injected for a given object hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    NotFound,
    Transport,
    ServerError,
}

impl MockFailure {
    fn to_error(self, sha: &str) -> ApiError {
        match self {
            Self::NotFound => ApiError::NotFound(format!("mock://{sha}")),
            Self::Transport => ApiError::Transport(format!("mock connection reset ({sha})")),
            Self::ServerError => ApiError::Status {
                status: 502,
                url: format!("mock://{sha}"),
                message: "bad gateway".to_string(),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct MockRemoteApi {
    trees: HashMap<String, Vec<u8>>,
    blobs: HashMap<String, Vec<u8>>,
    failures: Mutex<HashMap<String, MockFailure>>,
    calls: Mutex<HashMap<String, usize>>,
    tree_calls: AtomicUsize,
    blob_calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockRemoteApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve tree `sha` with `(path, type, sha)` entries.
    pub fn with_tree(mut self, sha: &str, entries: &[(&str, &str, &str)]) -> Self {
        let tree: Vec<serde_json::Value> = entries
            .iter()
            .map(|(path, kind, child)| {
                let mode = if *kind == "tree" { "040000" } else { "100644" };
                serde_json::json!({ "path": path, "mode": mode, "type": kind, "sha": child })
            })
            .collect();
        let body = serde_json::json!({ "sha": sha, "tree": tree, "truncated": false });
        self.trees.insert(sha.to_string(), body.to_string().into_bytes());
        self
    }

    /// Serve tree `sha` with an arbitrary body.
    pub fn with_raw_tree(mut self, sha: &str, body: &[u8]) -> Self {
        self.trees.insert(sha.to_string(), body.to_vec());
        self
    }

    /// Serve blob `sha` with `content`, base64-encoded.
    pub fn with_blob(mut self, sha: &str, content: &[u8]) -> Self {
        let body = serde_json::json!({
            "sha": sha,
            "size": content.len(),
            "encoding": "base64",
            "content": STANDARD.encode(content),
        });
        self.blobs.insert(sha.to_string(), body.to_string().into_bytes());
        self
    }

    pub fn with_failure(self, sha: &str, failure: MockFailure) -> Self {
        self.set_failure(sha, failure);
        self
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failure(&self, sha: &str, failure: MockFailure) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sha.to_string(), failure);
    }

    pub fn clear_failure(&self, sha: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sha);
    }

    pub fn tree_calls(&self) -> usize {
        self.tree_calls.load(Ordering::SeqCst)
    }

    pub fn blob_calls(&self) -> usize {
        self.blob_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.tree_calls() + self.blob_calls()
    }

    /// Number of calls made for object `sha`, of either kind.
    pub fn calls_for(&self, sha: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sha)
            .copied()
            .unwrap_or(0)
    }

    async fn answer(&self, sha: &str, store: &HashMap<String, Vec<u8>>) -> Result<Vec<u8>, ApiError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(sha.to_string())
            .or_default() += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sha)
            .copied();
        if let Some(failure) = failure {
            return Err(failure.to_error(sha));
        }

        store
            .get(sha)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("mock://{sha}")))
    }
}

#[async_trait]
impl RemoteApi for MockRemoteApi {
    async fn get_tree_listing(
        &self,
        _owner: &str,
        _repo: &str,
        sha: &str,
    ) -> Result<Vec<u8>, ApiError> {
        self.tree_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(sha, &self.trees).await
    }

    async fn get_blob(&self, _owner: &str, _repo: &str, sha: &str) -> Result<Vec<u8>, ApiError> {
        self.blob_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(sha, &self.blobs).await
    }
}
