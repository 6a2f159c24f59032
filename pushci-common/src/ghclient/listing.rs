//! Wire formats for tree listings and blobs.

use crate::object::{Blob, BlobEncoding, FileMode, InvalidEntryName, ObjectKind};
use crate::types::{ObjectId, is_safe_path_segment};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors raised while parsing a listing or blob payload.
#[derive(Debug, Error)]
pub enum ListingError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("listing is for {actual}, expected {expected}")]
    ShaMismatch { expected: ObjectId, actual: ObjectId },

    #[error("listing was truncated by the remote")]
    Truncated,

    #[error("invalid entry name {0:?}")]
    InvalidEntryName(String),

    #[error("duplicate entry name {0:?}")]
    DuplicateEntryName(String),
}

#[derive(Deserialize)]
struct RawListing {
    sha: ObjectId,
    #[serde(default)]
    tree: Vec<RawEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct RawEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: ObjectId,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Deserialize)]
struct RawBlob {
    sha: ObjectId,
    encoding: BlobEncoding,
    content: String,
}

/// One child of a tree listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRef {
    pub name: String,
    pub kind: ObjectKind,
    pub id: ObjectId,
    pub mode: FileMode,
}

/// Parse a tree listing into its child descriptors, in listing order.
///
/// Submodule entries (`commit`) are skipped. Entry names must be a single
/// path component so materialization cannot leave the destination.
pub fn parse_tree_listing(expected: &ObjectId, raw: &[u8]) -> Result<Vec<ChildRef>, ListingError> {
    let listing: RawListing = serde_json::from_slice(raw)?;

    if &listing.sha != expected {
        return Err(ListingError::ShaMismatch {
            expected: expected.clone(),
            actual: listing.sha,
        });
    }
    if listing.truncated {
        return Err(ListingError::Truncated);
    }

    let mut children: Vec<ChildRef> = Vec::with_capacity(listing.tree.len());
    for entry in listing.tree {
        let kind = match entry.kind.as_str() {
            "blob" => ObjectKind::Blob,
            "tree" => ObjectKind::Tree,
            other => {
                debug!(path = %entry.path, kind = other, "skipping unsupported tree entry");
                continue;
            }
        };
        validate_entry_name(&entry.path)?;
        if children.iter().any(|child| child.name == entry.path) {
            return Err(ListingError::DuplicateEntryName(entry.path));
        }

        let mode = entry
            .mode
            .as_deref()
            .and_then(FileMode::from_git_mode)
            .unwrap_or(match kind {
                ObjectKind::Tree => FileMode::Directory,
                ObjectKind::Blob => FileMode::Regular,
            });

        children.push(ChildRef {
            name: entry.path,
            kind,
            id: entry.sha,
            mode,
        });
    }
    Ok(children)
}

/// Parse a blob payload.
pub fn parse_blob(expected: &ObjectId, raw: &[u8]) -> Result<Blob, ListingError> {
    let blob: RawBlob = serde_json::from_slice(raw)?;
    if &blob.sha != expected {
        return Err(ListingError::ShaMismatch {
            expected: expected.clone(),
            actual: blob.sha,
        });
    }
    Ok(Blob::new(blob.sha, blob.encoding, blob.content))
}

fn validate_entry_name(name: &str) -> Result<(), ListingError> {
    if !is_safe_path_segment(name) {
        return Err(ListingError::InvalidEntryName(name.to_string()));
    }
    Ok(())
}

impl From<InvalidEntryName> for ListingError {
    fn from(err: InvalidEntryName) -> Self {
        Self::InvalidEntryName(err.0)
    }
}
