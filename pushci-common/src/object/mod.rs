//! In-memory model of the remote object graph.
//!
//! A commit's content is a DAG of trees (directories) and blobs (files), each
//! identified by its content hash. Nodes are immutable once built and shared
//! through [`Arc`], so the same subtree or file can sit under any number of
//! parents. Names live on the edges ([`TreeEntry`]), not on the nodes, and a
//! node never points back at a parent. Use
//! [`ObjectCache::referrers`](cache::ObjectCache::referrers) to find which trees
//! are known to reference a hash.

pub mod cache;

pub use cache::{CacheStats, ObjectCache};

use crate::errors::ErrorCode;
use crate::types::{ObjectId, is_safe_path_segment};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Kind of a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Tree,
    Blob,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tree => write!(f, "tree"),
            Self::Blob => write!(f, "blob"),
        }
    }
}

/// File mode of a tree entry, as reported in a tree listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMode {
    #[default]
    Regular,
    Executable,
    Symlink,
    Directory,
}

impl FileMode {
    /// Parse a git octal mode string (`100644`, `100755`, `120000`, `040000`).
    pub fn from_git_mode(mode: &str) -> Option<Self> {
        match mode {
            "100644" | "100664" => Some(Self::Regular),
            "100755" => Some(Self::Executable),
            "120000" => Some(Self::Symlink),
            "040000" | "40000" => Some(Self::Directory),
            _ => None,
        }
    }
}

/// Errors raised while writing nodes to the filesystem.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("blob {id} has invalid base64 content: {source}")]
    Decode {
        id: ObjectId,
        #[source]
        source: base64::DecodeError,
    },

    #[error("blob {id} holds a symlink target that is not valid UTF-8")]
    InvalidLinkTarget { id: ObjectId },
}

/// A tree entry name that is not a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid entry name {0:?}")]
pub struct InvalidEntryName(pub String);

impl MaterializeError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::WorkspaceWriteFailed,
            Self::Decode { .. } | Self::InvalidLinkTarget { .. } => {
                ErrorCode::WorkspaceDecodeFailed
            }
        }
    }
}

/// Encoding of a blob's content as delivered by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobEncoding {
    #[serde(rename = "base64")]
    Base64,
    #[serde(rename = "utf-8")]
    Utf8,
}

/// File content, kept in its transport encoding until materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    id: ObjectId,
    encoding: BlobEncoding,
    content: String,
}

impl Blob {
    pub fn new(id: ObjectId, encoding: BlobEncoding, content: impl Into<String>) -> Self {
        Self {
            id,
            encoding,
            content: content.into(),
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn encoding(&self) -> BlobEncoding {
        self.encoding
    }

    pub fn encoded_content(&self) -> &str {
        &self.content
    }

    /// Decode the content into raw bytes.
    ///
    /// Base64 content from the API is wrapped at 60 columns, so ASCII
    /// whitespace is stripped before decoding.
    pub fn decode(&self) -> Result<Vec<u8>, MaterializeError> {
        match self.encoding {
            BlobEncoding::Utf8 => Ok(self.content.as_bytes().to_vec()),
            BlobEncoding::Base64 => {
                let compact: String = self
                    .content
                    .chars()
                    .filter(|c| !c.is_ascii_whitespace())
                    .collect();
                STANDARD
                    .decode(compact)
                    .map_err(|source| MaterializeError::Decode {
                        id: self.id.clone(),
                        source,
                    })
            }
        }
    }

    /// Write the decoded content to `dest` as a regular file.
    pub fn materialize(&self, dest: &Path) -> Result<(), MaterializeError> {
        self.write_with_mode(dest, FileMode::Regular)
    }

    fn write_with_mode(&self, dest: &Path, mode: FileMode) -> Result<(), MaterializeError> {
        let bytes = self.decode()?;

        if mode == FileMode::Symlink {
            return self.write_symlink(dest, bytes);
        }

        // A previous run may have left a symlink here; never write through it.
        if let Ok(meta) = fs::symlink_metadata(dest)
            && meta.file_type().is_symlink()
        {
            fs::remove_file(dest).map_err(|e| MaterializeError::io(dest, e))?;
        }

        fs::write(dest, &bytes).map_err(|e| MaterializeError::io(dest, e))?;
        set_executable(dest, mode == FileMode::Executable)
    }

    #[cfg(unix)]
    fn write_symlink(&self, dest: &Path, bytes: Vec<u8>) -> Result<(), MaterializeError> {
        let target = String::from_utf8(bytes)
            .map_err(|_| MaterializeError::InvalidLinkTarget { id: self.id.clone() })?;
        if fs::symlink_metadata(dest).is_ok() {
            fs::remove_file(dest).map_err(|e| MaterializeError::io(dest, e))?;
        }
        std::os::unix::fs::symlink(&target, dest).map_err(|e| MaterializeError::io(dest, e))
    }

    #[cfg(not(unix))]
    fn write_symlink(&self, dest: &Path, bytes: Vec<u8>) -> Result<(), MaterializeError> {
        fs::write(dest, bytes).map_err(|e| MaterializeError::io(dest, e))
    }
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> Result<(), MaterializeError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| MaterializeError::io(path, e))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> Result<(), MaterializeError> {
    Ok(())
}

/// A named edge from a tree to one of its children.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    name: String,
    mode: FileMode,
    node: Node,
}

impl TreeEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn node(&self) -> &Node {
        &self.node
    }
}

/// A directory: an ordered list of named children.
#[derive(Debug, Clone)]
pub struct Tree {
    id: ObjectId,
    entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            entries: Vec::new(),
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Append `child` under `name`.
    ///
    /// Only possible while the tree is being assembled; once it is shared
    /// through an [`Arc`] it is frozen. `name` must be a single path
    /// component, so materializing never leaves the destination directory.
    pub fn attach_child(
        &mut self,
        name: impl Into<String>,
        mode: FileMode,
        child: Node,
    ) -> Result<(), InvalidEntryName> {
        let name = name.into();
        if !is_safe_path_segment(&name) {
            return Err(InvalidEntryName(name));
        }
        let mode = match child {
            Node::Tree(_) => FileMode::Directory,
            Node::Blob(_) if mode == FileMode::Directory => FileMode::Regular,
            Node::Blob(_) => mode,
        };
        self.entries.push(TreeEntry {
            name,
            mode,
            node: child,
        });
        Ok(())
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn children(&self) -> impl Iterator<Item = &Node> {
        self.entries.iter().map(TreeEntry::node)
    }

    pub fn entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Create `dest` as a directory and write every descendant beneath it.
    pub fn materialize(&self, dest: &Path) -> Result<(), MaterializeError> {
        fs::create_dir_all(dest).map_err(|e| MaterializeError::io(dest, e))?;

        for entry in &self.entries {
            let path = dest.join(&entry.name);
            match &entry.node {
                Node::Tree(tree) => tree.materialize(&path)?,
                Node::Blob(blob) => blob.write_with_mode(&path, entry.mode)?,
            }
        }
        Ok(())
    }
}

/// Either kind of object in the graph.
#[derive(Debug, Clone)]
pub enum Node {
    Tree(Arc<Tree>),
    Blob(Arc<Blob>),
}

impl Node {
    pub fn id(&self) -> &ObjectId {
        match self {
            Self::Tree(tree) => tree.id(),
            Self::Blob(blob) => blob.id(),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Tree(_) => ObjectKind::Tree,
            Self::Blob(_) => ObjectKind::Blob,
        }
    }

    /// Child edges; always empty for a blob.
    pub fn children(&self) -> &[TreeEntry] {
        match self {
            Self::Tree(tree) => tree.entries(),
            Self::Blob(_) => &[],
        }
    }

    pub fn as_tree(&self) -> Option<&Arc<Tree>> {
        match self {
            Self::Tree(tree) => Some(tree),
            Self::Blob(_) => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Arc<Blob>> {
        match self {
            Self::Tree(_) => None,
            Self::Blob(blob) => Some(blob),
        }
    }

    /// Write this node (and for a tree, everything below it) to `dest`.
    ///
    /// Writing the same node to the same path twice yields identical bytes.
    pub fn materialize(&self, dest: &Path) -> Result<(), MaterializeError> {
        match self {
            Self::Tree(tree) => tree.materialize(dest),
            Self::Blob(blob) => blob.materialize(dest),
        }
    }
}

impl From<Arc<Tree>> for Node {
    fn from(tree: Arc<Tree>) -> Self {
        Self::Tree(tree)
    }
}

impl From<Arc<Blob>> for Node {
    fn from(blob: Arc<Blob>) -> Self {
        Self::Blob(blob)
    }
}
