//! Common types shared by the event adapter, the object client, and jobs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Content address of a remote object (a git SHA as reported by the API).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form used in directory names and log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(idx, _)| idx)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// True when `name` can be joined onto a directory as exactly one component:
/// non-empty, not `.` or `..`, and free of separators and NUL bytes.
pub fn is_safe_path_segment(name: &str) -> bool {
    !(name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0'))
}

/// Account that owns a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub login: String,
}

/// Commit at the head of a pushed reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Commit SHA.
    pub id: ObjectId,
    /// Root tree SHA of the commit.
    pub tree_id: ObjectId,
    /// Commit message (first line is used in status descriptions).
    #[serde(default)]
    pub message: String,
}

/// A named reference (e.g. `refs/heads/main`) and the commit it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
    /// Head commit. Absent for pushes that delete the reference.
    pub head: Option<Commit>,
}

impl Reference {
    pub fn head(&self) -> Option<&Commit> {
        self.head.as_ref()
    }

    /// Short name with the `refs/heads/` or `refs/tags/` prefix removed.
    pub fn short_name(&self) -> &str {
        self.name
            .strip_prefix("refs/heads/")
            .or_else(|| self.name.strip_prefix("refs/tags/"))
            .unwrap_or(&self.name)
    }
}

/// Repository a push event was delivered for.
///
/// Produced once per inbound event and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub fork: bool,
    pub owner: Owner,
    #[serde(skip)]
    pub refs: HashMap<String, Reference>,
}

impl Repository {
    /// `owner/name`, as used in API paths and log lines.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner.login, self.name)
    }

    pub fn reference(&self, name: &str) -> Option<&Reference> {
        self.refs.get(name)
    }
}
