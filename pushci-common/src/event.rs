//! Push event adapter.
//!
//! Converts a raw push webhook payload into the [`Repository`] and
//! [`Reference`] values that seed a job. Unknown fields are ignored; a payload
//! that cannot be parsed produces an error and nothing else.

use crate::errors::ErrorCode;
use crate::types::{Commit, Reference, Repository, is_safe_path_segment};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors produced while parsing an inbound event.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed push payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("push payload is missing {0}")]
    MissingField(&'static str),

    #[error("{field} {value:?} is not a single path component")]
    UnsafeName { field: &'static str, value: String },
}

impl EventError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Malformed(_) => ErrorCode::EventMalformed,
            Self::MissingField(_) => ErrorCode::EventMissingField,
            Self::UnsafeName { .. } => ErrorCode::EventUnsafeName,
        }
    }
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(rename = "ref", default)]
    ref_name: Option<String>,
    #[serde(default)]
    head_commit: Option<Commit>,
    repository: Repository,
}

/// A parsed push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    /// Full reference name, e.g. `refs/heads/main`. Empty when the payload
    /// carried no `ref`.
    pub ref_name: String,
    pub repo: Repository,
}

impl Push {
    /// Parse a full push event, including the pushed reference.
    pub fn from_payload(payload: &[u8]) -> Result<Self, EventError> {
        let parsed: PushPayload = serde_json::from_slice(payload)?;
        let mut repo = parsed.repository;

        if repo.name.is_empty() {
            return Err(EventError::MissingField("repository.name"));
        }
        if repo.owner.login.is_empty() {
            return Err(EventError::MissingField("repository.owner.login"));
        }

        // These become workspace directory names.
        check_segment("repository.owner.login", &repo.owner.login)?;
        check_segment("repository.name", &repo.name)?;
        if let Some(head) = &parsed.head_commit {
            check_segment("head_commit.id", head.id.as_str())?;
        }

        let ref_name = parsed.ref_name.unwrap_or_default();
        if !ref_name.is_empty() {
            repo.refs.insert(
                ref_name.clone(),
                Reference {
                    name: ref_name.clone(),
                    head: parsed.head_commit,
                },
            );
        }

        debug!(
            repo = %repo.full_name(),
            ref_name = %ref_name,
            fork = repo.fork,
            "Parsed push event"
        );

        Ok(Self { ref_name, repo })
    }

    /// Parse a push payload and return only its repository.
    pub fn handle(payload: &[u8]) -> Result<Repository, EventError> {
        Self::from_payload(payload).map(|push| push.repo)
    }

    /// The reference this push updated, if the payload named one.
    pub fn reference(&self) -> Option<&Reference> {
        self.repo.reference(&self.ref_name)
    }

    /// Head commit of the pushed reference.
    pub fn head(&self) -> Option<&Commit> {
        self.reference().and_then(Reference::head)
    }
}

fn check_segment(field: &'static str, value: &str) -> Result<(), EventError> {
    if is_safe_path_segment(value) {
        Ok(())
    } else {
        Err(EventError::UnsafeName {
            field,
            value: value.to_string(),
        })
    }
}
