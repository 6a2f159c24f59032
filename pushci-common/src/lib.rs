//! pushci common library
//!
//! Shared types and the object pipeline used by the pushci runner: the push
//! event adapter, the remote object client with its content-addressed cache,
//! the in-memory object graph, configuration, logging, and the error catalog.

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod event;
pub mod ghclient;
pub mod logging;
pub mod mock_api;
pub mod object;
pub mod testing;
pub mod types;

pub use config::{CiConfig, ConfigError, GeneralConfig, GithubConfig, JobConfig};
pub use errors::{ErrorCategory, ErrorCode, ErrorEntry};
pub use event::{EventError, Push};
pub use ghclient::{ApiError, Client, CommitStatus, FetchError, GithubApi, RemoteApi, StatusState};
pub use logging::{LogConfig, LogFormat, LoggingError, LoggingGuards, init_logging};
pub use mock_api::{MockFailure, MockRemoteApi};
pub use object::{
    Blob, BlobEncoding, CacheStats, FileMode, InvalidEntryName, MaterializeError, Node,
    ObjectCache, ObjectKind, Tree, TreeEntry,
};
pub use types::{Commit, ObjectId, Owner, Reference, Repository, is_safe_path_segment};

