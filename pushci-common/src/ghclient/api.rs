//! Remote object API.
//!
//! [`RemoteApi`] is the fetch capability the tree builder depends on. It
//! returns raw JSON so parsing stays in one place and parse failures stay
//! distinguishable from transport failures. [`GithubApi`] implements it over
//! the GitHub REST API.

use crate::config::GithubConfig;
use crate::errors::ErrorCode;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Transport-level failures from the remote API.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("HTTP {status} from {url}: {message}")]
    Status {
        status: u16,
        url: String,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::FetchNotFound,
            Self::Status { .. } => ErrorCode::FetchHttpStatus,
            Self::Transport(_) => ErrorCode::FetchTransport,
        }
    }
}

/// Fetch capability for trees and blobs of a repository.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Raw JSON listing of the tree `sha` (non-recursive).
    async fn get_tree_listing(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<u8>, ApiError>;

    /// Raw JSON payload of the blob `sha`.
    async fn get_blob(&self, owner: &str, repo: &str, sha: &str) -> Result<Vec<u8>, ApiError>;
}

/// State of a commit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

/// Body of a commit status update.
#[derive(Debug, Clone, Serialize)]
pub struct CommitStatus {
    pub state: StatusState,
    pub description: String,
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

/// GitHub REST API client.
#[derive(Debug, Clone)]
pub struct GithubApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl GithubApi {
    pub fn new(
        base_url: impl Into<String>,
        user_agent: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &GithubConfig) -> Result<Self, ApiError> {
        Self::new(
            config.api_url.clone(),
            &config.user_agent,
            config.token.clone(),
            config.request_timeout(),
        )
    }

    fn repo_url(&self, owner: &str, repo: &str, rest: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.base_url, owner, repo, rest)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_bytes(&self, url: String) -> Result<Vec<u8>, ApiError> {
        debug!(url = %url, "GET");
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(url));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                url,
                message,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(body.to_vec())
    }

    /// Create a commit status (`POST /repos/{owner}/{repo}/statuses/{sha}`).
    pub async fn create_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<(), ApiError> {
        let url = self.repo_url(owner, repo, &format!("statuses/{sha}"));
        debug!(url = %url, state = ?status.state, "POST commit status");
        let response = self
            .request(self.client.post(&url))
            .json(status)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let code = response.status();
        if code == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(url));
        }
        if !code.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: code.as_u16(),
                url,
                message,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for GithubApi {
    async fn get_tree_listing(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<u8>, ApiError> {
        self.get_bytes(self.repo_url(owner, repo, &format!("git/trees/{sha}")))
            .await
    }

    async fn get_blob(&self, owner: &str, repo: &str, sha: &str) -> Result<Vec<u8>, ApiError> {
        self.get_bytes(self.repo_url(owner, repo, &format!("git/blobs/{sha}")))
            .await
    }
}
