//! Result publication.

use crate::events::{EventBus, JOB_FINISHED};
use crate::job::JobReport;
use async_trait::async_trait;
use pushci_common::{ApiError, CommitStatus, ErrorCode, GithubApi, StatusState};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// GitHub rejects longer status descriptions.
const MAX_STATUS_DESCRIPTION: usize = 140;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("commit status update failed: {0}")]
    Api(#[from] ApiError),

    #[error("report could not be serialized")]
    Serialize,

    #[error("report has no commit to attach a status to")]
    NoCommit,
}

impl PublishError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Serialize => ErrorCode::ReportSerializeFailed,
            Self::Api(_) | Self::NoCommit => ErrorCode::ReportPublishFailed,
        }
    }
}

/// Receives the final report of every job.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, report: &JobReport) -> Result<(), PublishError>;
}

/// Emits `job_finished` on the event bus.
#[derive(Clone)]
pub struct EventBusPublisher {
    events: EventBus,
}

impl EventBusPublisher {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }
}

#[async_trait]
impl ResultPublisher for EventBusPublisher {
    async fn publish(&self, report: &JobReport) -> Result<(), PublishError> {
        if self.events.emit(JOB_FINISHED, report) {
            Ok(())
        } else {
            Err(PublishError::Serialize)
        }
    }
}

/// Posts a commit status for the pushed commit.
pub struct GithubStatusPublisher {
    api: Arc<GithubApi>,
    context: String,
    target_url: Option<String>,
}

impl GithubStatusPublisher {
    pub fn new(api: Arc<GithubApi>, context: impl Into<String>) -> Self {
        Self {
            api,
            context: context.into(),
            target_url: None,
        }
    }

    #[must_use]
    pub fn with_target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    /// Status body for `report`.
    pub fn status_for(&self, report: &JobReport) -> CommitStatus {
        let state = if report.resource_error.is_some() {
            StatusState::Error
        } else if report.success {
            StatusState::Success
        } else {
            StatusState::Failure
        };
        let mut description = report.summary();
        if description.len() > MAX_STATUS_DESCRIPTION {
            let mut cut = MAX_STATUS_DESCRIPTION;
            while !description.is_char_boundary(cut) {
                cut -= 1;
            }
            description.truncate(cut);
        }
        CommitStatus {
            state,
            description,
            context: self.context.clone(),
            target_url: self.target_url.clone(),
        }
    }
}

#[async_trait]
impl ResultPublisher for GithubStatusPublisher {
    async fn publish(&self, report: &JobReport) -> Result<(), PublishError> {
        let commit = report.commit.as_ref().ok_or(PublishError::NoCommit)?;
        let status = self.status_for(report);
        self.api
            .create_status(&report.owner, &report.repository, commit.as_str(), &status)
            .await?;
        debug!(
            repo = %report.full_name(),
            commit = %commit.short(),
            state = ?status.state,
            "commit status posted"
        );
        Ok(())
    }
}

/// Publishes to every inner publisher, even after a failure. Returns the
/// first error.
#[derive(Default)]
pub struct FanoutPublisher {
    publishers: Vec<Arc<dyn ResultPublisher>>,
}

impl FanoutPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, publisher: Arc<dyn ResultPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

}

#[async_trait]
impl ResultPublisher for FanoutPublisher {
    async fn publish(&self, report: &JobReport) -> Result<(), PublishError> {
        let mut first_error = None;
        for publisher in &self.publishers {
            if let Err(err) = publisher.publish(report).await {
                warn!(error = %err, "publisher failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
