//! Push job lifecycle.
//!
//! A job walks `Created -> AcquiringResources -> RunningScript ->
//! RunningAfterScript -> ReportingResults -> Done`, strictly in order. Every
//! run reaches the after-script and reporting phases, whatever happened
//! before them.
//!
//! Two cancellation scopes exist per job:
//! - the script scope: the `ctx` passed to [`Job::run`] plus the job's own
//!   cancel handle, bounded by the script deadline;
//! - the cleanup scope: a token owned by the process (hard stop) and handed
//!   in at construction, bounded by the after-script deadline.
//!
//! Nothing in the script scope reaches the cleanup scope.

use crate::events::{EventBus, JOB_PHASE_CHANGED};
use crate::executor::{OutputCapture, ScriptOutput, ScriptRequest, ScriptRunner};
use crate::reporter::{PublishError, ResultPublisher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pushci_common::config::MAX_SCRIPT_TIMEOUT_SECS;
use pushci_common::{
    CiConfig, Client, Commit, ErrorCode, FetchError, MaterializeError, ObjectId, Repository,
    Tree, is_safe_path_segment,
};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Created,
    AcquiringResources,
    RunningScript,
    RunningAfterScript,
    ReportingResults,
    Done,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::AcquiringResources => write!(f, "acquiring_resources"),
            Self::RunningScript => write!(f, "running_script"),
            Self::RunningAfterScript => write!(f, "running_after_script"),
            Self::ReportingResults => write!(f, "reporting_results"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// How a script phase ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScriptOutcome {
    Succeeded,
    Failed { exit_code: Option<i32> },
    TimedOut,
    Cancelled,
    Skipped,
    Error { message: String },
}

impl ScriptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Succeeded | Self::Skipped => None,
            Self::Failed { .. } => Some(ErrorCode::ScriptFailed),
            Self::TimedOut => Some(ErrorCode::ScriptTimeout),
            Self::Cancelled => Some(ErrorCode::ScriptCancelled),
            Self::Error { .. } => Some(ErrorCode::ScriptSpawnFailed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub outcome: ScriptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<ScriptOutput>,
    pub duration_ms: u64,
}

impl PhaseReport {
    pub fn skipped() -> Self {
        Self {
            outcome: ScriptOutcome::Skipped,
            output: None,
            duration_ms: 0,
        }
    }
}

/// Why the workspace could not be prepared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceFailure {
    pub code: String,
    pub message: String,
}

impl From<&JobError> for ResourceFailure {
    fn from(err: &JobError) -> Self {
        Self {
            code: err.code().code_string(),
            message: err.to_string(),
        }
    }
}

/// Aggregate result of one job, as published.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub ref_name: String,
    pub owner: String,
    pub repository: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<ObjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree: Option<ObjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_error: Option<ResourceFailure>,
    pub script: PhaseReport,
    pub after_script: PhaseReport,
    /// True only when resources were acquired and the script succeeded.
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl JobReport {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repository)
    }

    /// One line for logs and commit statuses.
    pub fn summary(&self) -> String {
        if let Some(failure) = &self.resource_error {
            return format!("could not prepare workspace ({})", failure.code);
        }
        match &self.script.outcome {
            ScriptOutcome::Succeeded => "build passed".to_string(),
            ScriptOutcome::Failed {
                exit_code: Some(code),
            } => format!("build failed (exit {code})"),
            ScriptOutcome::Failed { exit_code: None } => "build killed by signal".to_string(),
            ScriptOutcome::TimedOut => "build timed out".to_string(),
            ScriptOutcome::Cancelled => "build cancelled".to_string(),
            ScriptOutcome::Skipped => "build skipped".to_string(),
            ScriptOutcome::Error { .. } => "build could not start".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("reference {0:?} has no head commit")]
    NoHeadCommit(String),

    #[error("{field} {value:?} cannot be used as a workspace directory name")]
    UnsafeName { field: &'static str, value: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("failed to create workspace {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error("materialization task failed: {0}")]
    MaterializeTask(String),

    #[error("job has already run")]
    AlreadyRun,
}

impl JobError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoHeadCommit(_) => ErrorCode::EventNoHeadCommit,
            Self::UnsafeName { .. } => ErrorCode::EventUnsafeName,
            Self::Fetch(e) => e.code(),
            Self::Workspace { .. } => ErrorCode::WorkspaceCreateFailed,
            Self::Materialize(e) => e.code(),
            Self::MaterializeTask(_) => ErrorCode::WorkspaceWriteFailed,
            Self::AlreadyRun => ErrorCode::JobAlreadyRun,
        }
    }
}

/// What a scheduler needs to drive a job.
#[async_trait]
pub trait Job: Send + Sync {
    /// Run every phase once. `ctx` cancels the script phase only.
    async fn run(&self, ctx: CancellationToken) -> Result<JobReport, JobError>;

    /// Cancel the script phase. Idempotent, callable from any task at any time.
    fn cancel(&self);

    fn ref_name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub base_path: PathBuf,
    pub script: String,
    pub after_script: String,
    pub script_timeout: Duration,
    pub after_script_timeout: Duration,
}

impl JobSettings {
    pub fn from_config(config: &CiConfig) -> Self {
        Self {
            base_path: config.general.base_path.clone(),
            script: config.job.script.clone(),
            after_script: config.job.after_script.clone(),
            script_timeout: config.job.script_timeout(),
            after_script_timeout: config.job.after_script_timeout(),
        }
    }
}

/// A job triggered by one push.
pub struct PushJob {
    client: Client,
    repo: Repository,
    ref_name: String,
    settings: JobSettings,
    runner: Arc<dyn ScriptRunner>,
    publisher: Arc<dyn ResultPublisher>,
    events: Option<EventBus>,
    cancel: CancellationToken,
    cleanup: CancellationToken,
    phase: watch::Sender<JobPhase>,
    started: AtomicBool,
}

impl PushJob {
    /// `cleanup` bounds the after-script phase alongside its own deadline.
    /// Pass a token that only a process-wide shutdown cancels.
    pub fn new(
        client: Client,
        repo: Repository,
        ref_name: impl Into<String>,
        settings: JobSettings,
        runner: Arc<dyn ScriptRunner>,
        publisher: Arc<dyn ResultPublisher>,
        cleanup: CancellationToken,
    ) -> Self {
        let (phase, _) = watch::channel(JobPhase::Created);
        Self {
            client,
            repo,
            ref_name: ref_name.into(),
            settings,
            runner,
            publisher,
            events: None,
            cancel: CancellationToken::new(),
            cleanup,
            phase,
            started: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    #[cfg(test)]
    pub fn subscribe_phase(&self) -> watch::Receiver<JobPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> JobPhase {
        *self.phase.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn head(&self) -> Option<&Commit> {
        self.repo.reference(&self.ref_name).and_then(|r| r.head())
    }

    /// `{base_path}/{owner}/{repo}/{commit}`, the parent of every workspace
    /// built for the pushed commit.
    pub fn commit_dir(&self) -> Result<PathBuf, JobError> {
        let commit = self
            .head()
            .ok_or_else(|| JobError::NoHeadCommit(self.ref_name.clone()))?;
        let segments = [
            ("repository.owner.login", self.repo.owner.login.as_str()),
            ("repository.name", self.repo.name.as_str()),
            ("head_commit.id", commit.id.as_str()),
        ];
        let mut dir = self.settings.base_path.clone();
        for (field, value) in segments {
            if !is_safe_path_segment(value) {
                return Err(JobError::UnsafeName {
                    field,
                    value: value.to_string(),
                });
            }
            dir.push(value);
        }
        Ok(dir)
    }

    /// Create a new `run-*` directory under [`Self::commit_dir`]. Every job
    /// gets its own, even when several build the same commit.
    async fn create_workspace(&self) -> Result<PathBuf, JobError> {
        let parent = self.commit_dir()?;
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|source| JobError::Workspace {
                path: parent.clone(),
                source,
            })?;
        let dir = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(&parent)
            .map_err(|source| JobError::Workspace {
                path: parent.clone(),
                source,
            })?;
        Ok(dir.keep())
    }

    fn set_phase(&self, phase: JobPhase) {
        self.phase.send_replace(phase);
        debug!(ref_name = %self.ref_name, %phase, "job phase");
        if let Some(events) = &self.events {
            events.emit(
                JOB_PHASE_CHANGED,
                &serde_json::json!({
                    "repository": self.repo.full_name(),
                    "ref": self.ref_name,
                    "phase": phase,
                }),
            );
        }
    }

    /// Resolve the pushed commit's tree, fetch it, and write it into
    /// `workspace`.
    pub async fn get_resources(&self, workspace: &Path) -> Result<Arc<Tree>, JobError> {
        let commit = self
            .head()
            .ok_or_else(|| JobError::NoHeadCommit(self.ref_name.clone()))?;

        let tree = self.client.get_tree(&commit.tree_id, &self.repo).await?;

        let dest = workspace.to_path_buf();
        let materialized = tree.clone();
        tokio::task::spawn_blocking(move || materialized.materialize(&dest))
            .await
            .map_err(|e| JobError::MaterializeTask(e.to_string()))??;

        info!(
            tree = %tree.id(),
            workspace = %workspace.display(),
            "workspace ready"
        );
        Ok(tree)
    }

    /// Run the build script under `ctx`, the job's cancel handle, and the
    /// script deadline (never more than 300 seconds).
    pub async fn run_script(&self, ctx: &CancellationToken, workspace: &Path) -> PhaseReport {
        let deadline = self
            .settings
            .script_timeout
            .min(Duration::from_secs(MAX_SCRIPT_TIMEOUT_SECS));
        let request = self.script_request(&self.settings.script, workspace);
        let stopped = async {
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = self.cancel.cancelled() => {}
            }
        };
        let report = self.execute(&request, deadline, stopped).await;
        match report.outcome.code() {
            Some(code) => warn!(
                code = %code.code_string(),
                outcome = ?report.outcome,
                duration_ms = report.duration_ms,
                "script did not succeed"
            ),
            None => info!(duration_ms = report.duration_ms, "script finished"),
        }
        report
    }

    /// Run the cleanup script under `ctx` and the after-script deadline only.
    pub async fn run_after_script(&self, ctx: &CancellationToken, workspace: &Path) -> PhaseReport {
        if self.settings.after_script.trim().is_empty() {
            return PhaseReport::skipped();
        }
        let request = self.script_request(&self.settings.after_script, workspace);
        let report = self
            .execute(&request, self.settings.after_script_timeout, ctx.cancelled())
            .await;
        if !report.outcome.is_success() {
            warn!(
                code = %ErrorCode::AfterScriptFailed.code_string(),
                outcome = ?report.outcome,
                "after-script did not succeed"
            );
        }
        report
    }

    /// Publish the report. Failures are returned for logging; nothing retries.
    pub async fn post_results(&self, report: &JobReport) -> Result<(), PublishError> {
        self.publisher.publish(report).await
    }

    fn script_request(&self, command: &str, workspace: &Path) -> ScriptRequest {
        let mut request = ScriptRequest::new(command, workspace)
            .with_env("PUSHCI_REF", &self.ref_name)
            .with_env("PUSHCI_REPOSITORY", self.repo.full_name())
            .with_env("PUSHCI_WORKSPACE", workspace.display().to_string());
        if let Some(commit) = self.head() {
            request = request.with_env("PUSHCI_COMMIT", commit.id.as_str());
        }
        request
    }

    async fn execute(
        &self,
        request: &ScriptRequest,
        deadline: Duration,
        stopped: impl Future<Output = ()>,
    ) -> PhaseReport {
        let started = Instant::now();
        let capture = OutputCapture::default();
        // The runner future is dropped (and its processes killed) before the
        // partial output is read.
        let finished = tokio::select! {
            biased;
            _ = stopped => None,
            result = tokio::time::timeout(deadline, self.runner.run(request, &capture)) => Some(result),
        };
        let (outcome, output) = match finished {
            None => (ScriptOutcome::Cancelled, capture.partial()),
            Some(Err(_)) => (ScriptOutcome::TimedOut, capture.partial()),
            Some(Ok(Ok(output))) if output.success() => (ScriptOutcome::Succeeded, Some(output)),
            Some(Ok(Ok(output))) => (
                ScriptOutcome::Failed {
                    exit_code: output.exit_code,
                },
                Some(output),
            ),
            Some(Ok(Err(err))) => {
                warn!(code = %err.code().code_string(), error = %err, "script could not start");
                (
                    ScriptOutcome::Error {
                        message: err.to_string(),
                    },
                    None,
                )
            }
        };
        PhaseReport {
            outcome,
            output,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[async_trait]
impl Job for PushJob {
    #[instrument(skip_all, fields(repo = %self.repo.full_name(), ref_name = %self.ref_name))]
    async fn run(&self, ctx: CancellationToken) -> Result<JobReport, JobError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("job already ran");
            return Err(JobError::AlreadyRun);
        }
        let started_at = Utc::now();
        let clock = Instant::now();
        info!("job started");

        self.set_phase(JobPhase::AcquiringResources);
        let acquired = match self.create_workspace().await {
            Ok(path) => match self.get_resources(&path).await {
                Ok(tree) => Ok((path, tree)),
                Err(err) => Err((Some(path), err)),
            },
            Err(err) => Err((None, err)),
        };

        let (workspace, tree, resource_error, script) = match acquired {
            Ok((path, tree)) => {
                self.set_phase(JobPhase::RunningScript);
                let script = self.run_script(&ctx, &path).await;
                (Some(path), Some(tree.id().clone()), None, script)
            }
            Err((path, err)) => {
                error!(code = %err.code().code_string(), error = %err, "resource acquisition failed");
                (path, None, Some(ResourceFailure::from(&err)), PhaseReport::skipped())
            }
        };

        self.set_phase(JobPhase::RunningAfterScript);
        let after_script = match &workspace {
            Some(path) if path.is_dir() => self.run_after_script(&self.cleanup, path).await,
            _ => PhaseReport::skipped(),
        };

        let commit = self.head().map(|c| c.id.clone());
        let report = JobReport {
            ref_name: self.ref_name.clone(),
            owner: self.repo.owner.login.clone(),
            repository: self.repo.name.clone(),
            commit,
            tree,
            workspace,
            success: resource_error.is_none() && script.outcome.is_success(),
            resource_error,
            script,
            after_script,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
        };

        self.set_phase(JobPhase::ReportingResults);
        if let Err(err) = self.post_results(&report).await {
            warn!(code = %err.code().code_string(), error = %err, "failed to publish results");
        }

        self.set_phase(JobPhase::Done);
        info!(success = report.success, summary = %report.summary(), "job finished");
        Ok(report)
    }

    fn cancel(&self) {
        if !self.is_cancelled() {
            info!(ref_name = %self.ref_name, "cancelling job");
        }
        self.cancel.cancel();
    }

    fn ref_name(&self) -> &str {
        &self.ref_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecError, ShellRunner};
    use pushci_common::{Commit, MockFailure, MockRemoteApi, Owner, Reference};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const BUILD: &str = "build";
    const CLEANUP: &str = "cleanup";

    #[derive(Debug, Clone)]
    enum Behavior {
        Exit(i32),
        SleepThenExit(Duration, i32),
        SpawnError,
    }

    /// Scripted runner: looks up behavior by command and logs start/finish.
    #[derive(Default)]
    struct FakeRunner {
        behaviors: HashMap<String, Behavior>,
        log: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        fn with(mut self, command: &str, behavior: Behavior) -> Self {
            self.behaviors.insert(command.to_string(), behavior);
            self
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl ScriptRunner for FakeRunner {
        async fn run(
            &self,
            request: &ScriptRequest,
            output: &OutputCapture,
        ) -> Result<ScriptOutput, ExecError> {
            self.record(format!("start {}", request.command));
            output.append_stdout(format!("{} started\n", request.command).as_bytes());
            let behavior = self
                .behaviors
                .get(&request.command)
                .cloned()
                .unwrap_or(Behavior::Exit(0));
            let code = match behavior {
                Behavior::Exit(code) => code,
                Behavior::SleepThenExit(delay, code) => {
                    tokio::time::sleep(delay).await;
                    code
                }
                Behavior::SpawnError => {
                    return Err(ExecError::Spawn {
                        command: request.command.clone(),
                        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no shell"),
                    });
                }
            };
            self.record(format!("finish {}", request.command));
            Ok(ScriptOutput {
                exit_code: Some(code),
                stdout: format!("{} output\n", request.command),
                stderr: String::new(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        reports: Mutex<Vec<JobReport>>,
        fail: bool,
    }

    impl RecordingPublisher {
        fn failing() -> Self {
            Self {
                reports: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn count(&self) -> usize {
            self.reports.lock().unwrap().len()
        }

        fn last(&self) -> JobReport {
            self.reports.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ResultPublisher for RecordingPublisher {
        async fn publish(&self, report: &JobReport) -> Result<(), PublishError> {
            self.reports.lock().unwrap().push(report.clone());
            if self.fail {
                return Err(PublishError::NoCommit);
            }
            Ok(())
        }
    }

    fn repo(head: Option<Commit>) -> Repository {
        let mut refs = HashMap::new();
        refs.insert(
            "refs/heads/main".to_string(),
            Reference {
                name: "refs/heads/main".to_string(),
                head,
            },
        );
        Repository {
            name: "Hello-World".to_string(),
            fork: false,
            owner: Owner {
                login: "Codertocat".to_string(),
            },
            refs,
        }
    }

    fn head() -> Option<Commit> {
        Some(Commit {
            id: ObjectId::new("c0ffee"),
            tree_id: ObjectId::new("R"),
            message: "Update README".to_string(),
        })
    }

    fn api() -> MockRemoteApi {
        MockRemoteApi::new()
            .with_tree("R", &[("a.txt", "blob", "F1"), ("sub", "tree", "T2")])
            .with_tree("T2", &[("b.txt", "blob", "F2")])
            .with_blob("F1", b"alpha\n")
            .with_blob("F2", b"beta\n")
    }

    fn settings(base: &Path) -> JobSettings {
        JobSettings {
            base_path: base.to_path_buf(),
            script: BUILD.to_string(),
            after_script: CLEANUP.to_string(),
            script_timeout: Duration::from_secs(5),
            after_script_timeout: Duration::from_secs(1),
        }
    }

    struct Fixture {
        _base: TempDir,
        job: Arc<PushJob>,
        runner: Arc<FakeRunner>,
        publisher: Arc<RecordingPublisher>,
        cleanup: CancellationToken,
    }

    fn fixture_with(
        api: MockRemoteApi,
        head: Option<Commit>,
        runner: FakeRunner,
        publisher: RecordingPublisher,
        tweak: impl FnOnce(&mut JobSettings),
    ) -> Fixture {
        pushci_common::testing::init_global_test_logging();
        let base = TempDir::new().unwrap();
        let mut settings = settings(base.path());
        tweak(&mut settings);
        let runner = Arc::new(runner);
        let publisher = Arc::new(publisher);
        let cleanup = CancellationToken::new();
        let job = PushJob::new(
            Client::new(Arc::new(api)),
            repo(head),
            "refs/heads/main",
            settings,
            runner.clone(),
            publisher.clone(),
            cleanup.clone(),
        );
        Fixture {
            _base: base,
            job: Arc::new(job),
            runner,
            publisher,
            cleanup,
        }
    }

    fn fixture(runner: FakeRunner) -> Fixture {
        fixture_with(api(), head(), runner, RecordingPublisher::default(), |_| {})
    }

    #[tokio::test]
    async fn successful_job_runs_every_phase_in_order() {
        let fx = fixture(FakeRunner::default());
        let report = fx.job.run(CancellationToken::new()).await.unwrap();

        assert!(report.success);
        assert_eq!(report.script.outcome, ScriptOutcome::Succeeded);
        assert_eq!(report.after_script.outcome, ScriptOutcome::Succeeded);
        assert_eq!(report.tree, Some(ObjectId::new("R")));
        assert_eq!(report.commit, Some(ObjectId::new("c0ffee")));
        assert_eq!(
            fx.runner.log(),
            vec!["start build", "finish build", "start cleanup", "finish cleanup"]
        );
        assert_eq!(fx.publisher.count(), 1);
        assert_eq!(fx.job.phase(), JobPhase::Done);

        let workspace = report.workspace.unwrap();
        assert_eq!(
            workspace.parent().unwrap(),
            fx._base.path().join("Codertocat/Hello-World/c0ffee")
        );
        let run_dir = workspace.file_name().unwrap().to_string_lossy().into_owned();
        assert!(run_dir.starts_with("run-"), "{run_dir}");
        assert_eq!(std::fs::read(workspace.join("a.txt")).unwrap(), b"alpha\n");
        assert_eq!(std::fs::read(workspace.join("sub/b.txt")).unwrap(), b"beta\n");
    }

    #[tokio::test]
    async fn cancel_during_script_still_runs_cleanup_and_reports_once() {
        let fx = fixture(
            FakeRunner::default()
                .with(BUILD, Behavior::SleepThenExit(Duration::from_secs(30), 0))
                .with(CLEANUP, Behavior::SleepThenExit(Duration::from_millis(100), 0)),
        );
        let mut phases = fx.job.subscribe_phase();

        let job = fx.job.clone();
        let handle = tokio::spawn(async move { job.run(CancellationToken::new()).await });

        phases
            .wait_for(|phase| *phase == JobPhase::RunningScript)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.job.cancel();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.script.outcome, ScriptOutcome::Cancelled);
        assert_eq!(
            report.script.output.as_ref().map(|o| o.stdout.as_str()),
            Some("build started\n")
        );
        assert_eq!(report.after_script.outcome, ScriptOutcome::Succeeded);
        assert!(!report.success);
        assert!(fx.runner.log().contains(&"finish cleanup".to_string()));
        assert!(!fx.runner.log().contains(&"finish build".to_string()));
        assert_eq!(fx.publisher.count(), 1);
    }

    #[tokio::test]
    async fn cancelling_the_run_context_only_affects_the_script() {
        let fx = fixture(
            FakeRunner::default()
                .with(BUILD, Behavior::SleepThenExit(Duration::from_secs(30), 0))
                .with(CLEANUP, Behavior::SleepThenExit(Duration::from_millis(100), 0)),
        );
        let ctx = CancellationToken::new();
        let mut phases = fx.job.subscribe_phase();

        let job = fx.job.clone();
        let run_ctx = ctx.clone();
        let handle = tokio::spawn(async move { job.run(run_ctx).await });

        phases
            .wait_for(|phase| *phase == JobPhase::RunningScript)
            .await
            .unwrap();
        ctx.cancel();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.script.outcome, ScriptOutcome::Cancelled);
        assert_eq!(report.after_script.outcome, ScriptOutcome::Succeeded);
        assert!(!fx.cleanup.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_works_before_run() {
        let fx = fixture(FakeRunner::default());
        fx.job.cancel();
        fx.job.cancel();
        assert!(fx.job.is_cancelled());

        let report = fx.job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.script.outcome, ScriptOutcome::Cancelled);
        assert_eq!(report.script.output, None);
        assert_eq!(report.after_script.outcome, ScriptOutcome::Succeeded);
        assert_eq!(fx.runner.log(), vec!["start cleanup", "finish cleanup"]);
        assert_eq!(fx.publisher.count(), 1);
    }

    #[tokio::test]
    async fn script_deadline_times_out_the_script_only() {
        let fx = fixture_with(
            api(),
            head(),
            FakeRunner::default().with(BUILD, Behavior::SleepThenExit(Duration::from_secs(30), 0)),
            RecordingPublisher::default(),
            |s| s.script_timeout = Duration::from_millis(50),
        );

        let report = fx.job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.script.outcome, ScriptOutcome::TimedOut);
        assert_eq!(report.script.outcome.code(), Some(ErrorCode::ScriptTimeout));
        assert_eq!(
            report.script.output,
            Some(ScriptOutput {
                exit_code: None,
                stdout: "build started\n".to_string(),
                stderr: String::new(),
            })
        );
        assert_eq!(report.after_script.outcome, ScriptOutcome::Succeeded);
        assert_eq!(fx.publisher.count(), 1);
    }

    #[tokio::test]
    async fn after_script_has_its_own_deadline() {
        let fx = fixture_with(
            api(),
            head(),
            FakeRunner::default()
                .with(CLEANUP, Behavior::SleepThenExit(Duration::from_secs(30), 0)),
            RecordingPublisher::default(),
            |s| s.after_script_timeout = Duration::from_millis(50),
        );

        let report = fx.job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.script.outcome, ScriptOutcome::Succeeded);
        assert_eq!(report.after_script.outcome, ScriptOutcome::TimedOut);
        // Cleanup does not decide the build result.
        assert!(report.success);
    }

    #[tokio::test]
    async fn hard_stop_cuts_the_after_script_short() {
        let fx = fixture(
            FakeRunner::default()
                .with(CLEANUP, Behavior::SleepThenExit(Duration::from_secs(30), 0)),
        );
        fx.cleanup.cancel();

        let report = fx.job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.script.outcome, ScriptOutcome::Succeeded);
        assert_eq!(report.after_script.outcome, ScriptOutcome::Cancelled);
        assert_eq!(fx.publisher.count(), 1);
    }

    #[tokio::test]
    async fn resource_failure_skips_script_but_cleans_up_and_reports() {
        let fx = fixture_with(
            api().with_failure("F2", MockFailure::Transport),
            head(),
            FakeRunner::default(),
            RecordingPublisher::default(),
            |_| {},
        );

        let report = fx.job.run(CancellationToken::new()).await.unwrap();
        let failure = report.resource_error.clone().unwrap();
        assert_eq!(failure.code, "PCI-E201");
        assert_eq!(report.script.outcome, ScriptOutcome::Skipped);
        assert_eq!(report.after_script.outcome, ScriptOutcome::Succeeded);
        assert!(!report.success);
        assert_eq!(fx.runner.log(), vec!["start cleanup", "finish cleanup"]);
        assert_eq!(fx.publisher.count(), 1);
        assert_eq!(report.summary(), "could not prepare workspace (PCI-E201)");
    }

    #[tokio::test]
    async fn missing_head_commit_is_a_resource_failure() {
        let fx = fixture_with(
            api(),
            None,
            FakeRunner::default(),
            RecordingPublisher::default(),
            |_| {},
        );

        let report = fx.job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.resource_error.unwrap().code, "PCI-E102");
        assert_eq!(report.script.outcome, ScriptOutcome::Skipped);
        // No workspace to clean up in.
        assert_eq!(report.after_script.outcome, ScriptOutcome::Skipped);
        assert!(fx.runner.log().is_empty());
        assert_eq!(fx.publisher.count(), 1);
    }

    #[tokio::test]
    async fn failing_script_is_a_job_result_not_an_error() {
        let fx = fixture(FakeRunner::default().with(BUILD, Behavior::Exit(2)));

        let report = fx.job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(
            report.script.outcome,
            ScriptOutcome::Failed { exit_code: Some(2) }
        );
        assert_eq!(
            report.script.output.as_ref().unwrap().stdout,
            "build output\n"
        );
        assert_eq!(report.summary(), "build failed (exit 2)");
        assert!(!fx.publisher.last().success);
    }

    #[tokio::test]
    async fn spawn_errors_are_reported() {
        let fx = fixture(FakeRunner::default().with(BUILD, Behavior::SpawnError));

        let report = fx.job.run(CancellationToken::new()).await.unwrap();
        assert!(matches!(report.script.outcome, ScriptOutcome::Error { .. }));
        assert_eq!(report.after_script.outcome, ScriptOutcome::Succeeded);
    }

    #[tokio::test]
    async fn empty_after_script_is_skipped() {
        let fx = fixture_with(
            api(),
            head(),
            FakeRunner::default(),
            RecordingPublisher::default(),
            |s| s.after_script = String::new(),
        );

        let report = fx.job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.after_script.outcome, ScriptOutcome::Skipped);
        assert_eq!(fx.runner.log(), vec!["start build", "finish build"]);
    }

    #[tokio::test]
    async fn publish_failure_does_not_fail_the_job() {
        let fx = fixture_with(
            api(),
            head(),
            FakeRunner::default(),
            RecordingPublisher::failing(),
            |_| {},
        );

        let report = fx.job.run(CancellationToken::new()).await.unwrap();
        assert!(report.success);
        assert_eq!(fx.publisher.count(), 1);
        assert_eq!(fx.job.phase(), JobPhase::Done);
    }

    #[tokio::test]
    async fn run_is_single_shot() {
        let fx = fixture(FakeRunner::default());
        fx.job.run(CancellationToken::new()).await.unwrap();

        let err = fx.job.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, JobError::AlreadyRun));
        assert_eq!(err.code(), ErrorCode::JobAlreadyRun);
        assert_eq!(fx.publisher.count(), 1);
    }

    #[tokio::test]
    async fn phase_events_are_broadcast() {
        let fx = fixture(FakeRunner::default());
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let job = PushJob::new(
            Client::new(Arc::new(api())),
            repo(head()),
            "refs/heads/main",
            settings(fx._base.path()),
            fx.runner.clone(),
            fx.publisher.clone(),
            CancellationToken::new(),
        )
        .with_events(bus);

        job.run(CancellationToken::new()).await.unwrap();

        let mut phases = Vec::new();
        while let Ok(line) = rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["event"], JOB_PHASE_CHANGED);
            phases.push(value["data"]["phase"].as_str().unwrap().to_string());
        }
        assert_eq!(
            phases,
            vec![
                "acquiring_resources",
                "running_script",
                "running_after_script",
                "reporting_results",
                "done"
            ]
        );
    }

    #[tokio::test]
    async fn shell_runner_sees_the_materialized_workspace() {
        pushci_common::testing::init_global_test_logging();
        let base = TempDir::new().unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let mut settings = settings(base.path());
        settings.script = "test \"$(cat sub/b.txt)\" = beta && echo \"$PUSHCI_COMMIT\"".to_string();
        settings.after_script = "touch cleaned".to_string();

        let job = PushJob::new(
            Client::new(Arc::new(api())),
            repo(head()),
            "refs/heads/main",
            settings,
            Arc::new(ShellRunner::new()),
            publisher.clone(),
            CancellationToken::new(),
        );

        let report = job.run(CancellationToken::new()).await.unwrap();
        assert!(report.success, "{report:?}");
        assert_eq!(report.script.output.unwrap().stdout, "c0ffee\n");
        assert!(report.workspace.unwrap().join("cleaned").exists());
        assert_eq!(job.ref_name(), "refs/heads/main");
    }

    fn shell_job(base: &Path, repo: Repository, tweak: impl FnOnce(&mut JobSettings)) -> PushJob {
        let mut settings = settings(base);
        tweak(&mut settings);
        PushJob::new(
            Client::new(Arc::new(api())),
            repo,
            "refs/heads/main",
            settings,
            Arc::new(ShellRunner::new()),
            Arc::new(RecordingPublisher::default()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn timed_out_build_keeps_its_output() {
        pushci_common::testing::init_global_test_logging();
        let base = TempDir::new().unwrap();
        let job = shell_job(base.path(), repo(head()), |s| {
            s.script = "echo compiling; sleep 5".to_string();
            s.script_timeout = Duration::from_millis(300);
            s.after_script = String::new();
        });

        let report = job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.script.outcome, ScriptOutcome::TimedOut);
        let output = report.script.output.expect("partial output");
        assert_eq!(output.stdout, "compiling\n");
        assert_eq!(output.exit_code, None);
    }

    #[tokio::test]
    async fn unsafe_names_never_leave_the_base_path() {
        let root = TempDir::new().unwrap();
        let base = root.path().join("base");
        let mut repo = repo(Some(Commit {
            id: ObjectId::new("../../escaped"),
            tree_id: ObjectId::new("R"),
            message: String::new(),
        }));
        repo.name = "..".to_string();
        let fx = fixture(FakeRunner::default());
        let job = PushJob::new(
            Client::new(Arc::new(api())),
            repo,
            "refs/heads/main",
            settings(&base),
            fx.runner.clone(),
            fx.publisher.clone(),
            CancellationToken::new(),
        );

        let err = job.commit_dir().unwrap_err();
        assert_eq!(err.code(), ErrorCode::EventUnsafeName);

        let report = job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.resource_error.unwrap().code, "PCI-E103");
        assert_eq!(report.workspace, None);
        assert_eq!(report.script.outcome, ScriptOutcome::Skipped);
        assert_eq!(report.after_script.outcome, ScriptOutcome::Skipped);
        assert!(fx.runner.log().is_empty());
        assert!(!root.path().join("escaped").exists());
        assert!(!base.exists());
    }

    #[tokio::test]
    async fn jobs_for_the_same_commit_get_separate_workspaces() {
        pushci_common::testing::init_global_test_logging();
        let base = TempDir::new().unwrap();
        let script = "test ! -e artifact && touch artifact && sleep 0.2";
        let first = shell_job(base.path(), repo(head()), |s| s.script = script.to_string());
        let second = shell_job(base.path(), repo(head()), |s| s.script = script.to_string());

        let (a, b) = tokio::join!(
            first.run(CancellationToken::new()),
            second.run(CancellationToken::new())
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.success, "{a:?}");
        assert!(b.success, "{b:?}");

        let (a_dir, b_dir) = (a.workspace.unwrap(), b.workspace.unwrap());
        assert_ne!(a_dir, b_dir);
        assert_eq!(a_dir.parent(), b_dir.parent());
        assert_eq!(std::fs::read(a_dir.join("a.txt")).unwrap(), b"alpha\n");
        assert_eq!(std::fs::read(b_dir.join("a.txt")).unwrap(), b"alpha\n");

        // A later run of the same commit starts from a clean checkout.
        let rerun = shell_job(base.path(), repo(head()), |s| s.script = script.to_string());
        let report = rerun.run(CancellationToken::new()).await.unwrap();
        assert!(report.success, "{report:?}");
    }
}
