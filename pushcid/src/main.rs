//! pushci runner
//!
//! Runs one CI job for a push event: fetches the pushed tree into a
//! workspace, runs the build and cleanup scripts, and publishes the result.

#![forbid(unsafe_code)]

mod events;
mod executor;
mod job;
mod reporter;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use events::EventBus;
use executor::ShellRunner;
use job::{Job, JobSettings, PushJob};
use pushci_common::{
    CiConfig, Client, GithubApi, LogConfig, LogFormat, ObjectId, Owner, Push, Repository,
    init_logging,
};
use reporter::{EventBusPublisher, FanoutPublisher, GithubStatusPublisher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "pushcid")]
#[command(author, version, about = "pushci runner - build a pushed commit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config.toml (defaults to the user config directory)
    #[arg(short, long, global = true, env = "PUSHCI_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one job for a push event payload and print its report as JSON
    Run {
        /// Payload file, or "-" for stdin
        #[arg(short, long)]
        payload: PathBuf,
    },

    /// Fetch a tree and write it to a directory
    Tree {
        #[arg(long)]
        owner: String,

        #[arg(long)]
        repo: String,

        /// Tree hash
        #[arg(long)]
        sha: String,

        /// Destination directory
        #[arg(long)]
        dest: PathBuf,
    },

    /// Validate configuration and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = CiConfig::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("[{}] {e}", e.code().code_string()))?;

    let mut log_config = LogConfig::from_env(&config.general.log_level).with_stderr();
    if let Some(format) = LogFormat::parse(&config.general.log_format) {
        log_config = log_config.with_format(format);
    }
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    match cli.command {
        Commands::Run { payload } => run_job(&config, &payload).await,
        Commands::Tree {
            owner,
            repo,
            sha,
            dest,
        } => fetch_tree(&config, owner, repo, &sha, &dest).await,
        Commands::CheckConfig => check_config(&config),
    }
}

async fn read_payload(path: &Path) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut buf)
            .await
            .context("failed to read payload from stdin")?;
        return Ok(buf);
    }
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read payload {}", path.display()))
}

fn github_api(config: &CiConfig) -> Result<Arc<GithubApi>> {
    let api = GithubApi::from_config(&config.github).context("failed to build API client")?;
    Ok(Arc::new(api))
}

async fn run_job(config: &CiConfig, payload_path: &Path) -> Result<ExitCode> {
    let payload = read_payload(payload_path).await?;
    let push = Push::from_payload(&payload)
        .map_err(|e| anyhow::anyhow!("[{}] {e}", e.code().code_string()))?;
    info!(repo = %push.repo.full_name(), ref_name = %push.ref_name, "push received");

    let api = github_api(config)?;
    let client = Client::new(api.clone());
    let events = EventBus::default();
    let mut publisher = FanoutPublisher::new().with(Arc::new(EventBusPublisher::new(events.clone())));
    if config.github.publish_status {
        let mut status = GithubStatusPublisher::new(api, config.github.status_context.clone());
        if let Some(url) = &config.github.status_target_url {
            status = status.with_target_url(url.clone());
        }
        publisher = publisher.with(Arc::new(status));
    }

    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(line) = rx.recv().await {
            debug!(target: "pushcid::events", "{line}");
        }
    });

    let hard_stop = CancellationToken::new();
    let job = Arc::new(
        PushJob::new(
            client,
            push.repo,
            push.ref_name,
            JobSettings::from_config(config),
            Arc::new(ShellRunner::new()),
            Arc::new(publisher),
            hard_stop.clone(),
        )
        .with_events(events),
    );

    let signal_job = job.clone();
    let signals = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!(
            ref_name = signal_job.ref_name(),
            phase = %signal_job.phase(),
            "interrupt received, cancelling build (press Ctrl-C again to stop cleanup)"
        );
        signal_job.cancel();
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("second interrupt received, stopping");
        hard_stop.cancel();
    });

    let report = job
        .run(CancellationToken::new())
        .await
        .map_err(|e| anyhow::anyhow!("[{}] {e}", e.code().code_string()))?;
    signals.abort();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn fetch_tree(
    config: &CiConfig,
    owner: String,
    repo: String,
    sha: &str,
    dest: &Path,
) -> Result<ExitCode> {
    let client = Client::new(github_api(config)?);
    let repository = Repository {
        name: repo,
        fork: false,
        owner: Owner { login: owner },
        refs: HashMap::new(),
    };

    let tree = client
        .get_tree(&ObjectId::new(sha), &repository)
        .await
        .map_err(|e| anyhow::anyhow!("[{}] {e}", e.code().code_string()))?;

    let target = dest.to_path_buf();
    let written = tree.clone();
    tokio::task::spawn_blocking(move || written.materialize(&target))
        .await?
        .map_err(|e| anyhow::anyhow!("[{}] {e}", e.code().code_string()))?;

    let stats = client.cache().stats();
    info!(
        tree = %tree.id(),
        trees = stats.trees,
        blobs = stats.blobs,
        dest = %dest.display(),
        "tree written"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(ExitCode::SUCCESS)
}

fn check_config(config: &CiConfig) -> Result<ExitCode> {
    let mut shown = config.clone();
    if shown.github.token.is_some() {
        shown.github.token = Some("<redacted>".to_string());
    }
    let rendered = toml::to_string_pretty(&shown).context("failed to render configuration")?;
    println!("{rendered}");
    Ok(ExitCode::SUCCESS)
}
