//! Script execution.
//!
//! Runners only spawn and collect. Deadlines and cancellation belong to the
//! caller: dropping the future returned by [`ScriptRunner::run`] kills the
//! script's whole process group, and whatever it printed so far stays in the
//! caller's [`OutputCapture`].

use async_trait::async_trait;
use pushci_common::ErrorCode;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured output is truncated to this many bytes per stream.
const MAX_CAPTURED_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to run {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ScriptSpawnFailed
    }
}

/// A command to run inside a workspace.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub command: String,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl ScriptRequest {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Captured result of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScriptOutput {
    /// `None` when the process was ended by a signal or never finished.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Keeps the last [`MAX_CAPTURED_BYTES`] of a stream.
#[derive(Debug, Default)]
struct TailBuffer {
    bytes: Vec<u8>,
    dropped: usize,
}

impl TailBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > 2 * MAX_CAPTURED_BYTES {
            let excess = self.bytes.len() - MAX_CAPTURED_BYTES;
            self.bytes.drain(..excess);
            self.dropped += excess;
        }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.dropped == 0
    }

    /// Lossy UTF-8, keeping the tail when the stream was too long.
    fn render(&self) -> String {
        let total = self.dropped + self.bytes.len();
        if total <= MAX_CAPTURED_BYTES {
            return String::from_utf8_lossy(&self.bytes).into_owned();
        }
        let tail = &self.bytes[self.bytes.len() - MAX_CAPTURED_BYTES..];
        format!(
            "[... {} bytes truncated ...]\n{}",
            total - MAX_CAPTURED_BYTES,
            String::from_utf8_lossy(tail)
        )
    }
}

#[derive(Debug, Default)]
struct Captured {
    stdout: TailBuffer,
    stderr: TailBuffer,
}

/// Output buffers owned by the caller and filled while a script runs.
#[derive(Debug, Clone, Default)]
pub struct OutputCapture {
    inner: Arc<Mutex<Captured>>,
}

impl OutputCapture {
    fn lock(&self) -> MutexGuard<'_, Captured> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append_stdout(&self, chunk: &[u8]) {
        self.lock().stdout.push(chunk);
    }

    pub fn append_stderr(&self, chunk: &[u8]) {
        self.lock().stderr.push(chunk);
    }

    /// Everything captured so far, with the given exit status.
    pub fn finish(&self, exit_code: Option<i32>) -> ScriptOutput {
        let captured = self.lock();
        ScriptOutput {
            exit_code,
            stdout: captured.stdout.render(),
            stderr: captured.stderr.render(),
        }
    }

    /// Output of a script that never finished, if it printed anything.
    pub fn partial(&self) -> Option<ScriptOutput> {
        {
            let captured = self.lock();
            if captured.stdout.is_empty() && captured.stderr.is_empty() {
                return None;
            }
        }
        Some(self.finish(None))
    }
}

#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run `request`, appending its output to `output` as it arrives.
    async fn run(
        &self,
        request: &ScriptRequest,
        output: &OutputCapture,
    ) -> Result<ScriptOutput, ExecError>;
}

/// Runs commands through `sh -c`, each in its own process group.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ScriptRunner for ShellRunner {
    async fn run(
        &self,
        request: &ScriptRequest,
        output: &OutputCapture,
    ) -> Result<ScriptOutput, ExecError> {
        if request.command.trim().is_empty() {
            return Err(ExecError::EmptyCommand);
        }

        let mut std_cmd = std::process::Command::new("sh");
        std_cmd
            .arg("-c")
            .arg(&request.command)
            .current_dir(&request.workdir)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        debug!(command = %request.command, workdir = %request.workdir.display(), "spawning script");
        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            command: request.command.clone(),
            source,
        })?;
        let mut group = ProcessGroup::new(child.id());
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let wait = async {
            let status = child.wait().await;
            // Background jobs the script left behind would hold the pipes open.
            group.kill();
            status
        };
        let (status, (), ()) = tokio::join!(
            wait,
            pump(stdout, |chunk| output.append_stdout(chunk)),
            pump(stderr, |chunk| output.append_stderr(chunk)),
        );
        let status = status.map_err(|source| ExecError::Spawn {
            command: request.command.clone(),
            source,
        })?;

        Ok(output.finish(status.code()))
    }
}

async fn pump<R, F>(reader: Option<R>, mut sink: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink(&buf[..n]),
            Err(e) => {
                debug!(error = %e, "script output stream closed");
                break;
            }
        }
    }
}

/// Kills a script's process group when the phase ends, however it ends.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    #[cfg(unix)]
    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        let result = std::process::Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{pgid}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(status) if status.success() => debug!(pgid, "killed script process group"),
            // Exits non-zero when the group is already gone.
            Ok(_) => {}
            Err(e) => warn!(pgid, error = %e, "failed to run kill for script process group"),
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}
