mod pool;
mod ssh;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use pool::SshExecutor;

#[derive(Clone)]
pub struct SshLogin {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SshLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshLogin")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Captured output of one remote command. An empty `stderr` is the success signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, utoipa::ToSchema)]
pub struct CommandOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.stderr.is_empty()
    }
}

/// Failure to run a command at all, as opposed to a command that ran and wrote to stderr.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("unable to reach {host}: {message}")]
    Unreachable { host: String, message: String },
    #[error("SSH authentication failed for {username}@{host}")]
    Auth { host: String, username: String },
    #[error("remote command timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("SSH session error: {0}")]
    Session(String),
    #[error("SSH worker pool unavailable: {0}")]
    Pool(String),
}

#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// How many times the command is run back to back.
    pub repeat: u32,
    pub interval: Duration,
    pub timeout: Duration,
}

pub type LineSink = Box<dyn FnMut(String) + Send>;

#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Runs `command` to completion and returns its ordered stdout/stderr lines.
    async fn exec(
        &self,
        login: &SshLogin,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError>;

    /// Runs `command` and hands every output line to `sink` as soon as it is read.
    async fn stream(
        &self,
        login: &SshLogin,
        command: &str,
        options: StreamOptions,
        sink: LineSink,
        cancel: CancellationToken,
    ) -> Result<(), RemoteError>;
}

/// Runs `run_once` `options.repeat` times (at least once), `options.interval` apart.
/// Stops early when `cancel` fires or a run reports that it was cut short by returning
/// `false`. Blocks the calling thread between runs.
pub(crate) fn repeat_runs<E>(
    options: &StreamOptions,
    cancel: &CancellationToken,
    mut run_once: impl FnMut() -> Result<bool, E>,
) -> Result<(), E> {
    for round in 0..options.repeat.max(1) {
        if cancel.is_cancelled() {
            return Ok(());
        }
        if round > 0 && wait_or_cancel(options.interval, cancel) {
            return Ok(());
        }
        if !run_once()? {
            return Ok(());
        }
    }
    Ok(())
}

/// Sleeps in short slices; returns `true` if cancelled meanwhile.
fn wait_or_cancel(interval: Duration, cancel: &CancellationToken) -> bool {
    const SLICE: Duration = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < interval {
        if cancel.is_cancelled() {
            return true;
        }
        let step = SLICE.min(interval - waited);
        std::thread::sleep(step);
        waited += step;
    }
    cancel.is_cancelled()
}

pub(crate) fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}
