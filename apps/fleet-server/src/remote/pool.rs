use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::ssh::{connect, run_command, stream_command};
use super::{CommandOutput, LineSink, RemoteError, RemoteExec, SshLogin, StreamOptions};

/// Extra time granted to the worker beyond the SSH-level timeout before the caller gives up.
const DEFAULT_WORKER_GRACE: Duration = Duration::from_secs(5);

/// Runs SSH sessions on the blocking thread pool, at most `workers` at a time, so a
/// hung host can never stall the runtime threads that drive orchestration and timers.
#[derive(Clone)]
pub struct SshExecutor {
    permits: Arc<Semaphore>,
    grace: Duration,
}

impl SshExecutor {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            grace: DEFAULT_WORKER_GRACE,
        }
    }

    /// Runs `job` on the blocking pool. The job receives a child of `cancel` that is also
    /// cancelled once the caller stops waiting, whether through the deadline or by being
    /// dropped, so the worker lets go of its permit and session promptly.
    async fn run_blocking<T, F>(
        &self,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
        job: F,
    ) -> Result<T, RemoteError>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T, RemoteError> + Send + 'static,
    {
        let job_cancel = cancel.child_token();
        let _cancel_on_exit = job_cancel.clone().drop_guard();
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|err| RemoteError::Pool(err.to_string()))?
            }
            _ = sleep_or_forever(deadline) => {
                return Err(RemoteError::Timeout(deadline.unwrap_or_default()));
            }
        };
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job(job_cancel)
        });
        let joined = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline + self.grace, handle).await {
                Ok(joined) => joined,
                Err(_) => return Err(RemoteError::Timeout(deadline)),
            },
            None => handle.await,
        };
        joined.map_err(|err| RemoteError::Pool(err.to_string()))?
    }
}

async fn sleep_or_forever(deadline: Option<Duration>) {
    match deadline {
        Some(deadline) => tokio::time::sleep(deadline).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl RemoteExec for SshExecutor {
    async fn exec(
        &self,
        login: &SshLogin,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        let login = login.clone();
        let command = command.to_string();
        let host = login.host.clone();
        let started = std::time::Instant::now();
        let result = self
            .run_blocking(Some(timeout), &CancellationToken::new(), move |cancel| {
                let deadline = std::time::Instant::now() + timeout;
                let guard = connect(&login, timeout)?;
                run_command(&guard, &command, deadline, timeout, &cancel)
            })
            .await;
        match &result {
            Ok(output) => tracing::debug!(
                host = %host,
                elapsed_ms = started.elapsed().as_millis() as u64,
                stdout_lines = output.stdout.len(),
                stderr_lines = output.stderr.len(),
                "remote command finished"
            ),
            Err(err) => tracing::warn!(host = %host, error = %err, "remote command failed"),
        }
        result
    }

    async fn stream(
        &self,
        login: &SshLogin,
        command: &str,
        options: StreamOptions,
        sink: LineSink,
        cancel: CancellationToken,
    ) -> Result<(), RemoteError> {
        let login = login.clone();
        let command = command.to_string();
        self.run_blocking(None, &cancel, move |cancel| {
            let guard = connect(&login, options.timeout)?;
            stream_command(&guard, &command, options, sink, &cancel)
        })
        .await
    }
}
