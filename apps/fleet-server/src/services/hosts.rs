use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::commands;
use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};
use crate::kv::KvStore;
use crate::models::{HostResult, ServerRecord};
use crate::remote::{RemoteExec, StreamOptions};
use crate::services::credentials::CredentialResolver;
use crate::services::onboarding::{DEPLOYED_KEY, DEPLOYING_KEY};
use crate::store::FleetStore;

/// Read-only commands a console session may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Top,
    Uptime,
    DiskUsage,
    DockerStats,
}

impl ConsoleCommand {
    pub fn shell(self) -> &'static str {
        match self {
            Self::Top => "top -b -n 1",
            Self::Uptime => "uptime",
            Self::DiskUsage => "df -h",
            Self::DockerStats => "docker stats --no-stream",
        }
    }
}

impl FromStr for ConsoleCommand {
    type Err = FleetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "top" => Ok(Self::Top),
            "uptime" => Ok(Self::Uptime),
            "df" => Ok(Self::DiskUsage),
            "docker-stats" => Ok(Self::DockerStats),
            other => Err(FleetError::validation(format!(
                "console command {other:?} is not allowed (allowed: top, uptime, df, docker-stats)"
            ))),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct HostRemoval {
    pub server: ServerRecord,
    pub uninstall: HostResult,
}

/// Host-level operations on servers that are already onboarded.
pub struct HostManager {
    config: FleetConfig,
    credentials: CredentialResolver,
    kv: Arc<dyn KvStore>,
    store: Arc<dyn FleetStore>,
    remote: Arc<dyn RemoteExec>,
}

impl HostManager {
    pub fn new(
        config: FleetConfig,
        credentials: CredentialResolver,
        kv: Arc<dyn KvStore>,
        store: Arc<dyn FleetStore>,
        remote: Arc<dyn RemoteExec>,
    ) -> Self {
        Self {
            config,
            credentials,
            kv,
            store,
            remote,
        }
    }

    /// Uninstalls the agent (best effort), then forgets the server and its markers so the
    /// IP can be onboarded again.
    pub async fn remove(&self, server_id: i64) -> FleetResult<HostRemoval> {
        let server = self
            .store
            .find_server(server_id)
            .await?
            .ok_or_else(|| FleetError::not_found(format!("server {server_id} not found")))?;
        let uninstall = self.uninstall(&server).await;
        if !uninstall.error.is_empty() {
            tracing::warn!(
                public_ip = %server.public_ip,
                error = %uninstall.error.join("; "),
                "agent uninstall reported errors; removing server anyway"
            );
        }

        let removed = self
            .store
            .remove_server(server.id)
            .await?
            .ok_or_else(|| FleetError::not_found(format!("server {server_id} not found")))?;
        self.kv.hdel(DEPLOYED_KEY, &removed.public_ip).await?;
        self.kv.hdel(DEPLOYING_KEY, &removed.public_ip).await?;
        tracing::info!(server_id, public_ip = %removed.public_ip, "server removed");
        Ok(HostRemoval {
            server: removed,
            uninstall,
        })
    }

    async fn uninstall(&self, server: &ServerRecord) -> HostResult {
        let login = match self.credentials.login_for_ip(&server.public_ip).await {
            Ok(login) => login,
            Err(err) => return HostResult::failed(err.to_string()),
        };
        let command = match commands::render(
            &self.config.commands.uninstall,
            &[("public_ip", server.public_ip.as_str())],
        ) {
            Ok(command) => command,
            Err(err) => return HostResult::failed(err.to_string()),
        };
        match self
            .remote
            .exec(&login, &command, self.config.ssh_timeout)
            .await
        {
            Ok(output) => HostResult {
                output: output.stdout,
                error: output.stderr,
            },
            Err(err) => HostResult::failed(err.to_string()),
        }
    }

    /// Streams `command` on the server into `lines` until it has run `console_repeat`
    /// times or `cancel` fires. Lookup failures are returned before anything is sent.
    pub async fn console(
        &self,
        server_id: i64,
        command: ConsoleCommand,
        lines: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> FleetResult<()> {
        let (server, login) = self.credentials.login_for_server(server_id).await?;
        let options = StreamOptions {
            repeat: self.config.console_repeat,
            interval: self.config.console_interval,
            timeout: self.config.ssh_timeout,
        };
        tracing::debug!(public_ip = %server.public_ip, command = command.shell(), "console started");
        let sink = Box::new(move |line: String| {
            // The receiver is gone once the socket closed; cancellation follows.
            let _ = lines.send(line);
        });
        self.remote
            .stream(&login, command.shell(), options, sink, cancel)
            .await?;
        Ok(())
    }
}
