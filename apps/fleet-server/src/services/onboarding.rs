//! Interactive host onboarding.
//!
//! A submission claims the host's IP in the key-value store, runs the agent install
//! command over SSH and then polls for the `deployed` marker that report ingestion sets
//! once the freshly installed agent calls back. The push channel only ever receives
//! short text frames: the failure text, or `success`.

use anyhow::Context;
use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::commands;
use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};
use crate::kv::KvStore;
use crate::models::{OnboardingPhase, PendingOnboarding};
use crate::remote::{RemoteExec, SshLogin};
use crate::store::FleetStore;
use crate::vault::CredentialVault;

/// Hash of public IP -> JSON `PendingOnboarding` for hosts being installed.
pub const DEPLOYING_KEY: &str = "fleet:onboarding:deploying";
/// Hash of public IP -> unix time for hosts whose agent has reported in.
pub const DEPLOYED_KEY: &str = "fleet:onboarding:deployed";
pub const SUCCESS_MESSAGE: &str = "success";

/// Install output lines matching these are noise from the installer, not failures.
const BENIGN_INSTALL_WARNINGS: [&str; 2] = ["symlink", "resolve host"];

/// Outbound half of the client connection watching an onboarding.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Returns `false` once the client is gone.
    async fn send(&self, message: String) -> bool;
}

#[derive(Clone, serde::Deserialize, utoipa::ToSchema)]
pub struct OnboardingRequest {
    pub cluster_id: i64,
    pub name: String,
    pub public_ip: String,
    pub username: String,
    #[serde(alias = "passwd")]
    pub password: String,
}

impl fmt::Debug for OnboardingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnboardingRequest")
            .field("cluster_id", &self.cluster_id)
            .field("name", &self.name)
            .field("public_ip", &self.public_ip)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl OnboardingRequest {
    fn normalized(&self) -> FleetResult<Self> {
        let name = required("name", &self.name)?;
        let public_ip = required("public_ip", &self.public_ip)?;
        let username = required("username", &self.username)?;
        let password = required("password", &self.password)?;
        let ip: IpAddr = public_ip
            .parse()
            .map_err(|_| FleetError::validation(format!("{public_ip} is not a valid IP address")))?;
        Ok(Self {
            cluster_id: self.cluster_id,
            name,
            public_ip: ip.to_string(),
            username,
            password,
        })
    }
}

fn required(field: &str, value: &str) -> FleetResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(FleetError::validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn is_benign_install_warning(line: &str) -> bool {
    let lowered = line.to_ascii_lowercase();
    BENIGN_INSTALL_WARNINGS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnboardingOutcome {
    Deployed,
    Failed(String),
    /// The client went away before the host reported in. The install itself keeps running.
    Cancelled,
}

/// Handle on one accepted onboarding. Dropping it does not stop the periodic check;
/// cancel the token passed to `submit` (or call `cancel`) for that.
pub struct OnboardingSession {
    public_ip: String,
    cancel: CancellationToken,
    watcher: JoinHandle<OnboardingOutcome>,
}

impl OnboardingSession {
    pub fn public_ip(&self) -> &str {
        &self.public_ip
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.watcher.is_finished()
    }

    pub async fn wait(self) -> OnboardingOutcome {
        match self.watcher.await {
            Ok(outcome) => outcome,
            Err(err) => OnboardingOutcome::Failed(format!("onboarding watcher aborted: {err}")),
        }
    }
}

pub struct OnboardingService {
    config: FleetConfig,
    kv: Arc<dyn KvStore>,
    store: Arc<dyn FleetStore>,
    remote: Arc<dyn RemoteExec>,
    vault: CredentialVault,
}

impl OnboardingService {
    pub fn new(
        config: FleetConfig,
        kv: Arc<dyn KvStore>,
        store: Arc<dyn FleetStore>,
        remote: Arc<dyn RemoteExec>,
        vault: CredentialVault,
    ) -> Self {
        Self {
            config,
            kv,
            store,
            remote,
            vault,
        }
    }

    /// Validates and claims the host, then starts the install and the periodic check.
    ///
    /// Validation and conflict errors are returned before anything is written.
    pub async fn submit(
        &self,
        request: OnboardingRequest,
        channel: Arc<dyn PushChannel>,
        cancel: CancellationToken,
    ) -> FleetResult<OnboardingSession> {
        let request = request.normalized()?;
        let public_ip = request.public_ip.clone();

        if self.kv.hget(DEPLOYED_KEY, &public_ip).await?.is_some()
            || self.store.find_server_by_ip(&public_ip).await?.is_some()
        {
            return Err(FleetError::conflict(format!("{public_ip} is already deployed")));
        }
        if self.kv.hget(DEPLOYING_KEY, &public_ip).await?.is_some() {
            return Err(FleetError::conflict(format!("{public_ip} is already deploying")));
        }

        let pending = PendingOnboarding {
            public_ip: public_ip.clone(),
            name: request.name.clone(),
            cluster_id: request.cluster_id,
            username: request.username.clone(),
            encrypted_password: self
                .vault
                .encrypt(&request.password)
                .context("failed to seal SSH password")?,
            phase: OnboardingPhase::Installing,
        };
        let encoded = serde_json::to_string(&pending).context("failed to encode pending onboarding")?;
        if !self.kv.hset_nx(DEPLOYING_KEY, &public_ip, &encoded).await? {
            return Err(FleetError::conflict(format!("{public_ip} is already deploying")));
        }

        let install_command = match commands::render(
            &self.config.commands.install,
            &[("public_ip", public_ip.as_str())],
        ) {
            Ok(command) => command,
            Err(err) => {
                self.release(&public_ip).await;
                return Err(err.into());
            }
        };
        tracing::info!(public_ip = %public_ip, cluster_id = request.cluster_id, "onboarding accepted");

        let cancel = cancel.child_token();
        let (failure_tx, failure_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_for_report(
            self.kv.clone(),
            public_ip.clone(),
            self.config.onboarding_poll_interval,
            channel.clone(),
            failure_rx,
            cancel.clone(),
        ));

        let login = SshLogin {
            host: public_ip.clone(),
            port: self.config.ssh_port,
            username: request.username,
            password: request.password,
        };
        tokio::spawn(run_install(
            self.remote.clone(),
            self.kv.clone(),
            login,
            install_command,
            self.config.ssh_timeout,
            channel,
            failure_tx,
        ));

        Ok(OnboardingSession {
            public_ip,
            cancel,
            watcher,
        })
    }

    async fn release(&self, public_ip: &str) {
        if let Err(err) = self.kv.hdel(DEPLOYING_KEY, public_ip).await {
            tracing::error!(public_ip = %public_ip, "failed to release onboarding claim: {err:#}");
        }
    }
}

async fn run_install(
    remote: Arc<dyn RemoteExec>,
    kv: Arc<dyn KvStore>,
    login: SshLogin,
    command: String,
    timeout: std::time::Duration,
    channel: Arc<dyn PushChannel>,
    failure_tx: oneshot::Sender<String>,
) {
    let public_ip = login.host.clone();
    let errors = match remote.exec(&login, &command, timeout).await {
        Ok(output) => output
            .stderr
            .into_iter()
            .filter(|line| {
                let benign = is_benign_install_warning(line);
                if benign {
                    tracing::debug!(public_ip = %public_ip, line = %line, "ignoring install warning");
                }
                !benign
            })
            .collect::<Vec<_>>(),
        Err(err) => vec![err.to_string()],
    };
    drop(login);

    if errors.is_empty() {
        tracing::info!(public_ip = %public_ip, "agent install finished; waiting for first report");
        return;
    }

    let message = errors.join("\n");
    tracing::warn!(public_ip = %public_ip, error = %message, "agent install failed");
    channel.send(message.clone()).await;
    if let Err(err) = kv.hdel(DEPLOYING_KEY, &public_ip).await {
        tracing::error!(public_ip = %public_ip, "failed to discard pending onboarding: {err:#}");
    }
    // The watcher may already be gone if the client disconnected.
    let _ = failure_tx.send(message);
}

async fn watch_for_report(
    kv: Arc<dyn KvStore>,
    public_ip: String,
    interval: std::time::Duration,
    channel: Arc<dyn PushChannel>,
    mut failure_rx: oneshot::Receiver<String>,
    cancel: CancellationToken,
) -> OnboardingOutcome {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut installer_running = true;
    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break OnboardingOutcome::Cancelled,
            failure = &mut failure_rx, if installer_running => match failure {
                Ok(message) => break OnboardingOutcome::Failed(message),
                // Installer finished cleanly; keep polling.
                Err(_) => installer_running = false,
            },
            _ = ticker.tick() => match kv.hget(DEPLOYED_KEY, &public_ip).await {
                Ok(Some(_)) => {
                    channel.send(SUCCESS_MESSAGE.to_string()).await;
                    break OnboardingOutcome::Deployed;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(public_ip = %public_ip, "onboarding check failed: {err:#}");
                }
            },
        }
    };
    cancel.cancel();
    tracing::info!(public_ip = %public_ip, outcome = ?outcome, "onboarding check stopped");
    outcome
}
