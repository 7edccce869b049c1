use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::commands::{self, validate_docker_ref};
use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};
use crate::models::{DeploymentJob, DeploymentStatus, HostResult, TopologyDiff};
use crate::remote::RemoteExec;
use crate::services::credentials::CredentialResolver;
use crate::store::FleetStore;

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub struct DeployTarget {
    pub public_ip: String,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub struct DeploymentRequest {
    pub project_id: i64,
    pub image_name: String,
    pub container_name: String,
    #[serde(alias = "ips")]
    pub target_hosts: Vec<DeployTarget>,
}

impl DeploymentRequest {
    /// Validated, de-duplicated target hosts in request order.
    fn resolved_hosts(&self) -> FleetResult<Vec<String>> {
        validate_docker_ref("image_name", &self.image_name).map_err(FleetError::Validation)?;
        validate_docker_ref("container_name", &self.container_name)
            .map_err(FleetError::Validation)?;

        let mut seen = HashSet::new();
        let mut hosts = Vec::with_capacity(self.target_hosts.len());
        for target in &self.target_hosts {
            let raw = target.public_ip.trim();
            let ip: IpAddr = raw
                .parse()
                .map_err(|_| FleetError::validation(format!("{raw} is not a valid IP address")))?;
            let ip = ip.to_string();
            if seen.insert(ip.clone()) {
                hosts.push(ip);
            }
        }
        if hosts.is_empty() {
            return Err(FleetError::validation("at least one target host is required"));
        }
        Ok(hosts)
    }
}

/// Runs one image across a set of hosts at once and folds the per-host results into a
/// single job status.
pub struct DeploymentExecutor {
    config: FleetConfig,
    credentials: CredentialResolver,
    store: Arc<dyn FleetStore>,
    remote: Arc<dyn RemoteExec>,
}

impl DeploymentExecutor {
    pub fn new(
        config: FleetConfig,
        credentials: CredentialResolver,
        store: Arc<dyn FleetStore>,
        remote: Arc<dyn RemoteExec>,
    ) -> Self {
        Self {
            config,
            credentials,
            store,
            remote,
        }
    }

    pub async fn deploy(&self, request: DeploymentRequest) -> FleetResult<DeploymentJob> {
        let hosts = request.resolved_hosts()?;
        let project = self
            .store
            .find_project(request.project_id)
            .await?
            .ok_or_else(|| FleetError::not_found(format!("project {} not found", request.project_id)))?;

        let mut job = DeploymentJob {
            id: Uuid::new_v4(),
            project_id: project.id,
            image_name: request.image_name.trim().to_string(),
            container_name: request.container_name.trim().to_string(),
            diff: TopologyDiff::between(&project.target_hosts, &hosts),
            target_hosts: hosts,
            results: BTreeMap::new(),
            status: DeploymentStatus::Deploying,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.store.mark_deploying(&job).await?;
        tracing::info!(
            job_id = %job.id,
            project_id = job.project_id,
            image = %job.image_name,
            hosts = job.target_hosts.len(),
            "deployment started"
        );

        let deadline = self.config.deploy_job_timeout;
        let runs = job.target_hosts.iter().map(|host| {
            let job = &job;
            async move {
                let result = match tokio::time::timeout(deadline, self.deploy_host(job, host)).await {
                    Ok(result) => result,
                    Err(_) => {
                        HostResult::failed(format!("deployment timed out after {deadline:?}"))
                    }
                };
                (host.clone(), result)
            }
        });
        let results: BTreeMap<String, HostResult> = join_all(runs).await.into_iter().collect();

        job.results = results;
        job.status = job.aggregate_status();
        job.finished_at = Some(Utc::now());
        for (host, result) in &job.results {
            if !result.error.is_empty() {
                tracing::warn!(job_id = %job.id, host = %host, error = %result.error.join("; "), "host deployment failed");
            }
        }
        self.store.finish_deployment(&job).await?;
        tracing::info!(job_id = %job.id, status = %job.status, "deployment finished");
        Ok(job)
    }

    /// Never fails: anything that goes wrong on one host lands in that host's error list.
    async fn deploy_host(&self, job: &DeploymentJob, host: &str) -> HostResult {
        let login = match self.credentials.login_for_ip(host).await {
            Ok(login) => login,
            Err(err) => {
                if matches!(err, FleetError::Internal(_)) {
                    tracing::error!(host = %host, "failed to resolve SSH login: {err}");
                }
                return HostResult::failed(err.to_string());
            }
        };
        let command = match commands::render(
            &self.config.commands.deploy,
            &[
                ("image_name", job.image_name.as_str()),
                ("container_name", job.container_name.as_str()),
                ("public_ip", host),
            ],
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

    /// Flips deployments a previous process left in `deploying` to `deploy_failure`.
    pub async fn reconcile(&self) -> anyhow::Result<u64> {
        let flipped = self.store.reconcile_stuck_deployments().await?;
        if flipped > 0 {
            tracing::warn!(projects = flipped, "marked interrupted deployments as failed");
        }
        Ok(flipped)
    }
}
