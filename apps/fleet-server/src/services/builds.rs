use anyhow::Context;
use std::sync::Arc;

use crate::commands::{self, shell_quote, validate_docker_ref};
use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};
use crate::models::{BuildJob, BuildStatus, ImageRecord, ProjectVersion};
use crate::remote::{CommandOutput, RemoteExec, SshLogin};
use crate::services::credentials::CredentialResolver;
use crate::store::FleetStore;

const IMAGE_LIST_FORMAT: &str = "'{{.Tag}},{{.CreatedAt}}'";

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub struct BuildRequest {
    #[serde(alias = "repos_url")]
    pub repo_url: String,
    #[serde(alias = "branch_name")]
    pub branch: String,
    pub version: String,
    pub image_name: String,
}

impl BuildRequest {
    fn validate(&self) -> FleetResult<()> {
        if self.repo_url.trim().is_empty() {
            return Err(FleetError::validation("repo_url is required"));
        }
        if self.branch.trim().is_empty() {
            return Err(FleetError::validation("branch is required"));
        }
        validate_docker_ref("image_name", &self.image_name).map_err(FleetError::Validation)?;
        validate_docker_ref("version", &self.version).map_err(FleetError::Validation)?;
        Ok(())
    }
}

/// Flattens a command's output into one log, each line tagged with its stream.
pub(crate) fn tagged_log(output: &CommandOutput) -> Vec<String> {
    output
        .stdout
        .iter()
        .map(|line| format!("[stdout] {line}"))
        .chain(output.stderr.iter().map(|line| format!("[stderr] {line}")))
        .collect()
}

fn parse_images(lines: &[String]) -> Vec<ImageRecord> {
    lines
        .iter()
        .filter_map(|line| {
            let (tag, created_at) = line.split_once(',')?;
            Some(ImageRecord {
                tag: tag.trim().to_string(),
                created_at: created_at.trim().to_string(),
            })
        })
        .collect()
}

/// Runs image builds on the configured build host and keeps the version registry.
pub struct BuildRunner {
    config: FleetConfig,
    credentials: CredentialResolver,
    store: Arc<dyn FleetStore>,
    remote: Arc<dyn RemoteExec>,
}

impl BuildRunner {
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

    async fn build_host_login(&self) -> FleetResult<SshLogin> {
        let host = self
            .config
            .build_host
            .as_deref()
            .context("FLEET_BUILD_HOST is not configured")?;
        self.credentials.login_for_ip(host).await
    }

    /// Builds the image and returns the finished job. A build that writes to stderr is a
    /// `build_failure`, not an error.
    pub async fn run(&self, request: BuildRequest) -> FleetResult<BuildJob> {
        request.validate()?;
        let image_name = request.image_name.trim();
        let version = request.version.trim();
        let image_tag = format!("{image_name}:{version}");

        let login = self.build_host_login().await?;
        let command = commands::render(
            &self.config.commands.build,
            &[
                ("repo_url", request.repo_url.trim()),
                ("branch", request.branch.trim()),
                ("version", version),
                ("image_name", image_name),
                ("image_tag", image_tag.as_str()),
            ],
        )?;

        let id = self.store.create_build_job(image_name, version).await?;
        tracing::info!(job_id = id, image = %image_tag, build_host = %login.host, "build started");

        let (status, output_log) =
            match self.remote.exec(&login, &command, self.config.build_timeout).await {
                Ok(output) => {
                    let status = if output.succeeded() {
                        BuildStatus::BuildSuccess
                    } else {
                        BuildStatus::BuildFailure
                    };
                    (status, tagged_log(&output))
                }
                Err(err) => (BuildStatus::BuildFailure, vec![format!("[error] {err}")]),
            };

        if !self.store.finish_build_job(id, status, &output_log).await? {
            tracing::warn!(job_id = id, "build job was already finished");
        }
        if status == BuildStatus::BuildSuccess {
            self.store.record_project_version(image_name, version).await?;
        }
        tracing::info!(job_id = id, image = %image_tag, status = %status, "build finished");

        Ok(BuildJob {
            id,
            project_name: image_name.to_string(),
            version: version.to_string(),
            status,
            output_log,
        })
    }

    pub async fn versions(&self, project_name: &str) -> FleetResult<Vec<ProjectVersion>> {
        let name = project_name.trim();
        if name.is_empty() {
            return Err(FleetError::validation("project name is required"));
        }
        Ok(self.store.list_project_versions(name).await?)
    }

    /// Lists the images for `project_name` present on the build host.
    pub async fn images(&self, project_name: &str) -> FleetResult<Vec<ImageRecord>> {
        validate_docker_ref("project name", project_name).map_err(FleetError::Validation)?;
        let login = self.build_host_login().await?;
        let command = format!(
            "docker images --format {IMAGE_LIST_FORMAT} {}",
            shell_quote(project_name.trim())
        );
        let output = self
            .remote
            .exec(&login, &command, self.config.ssh_timeout)
            .await?;
        if !output.succeeded() {
            return Err(FleetError::CommandFailed(output.stderr));
        }
        Ok(parse_images(&output.stdout))
    }
}
