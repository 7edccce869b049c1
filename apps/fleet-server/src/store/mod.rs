mod pg;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    AgentReport, BuildStatus, DeploymentJob, MetricKind, MetricPoint, NewServer, ProjectRecord,
    ProjectVersion, ServerAccount, ServerRecord,
};

pub use pg::PgStore;

/// System of record for servers, telemetry, builds and deployments.
#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn find_server(&self, id: i64) -> Result<Option<ServerRecord>>;
    async fn find_server_by_ip(&self, public_ip: &str) -> Result<Option<ServerRecord>>;

    /// Inserts the server and its account together. Returns `None` when a server with the
    /// same public IP already exists, in which case nothing is written.
    async fn register_server(&self, server: &NewServer) -> Result<Option<ServerRecord>>;

    /// Deletes the server and its account; returns the removed record.
    async fn remove_server(&self, id: i64) -> Result<Option<ServerRecord>>;

    async fn find_account(&self, public_ip: &str) -> Result<Option<ServerAccount>>;

    /// Appends one row per metric table and one per container, all stamped with the
    /// report's own timestamp.
    async fn append_report(&self, report: &AgentReport) -> Result<()>;

    /// Samples of one metric for `public_ip` with `start <= created_time <= end`, oldest
    /// first.
    async fn metric_series(
        &self,
        public_ip: &str,
        kind: MetricKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>>;

    /// Most recent sample of one metric taken at or before `at`.
    async fn latest_metric(
        &self,
        public_ip: &str,
        kind: MetricKind,
        at: DateTime<Utc>,
    ) -> Result<Option<MetricPoint>>;

    async fn container_series(
        &self,
        public_ip: &str,
        container_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>>;

    async fn create_build_job(&self, project_name: &str, version: &str) -> Result<i64>;

    /// Moves a `building` job to its terminal status and stores the log. Returns `false`
    /// when the job was already finished.
    async fn finish_build_job(
        &self,
        id: i64,
        status: BuildStatus,
        output_log: &[String],
    ) -> Result<bool>;

    async fn record_project_version(&self, name: &str, version: &str) -> Result<()>;
    async fn list_project_versions(&self, name: &str) -> Result<Vec<ProjectVersion>>;

    async fn find_project(&self, id: i64) -> Result<Option<ProjectRecord>>;

    /// Records the job as `deploying` and flags the project accordingly.
    async fn mark_deploying(&self, job: &DeploymentJob) -> Result<()>;

    /// Stores the per-host results and final status, and persists the resolved topology
    /// (target hosts, container name, status) onto the project.
    async fn finish_deployment(&self, job: &DeploymentJob) -> Result<()>;

    /// Flips every deployment left in `deploying` by a previous process to `deploy_failure`.
    async fn reconcile_stuck_deployments(&self) -> Result<u64>;
}
