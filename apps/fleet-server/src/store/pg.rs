use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;

use super::FleetStore;
use crate::models::{
    AgentReport, BuildStatus, DeploymentJob, DeploymentStatus, MetricKind, MetricPoint,
    NewServer, ProjectRecord, ProjectVersion, ServerAccount, ServerRecord,
};

#[derive(sqlx::FromRow)]
struct MetricRow {
    created_time: DateTime<Utc>,
    content: SqlJson<serde_json::Value>,
}

impl From<MetricRow> for MetricPoint {
    fn from(row: MetricRow) -> Self {
        Self {
            created_time: row.created_time,
            content: row.content.0.into(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: i64,
    name: String,
    image_name: String,
    status: Option<String>,
    target_hosts: SqlJson<Vec<String>>,
    container_name: Option<String>,
}

impl TryFrom<ProjectRow> for ProjectRecord {
    type Error = anyhow::Error;

    fn try_from(row: ProjectRow) -> Result<Self> {
        let status = row
            .status
            .as_deref()
            .map(str::parse::<DeploymentStatus>)
            .transpose()?;
        Ok(Self {
            id: row.id,
            name: row.name,
            image_name: row.image_name,
            status,
            target_hosts: row.target_hosts.0,
            container_name: row.container_name,
        })
    }
}

/// `FleetStore` backed by Postgres. One parameterized statement per operation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FleetStore for PgStore {
    async fn find_server(&self, id: i64) -> Result<Option<ServerRecord>> {
        let server = sqlx::query_as::<_, ServerRecord>(
            "SELECT id, name, public_ip, cluster_id, created_time FROM servers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load server")?;
        Ok(server)
    }

    async fn find_server_by_ip(&self, public_ip: &str) -> Result<Option<ServerRecord>> {
        let server = sqlx::query_as::<_, ServerRecord>(
            "SELECT id, name, public_ip, cluster_id, created_time FROM servers WHERE public_ip = $1",
        )
        .bind(public_ip)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load server by public ip")?;
        Ok(server)
    }

    async fn register_server(&self, server: &NewServer) -> Result<Option<ServerRecord>> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query_as::<_, ServerRecord>(
            r#"
            INSERT INTO servers (name, public_ip, cluster_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (public_ip) DO NOTHING
            RETURNING id, name, public_ip, cluster_id, created_time
            "#,
        )
        .bind(&server.name)
        .bind(&server.public_ip)
        .bind(server.cluster_id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to insert server")?;

        let Some(record) = inserted else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            INSERT INTO server_accounts (public_ip, username, encrypted_password)
            VALUES ($1, $2, $3)
            ON CONFLICT (public_ip) DO UPDATE
            SET username = EXCLUDED.username, encrypted_password = EXCLUDED.encrypted_password
            "#,
        )
        .bind(&server.public_ip)
        .bind(&server.username)
        .bind(&server.encrypted_password)
        .execute(&mut *tx)
        .await
        .context("failed to insert server account")?;

        tx.commit().await?;
        Ok(Some(record))
    }

    async fn remove_server(&self, id: i64) -> Result<Option<ServerRecord>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM server_accounts WHERE public_ip = (SELECT public_ip FROM servers WHERE id = $1)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed to delete server account")?;
        let removed = sqlx::query_as::<_, ServerRecord>(
            "DELETE FROM servers WHERE id = $1 RETURNING id, name, public_ip, cluster_id, created_time",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to delete server")?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn find_account(&self, public_ip: &str) -> Result<Option<ServerAccount>> {
        let account = sqlx::query_as::<_, ServerAccount>(
            "SELECT public_ip, username, encrypted_password FROM server_accounts WHERE public_ip = $1",
        )
        .bind(public_ip)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load server account")?;
        Ok(account)
    }

    async fn append_report(&self, report: &AgentReport) -> Result<()> {
        let created_time = report.timestamp()?;

        let mut tx = self.pool.begin().await?;
        for kind in MetricKind::ALL {
            // Table names come from a closed enum, never from input.
            let sql = format!(
                "INSERT INTO {} (public_ip, created_time, content) VALUES ($1, $2, $3)",
                kind.table()
            );
            sqlx::query(&sql)
                .bind(&report.public_ip)
                .bind(created_time)
                .bind(SqlJson(&kind.section(report).0))
                .execute(&mut *tx)
                .await
                .context("failed to append metric row")?;
        }
        for (container_name, stats) in &report.docker {
            sqlx::query(
                r#"
                INSERT INTO container_metrics (public_ip, container_name, created_time, content)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&report.public_ip)
            .bind(container_name)
            .bind(created_time)
            .bind(SqlJson(&stats.0))
            .execute(&mut *tx)
            .await
            .context("failed to append container metric row")?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn metric_series(
        &self,
        public_ip: &str,
        kind: MetricKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>> {
        let sql = format!(
            r#"
            SELECT created_time, content FROM {}
            WHERE public_ip = $1 AND created_time >= $2 AND created_time <= $3
            ORDER BY created_time, id
            "#,
            kind.table()
        );
        let rows: Vec<MetricRow> = sqlx::query_as(&sql)
            .bind(public_ip)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to load {}", kind.table()))?;
        Ok(rows.into_iter().map(MetricPoint::from).collect())
    }

    async fn latest_metric(
        &self,
        public_ip: &str,
        kind: MetricKind,
        at: DateTime<Utc>,
    ) -> Result<Option<MetricPoint>> {
        let sql = format!(
            r#"
            SELECT created_time, content FROM {}
            WHERE public_ip = $1 AND created_time <= $2
            ORDER BY created_time DESC, id DESC
            LIMIT 1
            "#,
            kind.table()
        );
        let row: Option<MetricRow> = sqlx::query_as(&sql)
            .bind(public_ip)
            .bind(at)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load latest {}", kind.table()))?;
        Ok(row.map(MetricPoint::from))
    }

    async fn container_series(
        &self,
        public_ip: &str,
        container_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>> {
        let rows: Vec<MetricRow> = sqlx::query_as(
            r#"
            SELECT created_time, content FROM container_metrics
            WHERE public_ip = $1 AND container_name = $2
              AND created_time >= $3 AND created_time <= $4
            ORDER BY created_time, id
            "#,
        )
        .bind(public_ip)
        .bind(container_name)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("failed to load container metrics")?;
        Ok(rows.into_iter().map(MetricPoint::from).collect())
    }

    async fn create_build_job(&self, project_name: &str, version: &str) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO build_jobs (project_name, version, status) VALUES ($1, $2, 'building') RETURNING id",
        )
        .bind(project_name)
        .bind(version)
        .fetch_one(&self.pool)
        .await
        .context("failed to create build job")?;
        Ok(id)
    }

    async fn finish_build_job(
        &self,
        id: i64,
        status: BuildStatus,
        output_log: &[String],
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE build_jobs
            SET status = $2, output_log = $3, finished_at = now()
            WHERE id = $1 AND status = 'building'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(SqlJson(output_log))
        .execute(&self.pool)
        .await
        .context("failed to finish build job")?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_project_version(&self, name: &str, version: &str) -> Result<()> {
        sqlx::query("INSERT INTO project_versions (name, version) VALUES ($1, $2)")
            .bind(name)
            .bind(version)
            .execute(&self.pool)
            .await
            .context("failed to record project version")?;
        Ok(())
    }

    async fn list_project_versions(&self, name: &str) -> Result<Vec<ProjectVersion>> {
        let versions = sqlx::query_as::<_, ProjectVersion>(
            r#"
            SELECT id, name, version, created_at
            FROM project_versions
            WHERE name = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .context("failed to list project versions")?;
        Ok(versions)
    }

    async fn find_project(&self, id: i64) -> Result<Option<ProjectRecord>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            r#"
            SELECT id, name, image_name, status, target_hosts, container_name
            FROM projects
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load project")?;
        row.map(ProjectRecord::try_from).transpose()
    }

    async fn mark_deploying(&self, job: &DeploymentJob) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO deployment_jobs
                (id, project_id, image_name, container_name, target_hosts, status, started_at)
            VALUES ($1, $2, $3, $4, $5, 'deploying', $6)
            "#,
        )
        .bind(job.id)
        .bind(job.project_id)
        .bind(&job.image_name)
        .bind(&job.container_name)
        .bind(SqlJson(&job.target_hosts))
        .bind(job.started_at)
        .execute(&mut *tx)
        .await
        .context("failed to record deployment job")?;
        sqlx::query("UPDATE projects SET status = 'deploying', updated_at = now() WHERE id = $1")
            .bind(job.project_id)
            .execute(&mut *tx)
            .await
            .context("failed to mark project deploying")?;
        tx.commit().await?;
        Ok(())
    }

    async fn finish_deployment(&self, job: &DeploymentJob) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE deployment_jobs
            SET results = $2, diff = $3, status = $4, finished_at = $5
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(SqlJson(&job.results))
        .bind(SqlJson(&job.diff))
        .bind(job.status.as_str())
        .bind(job.finished_at)
        .execute(&mut *tx)
        .await
        .context("failed to store deployment results")?;
        sqlx::query(
            r#"
            UPDATE projects
            SET status = $2, target_hosts = $3, container_name = $4, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job.project_id)
        .bind(job.status.as_str())
        .bind(SqlJson(&job.target_hosts))
        .bind(&job.container_name)
        .execute(&mut *tx)
        .await
        .context("failed to persist deployment topology")?;
        tx.commit().await?;
        Ok(())
    }

    async fn reconcile_stuck_deployments(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE deployment_jobs
            SET status = 'deploy_failure', finished_at = now()
            WHERE status = 'deploying'
            "#,
        )
        .execute(&mut *tx)
        .await
        .context("failed to reconcile deployment jobs")?;
        let projects = sqlx::query(
            "UPDATE projects SET status = 'deploy_failure', updated_at = now() WHERE status = 'deploying'",
        )
        .execute(&mut *tx)
        .await
        .context("failed to reconcile projects")?;
        tx.commit().await?;
        Ok(projects.rows_affected())
    }
}
