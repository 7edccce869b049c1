use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{CommandTemplates, FleetConfig};
use crate::json::JsonValue;
use crate::kv::MemoryKv;
use crate::models::{
    AgentReport, BuildStatus, DeploymentJob, DeploymentStatus, MetricKind, MetricPoint,
    NewServer, ProjectRecord, ProjectVersion, ServerAccount, ServerRecord,
};
use crate::remote::{
    repeat_runs, CommandOutput, LineSink, RemoteError, RemoteExec, SshLogin, StreamOptions,
};
use crate::services::onboarding::PushChannel;
use crate::state::AppState;
use crate::store::FleetStore;
use crate::vault::CredentialVault;

pub const BUILD_HOST: &str = "10.250.0.1";

pub fn test_vault() -> CredentialVault {
    CredentialVault::from_hex_key(&"11".repeat(32)).expect("test vault key")
}

pub fn test_config() -> FleetConfig {
    FleetConfig {
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        vault_key: "11".repeat(32),
        build_host: Some(BUILD_HOST.to_string()),
        ssh_port: 22,
        ssh_workers: 4,
        ssh_timeout: Duration::from_secs(5),
        build_timeout: Duration::from_secs(5),
        onboarding_poll_interval: Duration::from_millis(20),
        deploy_job_timeout: Duration::from_millis(500),
        console_repeat: 2,
        console_interval: Duration::from_millis(5),
        commands: CommandTemplates::default(),
    }
}

/// State over in-memory fakes, plus the concrete store for assertions.
pub fn test_harness(remote: Arc<FakeRemote>) -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::default());
    let state = AppState::new(
        test_config(),
        store.clone(),
        Arc::new(MemoryKv::new()),
        remote,
        test_vault(),
    );
    (state, store)
}

pub fn test_state(remote: Arc<FakeRemote>) -> AppState {
    test_harness(remote).0
}

#[derive(Default)]
struct StoreTables {
    next_id: i64,
    servers: BTreeMap<i64, ServerRecord>,
    accounts: HashMap<String, ServerAccount>,
    metrics: Vec<(String, MetricKind, i64, JsonValue)>,
    containers: Vec<(String, String, i64, JsonValue)>,
    build_jobs: BTreeMap<i64, (BuildStatus, Vec<String>)>,
    versions: Vec<ProjectVersion>,
    projects: BTreeMap<i64, ProjectRecord>,
    deployments: HashMap<Uuid, DeploymentJob>,
}

impl StoreTables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

fn metric_point((time, content): (i64, JsonValue)) -> MetricPoint {
    MetricPoint {
        created_time: DateTime::<Utc>::from_timestamp(time, 0).unwrap_or_default(),
        content,
    }
}

/// `FleetStore` over plain maps, one lock per call.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<StoreTables>,
}

impl MemoryStore {
    fn tables(&self) -> std::sync::MutexGuard<'_, StoreTables> {
        self.tables.lock().expect("memory store lock")
    }

    pub fn insert_project(&self, name: &str, image_name: &str) -> i64 {
        let mut tables = self.tables();
        let id = tables.next_id();
        tables.projects.insert(
            id,
            ProjectRecord {
                id,
                name: name.to_string(),
                image_name: image_name.to_string(),
                status: None,
                target_hosts: Vec::new(),
                container_name: None,
            },
        );
        id
    }

    pub fn deployment(&self, id: Uuid) -> Option<DeploymentJob> {
        self.tables().deployments.get(&id).cloned()
    }

    /// (table, report time) for every metric row written for `public_ip`.
    pub fn metric_rows(&self, public_ip: &str) -> Vec<(&'static str, i64)> {
        self.tables()
            .metrics
            .iter()
            .filter(|(ip, _, _, _)| ip == public_ip)
            .map(|(_, kind, time, _)| (kind.table(), *time))
            .collect()
    }

    pub fn container_rows(&self, public_ip: &str) -> Vec<(String, i64)> {
        self.tables()
            .containers
            .iter()
            .filter(|(ip, _, _, _)| ip == public_ip)
            .map(|(_, name, time, _)| (name.clone(), *time))
            .collect()
    }

    pub fn server_count(&self) -> usize {
        self.tables().servers.len()
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn find_server(&self, id: i64) -> Result<Option<ServerRecord>> {
        Ok(self.tables().servers.get(&id).cloned())
    }

    async fn find_server_by_ip(&self, public_ip: &str) -> Result<Option<ServerRecord>> {
        Ok(self
            .tables()
            .servers
            .values()
            .find(|server| server.public_ip == public_ip)
            .cloned())
    }

    async fn register_server(&self, server: &NewServer) -> Result<Option<ServerRecord>> {
        let mut tables = self.tables();
        if tables
            .servers
            .values()
            .any(|existing| existing.public_ip == server.public_ip)
        {
            return Ok(None);
        }
        let id = tables.next_id();
        let record = ServerRecord {
            id,
            name: server.name.clone(),
            public_ip: server.public_ip.clone(),
            cluster_id: server.cluster_id,
            created_time: Utc::now(),
        };
        tables.servers.insert(id, record.clone());
        tables.accounts.insert(
            server.public_ip.clone(),
            ServerAccount {
                public_ip: server.public_ip.clone(),
                username: server.username.clone(),
                encrypted_password: server.encrypted_password.clone(),
            },
        );
        Ok(Some(record))
    }

    async fn remove_server(&self, id: i64) -> Result<Option<ServerRecord>> {
        let mut tables = self.tables();
        let removed = tables.servers.remove(&id);
        if let Some(server) = &removed {
            tables.accounts.remove(&server.public_ip);
        }
        Ok(removed)
    }

    async fn find_account(&self, public_ip: &str) -> Result<Option<ServerAccount>> {
        Ok(self.tables().accounts.get(public_ip).cloned())
    }

    async fn append_report(&self, report: &AgentReport) -> Result<()> {
        let mut tables = self.tables();
        for kind in MetricKind::ALL {
            let content = kind.section(report).clone();
            tables
                .metrics
                .push((report.public_ip.clone(), kind, report.time, content));
        }
        for (name, stats) in &report.docker {
            tables.containers.push((
                report.public_ip.clone(),
                name.clone(),
                report.time,
                stats.clone(),
            ));
        }
        Ok(())
    }

    async fn metric_series(
        &self,
        public_ip: &str,
        kind: MetricKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>> {
        let (start, end) = (start.timestamp(), end.timestamp());
        let mut points: Vec<(i64, JsonValue)> = self
            .tables()
            .metrics
            .iter()
            .filter(|(ip, k, time, _)| ip == public_ip && *k == kind && (start..=end).contains(time))
            .map(|(_, _, time, content)| (*time, content.clone()))
            .collect();
        points.sort_by_key(|(time, _)| *time);
        Ok(points.into_iter().map(metric_point).collect())
    }

    async fn latest_metric(
        &self,
        public_ip: &str,
        kind: MetricKind,
        at: DateTime<Utc>,
    ) -> Result<Option<MetricPoint>> {
        let at = at.timestamp();
        Ok(self
            .tables()
            .metrics
            .iter()
            .filter(|(ip, k, time, _)| ip == public_ip && *k == kind && *time <= at)
            .max_by_key(|(_, _, time, _)| *time)
            .map(|(_, _, time, content)| metric_point((*time, content.clone()))))
    }

    async fn container_series(
        &self,
        public_ip: &str,
        container_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>> {
        let (start, end) = (start.timestamp(), end.timestamp());
        let mut points: Vec<(i64, JsonValue)> = self
            .tables()
            .containers
            .iter()
            .filter(|(ip, name, time, _)| {
                ip == public_ip && name == container_name && (start..=end).contains(time)
            })
            .map(|(_, _, time, content)| (*time, content.clone()))
            .collect();
        points.sort_by_key(|(time, _)| *time);
        Ok(points.into_iter().map(metric_point).collect())
    }

    async fn create_build_job(&self, _project_name: &str, _version: &str) -> Result<i64> {
        let mut tables = self.tables();
        let id = tables.next_id();
        tables
            .build_jobs
            .insert(id, (BuildStatus::Building, Vec::new()));
        Ok(id)
    }

    async fn finish_build_job(
        &self,
        id: i64,
        status: BuildStatus,
        output_log: &[String],
    ) -> Result<bool> {
        let mut tables = self.tables();
        match tables.build_jobs.get_mut(&id) {
            Some(job) if job.0 == BuildStatus::Building => {
                *job = (status, output_log.to_vec());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_project_version(&self, name: &str, version: &str) -> Result<()> {
        let mut tables = self.tables();
        let id = tables.next_id();
        tables.versions.push(ProjectVersion {
            id,
            name: name.to_string(),
            version: version.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_project_versions(&self, name: &str) -> Result<Vec<ProjectVersion>> {
        let mut versions: Vec<ProjectVersion> = self
            .tables()
            .versions
            .iter()
            .filter(|version| version.name == name)
            .cloned()
            .collect();
        versions.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(versions)
    }

    async fn find_project(&self, id: i64) -> Result<Option<ProjectRecord>> {
        Ok(self.tables().projects.get(&id).cloned())
    }

    async fn mark_deploying(&self, job: &DeploymentJob) -> Result<()> {
        let mut tables = self.tables();
        tables.deployments.insert(job.id, job.clone());
        if let Some(project) = tables.projects.get_mut(&job.project_id) {
            project.status = Some(DeploymentStatus::Deploying);
        }
        Ok(())
    }

    async fn finish_deployment(&self, job: &DeploymentJob) -> Result<()> {
        let mut tables = self.tables();
        tables.deployments.insert(job.id, job.clone());
        if let Some(project) = tables.projects.get_mut(&job.project_id) {
            project.status = Some(job.status);
            project.target_hosts = job.target_hosts.clone();
            project.container_name = Some(job.container_name.clone());
        }
        Ok(())
    }

    async fn reconcile_stuck_deployments(&self) -> Result<u64> {
        let mut tables = self.tables();
        for job in tables.deployments.values_mut() {
            if job.status == DeploymentStatus::Deploying {
                job.status = DeploymentStatus::DeployFailure;
                job.finished_at = Some(Utc::now());
            }
        }
        let mut flipped = 0;
        for project in tables.projects.values_mut() {
            if project.status == Some(DeploymentStatus::Deploying) {
                project.status = Some(DeploymentStatus::DeployFailure);
                flipped += 1;
            }
        }
        Ok(flipped)
    }
}

#[derive(Clone, Default)]
struct Script {
    output: CommandOutput,
    failure: Option<String>,
    delay: Option<Duration>,
}

/// Scripted `RemoteExec`. Hosts without a script succeed with empty output.
#[derive(Default)]
pub struct FakeRemote {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeRemote {
    pub fn respond(&self, host: &str, stdout: &[&str], stderr: &[&str]) {
        let mut scripts = self.scripts.lock().expect("scripts lock");
        let script = scripts.entry(host.to_string()).or_default();
        script.output = CommandOutput {
            stdout: stdout.iter().map(|line| line.to_string()).collect(),
            stderr: stderr.iter().map(|line| line.to_string()).collect(),
        };
    }

    pub fn fail(&self, host: &str, message: &str) {
        let mut scripts = self.scripts.lock().expect("scripts lock");
        scripts.entry(host.to_string()).or_default().failure = Some(message.to_string());
    }

    pub fn delay(&self, host: &str, delay: Duration) {
        let mut scripts = self.scripts.lock().expect("scripts lock");
        scripts.entry(host.to_string()).or_default().delay = Some(delay);
    }

    /// (host, command) for every call, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn begin(&self, login: &SshLogin, command: &str) -> Script {
        self.calls
            .lock()
            .expect("calls lock")
            .push((login.host.clone(), command.to_string()));
        self.scripts
            .lock()
            .expect("scripts lock")
            .get(&login.host)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteExec for FakeRemote {
    async fn exec(
        &self,
        login: &SshLogin,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        let script = self.begin(login, command);
        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        match script.failure {
            Some(message) => Err(RemoteError::Unreachable {
                host: login.host.clone(),
                message,
            }),
            None => Ok(script.output),
        }
    }

    async fn stream(
        &self,
        login: &SshLogin,
        command: &str,
        options: StreamOptions,
        mut sink: LineSink,
        cancel: CancellationToken,
    ) -> Result<(), RemoteError> {
        let script = self.begin(login, command);
        if let Some(message) = script.failure {
            return Err(RemoteError::Unreachable {
                host: login.host.clone(),
                message,
            });
        }
        let lines: Vec<String> = script
            .output
            .stdout
            .iter()
            .chain(&script.output.stderr)
            .cloned()
            .collect();
        tokio::task::spawn_blocking(move || {
            repeat_runs(&options, &cancel, || {
                for line in &lines {
                    sink(line.clone());
                }
                Ok::<_, RemoteError>(true)
            })
        })
        .await
        .map_err(|err| RemoteError::Pool(err.to_string()))?
    }
}

/// `PushChannel` that keeps every message it was given.
#[derive(Default)]
pub struct RecordingChannel {
    messages: Mutex<Vec<String>>,
}

impl RecordingChannel {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().expect("messages lock").clone()
    }
}

#[async_trait]
impl PushChannel for RecordingChannel {
    async fn send(&self, message: String) -> bool {
        self.messages.lock().expect("messages lock").push(message);
        true
    }
}
