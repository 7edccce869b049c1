use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::json::JsonValue;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct ServerRecord {
    pub id: i64,
    pub name: String,
    pub public_ip: String,
    pub cluster_id: i64,
    pub created_time: DateTime<Utc>,
}

/// Everything needed to create a `ServerRecord` and its `ServerAccount` in one step.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub name: String,
    pub public_ip: String,
    pub cluster_id: i64,
    pub username: String,
    pub encrypted_password: String,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ServerAccount {
    pub public_ip: String,
    pub username: String,
    pub encrypted_password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OnboardingPhase {
    Pending,
    Installing,
    Deployed,
    Failed,
}

/// In-flight onboarding, stored as JSON in the key-value store under the host's IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOnboarding {
    pub public_ip: String,
    pub name: String,
    pub cluster_id: i64,
    pub username: String,
    pub encrypted_password: String,
    pub phase: OnboardingPhase,
}

impl PendingOnboarding {
    pub fn into_new_server(self) -> NewServer {
        NewServer {
            name: self.name,
            public_ip: self.public_ip,
            cluster_id: self.cluster_id,
            username: self.username,
            encrypted_password: self.encrypted_password,
        }
    }
}

/// Periodic telemetry pushed by a host's monitoring agent.
#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct AgentReport {
    pub public_ip: String,
    /// Unix timestamp (seconds) taken on the agent.
    pub time: i64,
    pub cpu: JsonValue,
    pub memory: JsonValue,
    pub disk: JsonValue,
    #[serde(default)]
    pub net: JsonValue,
    #[serde(default)]
    pub docker: BTreeMap<String, JsonValue>,
}

impl AgentReport {
    pub fn timestamp(&self) -> anyhow::Result<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.time, 0)
            .ok_or_else(|| anyhow::anyhow!("report timestamp {} is out of range", self.time))
    }
}

/// Host-level telemetry tables written by `append_report`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Cpu,
    Memory,
    Disk,
    Net,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [Self::Cpu, Self::Memory, Self::Disk, Self::Net];

    pub fn table(self) -> &'static str {
        match self {
            Self::Cpu => "cpu_metrics",
            Self::Memory => "memory_metrics",
            Self::Disk => "disk_metrics",
            Self::Net => "net_metrics",
        }
    }

    pub fn section(self, report: &AgentReport) -> &JsonValue {
        match self {
            Self::Cpu => &report.cpu,
            Self::Memory => &report.memory,
            Self::Disk => &report.disk,
            Self::Net => &report.net,
        }
    }
}

/// One stored telemetry sample, stamped with the agent's report time.
#[derive(Debug, Clone, PartialEq, Serialize, utoipa::ToSchema)]
pub struct MetricPoint {
    pub created_time: DateTime<Utc>,
    pub content: JsonValue,
}

/// Closed interval of report times, as unix seconds.
#[derive(Debug, Clone, Copy, Deserialize, utoipa::ToSchema)]
pub struct TimeRange {
    pub start_time: i64,
    pub end_time: i64,
}

impl TimeRange {
    pub fn bounds(self) -> anyhow::Result<(DateTime<Utc>, DateTime<Utc>)> {
        let at = |secs: i64| {
            DateTime::<Utc>::from_timestamp(secs, 0)
                .ok_or_else(|| anyhow::anyhow!("timestamp {secs} is out of range"))
        };
        Ok((at(self.start_time)?, at(self.end_time)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, utoipa::ToSchema)]
pub struct ServerPerformance {
    pub cpu: Vec<MetricPoint>,
    pub memory: Vec<MetricPoint>,
    pub net: Vec<MetricPoint>,
    /// Latest disk sample at or before the end of the range.
    pub disk: Option<MetricPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, utoipa::ToSchema)]
pub struct ContainerPerformance {
    pub container_name: String,
    pub samples: Vec<MetricPoint>,
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(anyhow::anyhow!(
                        "unknown {} value {other:?}",
                        stringify!($name)
                    )),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Building,
    BuildSuccess,
    BuildFailure,
}

text_enum!(BuildStatus {
    Building => "building",
    BuildSuccess => "build_success",
    BuildFailure => "build_failure",
});

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct BuildJob {
    pub id: i64,
    pub project_name: String,
    pub version: String,
    pub status: BuildStatus,
    pub output_log: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Deploying,
    DeploySuccess,
    DeployFailure,
}

text_enum!(DeploymentStatus {
    Deploying => "deploying",
    DeploySuccess => "deploy_success",
    DeployFailure => "deploy_failure",
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct HostResult {
    pub output: Vec<String>,
    pub error: Vec<String>,
}

impl HostResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            output: Vec::new(),
            error: vec![message.into()],
        }
    }
}

/// How a deployment's host set differs from the topology persisted by the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TopologyDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl TopologyDiff {
    pub fn between(previous: &[String], next: &[String]) -> Self {
        let before: BTreeSet<&str> = previous.iter().map(String::as_str).collect();
        let after: BTreeSet<&str> = next.iter().map(String::as_str).collect();
        let mut diff = Self::default();
        for host in next {
            if before.contains(host.as_str()) {
                diff.unchanged.push(host.clone());
            } else {
                diff.added.push(host.clone());
            }
        }
        diff.removed = previous
            .iter()
            .filter(|host| !after.contains(host.as_str()))
            .cloned()
            .collect();
        diff
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct DeploymentJob {
    pub id: Uuid,
    pub project_id: i64,
    pub image_name: String,
    pub container_name: String,
    pub target_hosts: Vec<String>,
    pub results: BTreeMap<String, HostResult>,
    pub status: DeploymentStatus,
    pub diff: TopologyDiff,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeploymentJob {
    /// `deploy_success` iff every target host finished with an empty error list.
    pub fn aggregate_status(&self) -> DeploymentStatus {
        let all_clean = self.target_hosts.iter().all(|host| {
            self.results
                .get(host)
                .map(|result| result.error.is_empty())
                .unwrap_or(false)
        });
        if all_clean {
            DeploymentStatus::DeploySuccess
        } else {
            DeploymentStatus::DeployFailure
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, utoipa::ToSchema)]
pub struct ProjectRecord {
    pub id: i64,
    pub name: String,
    pub image_name: String,
    pub status: Option<DeploymentStatus>,
    pub target_hosts: Vec<String>,
    pub container_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct ProjectVersion {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

/// One row of `docker ps -a` on a managed host. Never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct ContainerRecord {
    pub container_id: String,
    pub name: String,
    pub status: String,
    pub created_time: String,
    pub host_server_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct ImageRecord {
    pub tag: String,
    pub created_at: String,
}
