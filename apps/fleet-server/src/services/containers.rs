use anyhow::Context;
use std::sync::Arc;

use crate::commands::{shell_quote, validate_docker_ref};
use crate::error::{FleetError, FleetResult};
use crate::json::JsonValue;
use crate::models::ContainerRecord;
use crate::remote::{CommandOutput, RemoteExec};
use crate::services::credentials::CredentialResolver;

const LIST_COMMAND: &str = "docker ps -a --format '{{.ID}},{{.Names}},{{.Status}},{{.CreatedAt}}'";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Stop,
    Remove,
}

impl ContainerAction {
    fn command(self, container_id: &str) -> String {
        let id = shell_quote(container_id);
        match self {
            Self::Start => format!("docker start {id}"),
            Self::Stop => format!("docker stop {id}"),
            Self::Remove => format!("docker rm -f {id}"),
        }
    }
}

/// Drops the relative-time part docker appends to a status while keeping any trailing
/// parenthesised state: `Up 3 hours (Paused)` becomes `Up (Paused)`.
pub(crate) fn trim_status_suffix(status: &str) -> String {
    let status = status.trim();
    let (head, state) = match status.rfind(" (") {
        Some(idx) if status.ends_with(')') && idx > 0 && !status[..idx].ends_with(')') => {
            (&status[..idx], Some(&status[idx + 1..]))
        }
        _ => (status, None),
    };
    let base = if let Some(rest) = head.strip_prefix("Exited ") {
        // `Exited (0) 2 days ago` keeps its exit code.
        match rest.find(')') {
            Some(end) if rest.starts_with('(') => format!("Exited {}", &rest[..=end]),
            _ => "Exited".to_string(),
        }
    } else {
        head.split_whitespace().next().unwrap_or_default().to_string()
    };
    match state {
        Some(state) => format!("{base} {state}"),
        None => base,
    }
}

pub(crate) fn parse_container_list(lines: &[String], host_server_id: i64) -> Vec<ContainerRecord> {
    lines
        .iter()
        .filter_map(|line| {
            // Names can be a comma-joined list, so the other fields are taken from the ends.
            let (container_id, rest) = line.split_once(',')?;
            let mut tail = rest.rsplitn(3, ',');
            let created_time = tail.next()?.trim();
            let status = tail.next()?.trim();
            let name = tail.next()?.trim();
            let container_id = container_id.trim();
            if container_id.is_empty() {
                return None;
            }
            Some(ContainerRecord {
                container_id: container_id.to_string(),
                name: name.to_string(),
                status: trim_status_suffix(status),
                created_time: created_time.to_string(),
                host_server_id,
            })
        })
        .collect()
}

fn require_clean(output: CommandOutput) -> FleetResult<Vec<String>> {
    if output.succeeded() {
        Ok(output.stdout)
    } else {
        Err(FleetError::CommandFailed(output.stderr))
    }
}

/// Container operations on a managed host. Nothing is cached; credentials are resolved
/// on every call.
pub struct ContainerManager {
    credentials: CredentialResolver,
    remote: Arc<dyn RemoteExec>,
    timeout: std::time::Duration,
}

impl ContainerManager {
    pub fn new(
        credentials: CredentialResolver,
        remote: Arc<dyn RemoteExec>,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            credentials,
            remote,
            timeout,
        }
    }

    pub async fn list(&self, server_id: i64) -> FleetResult<Vec<ContainerRecord>> {
        let (server, login) = self.credentials.login_for_server(server_id).await?;
        let output = self.remote.exec(&login, LIST_COMMAND, self.timeout).await?;
        let lines = require_clean(output)?;
        Ok(parse_container_list(&lines, server.id))
    }

    pub async fn apply(
        &self,
        server_id: i64,
        container_id: &str,
        action: ContainerAction,
    ) -> FleetResult<Vec<String>> {
        validate_docker_ref("container_id", container_id).map_err(FleetError::Validation)?;
        let (_, login) = self.credentials.login_for_server(server_id).await?;
        let output = self
            .remote
            .exec(&login, &action.command(container_id.trim()), self.timeout)
            .await?;
        let lines = require_clean(output)?;
        tracing::info!(server_id, container_id = %container_id, action = ?action, "container action applied");
        Ok(lines)
    }

    pub async fn inspect(&self, server_id: i64, container_id: &str) -> FleetResult<JsonValue> {
        validate_docker_ref("container_id", container_id).map_err(FleetError::Validation)?;
        let (_, login) = self.credentials.login_for_server(server_id).await?;
        let command = format!("docker inspect {}", shell_quote(container_id.trim()));
        let output = self.remote.exec(&login, &command, self.timeout).await?;
        let lines = require_clean(output)?;
        let parsed: serde_json::Value = serde_json::from_str(&lines.join("\n"))
            .context("docker inspect returned invalid JSON")?;
        // `docker inspect` always wraps a single object in an array.
        let value = match parsed {
            serde_json::Value::Array(mut items) if items.len() == 1 => items.remove(0),
            other => other,
        };
        Ok(JsonValue(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewServer;
    use crate::test_support::{test_state, FakeRemote};

    fn lines(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn trims_relative_time_from_status() {
        assert_eq!(trim_status_suffix("Up 3 weeks"), "Up");
        assert_eq!(trim_status_suffix("Up About an hour"), "Up");
        assert_eq!(trim_status_suffix("Exited (0) 2 days ago"), "Exited (0)");
        assert_eq!(trim_status_suffix("Exited (137) 5 seconds ago"), "Exited (137)");
        assert_eq!(trim_status_suffix("Up 3 hours (Paused)"), "Up (Paused)");
        assert_eq!(trim_status_suffix("Up 2 minutes (healthy)"), "Up (healthy)");
        assert_eq!(trim_status_suffix("Created"), "Created");
        assert_eq!(trim_status_suffix(""), "");
    }

    #[test]
    fn parses_docker_ps_rows() {
        let parsed = parse_container_list(
            &lines(&[
                "a1b2c3,web,Up 3 weeks,2024-01-01 10:00:00 +0000 UTC",
                "d4e5f6,worker,Exited (1) 2 hours ago,2024-01-02 11:00:00 +0000 UTC",
                "garbage line",
            ]),
            7,
        );
        assert_eq!(
            parsed,
            vec![
                ContainerRecord {
                    container_id: "a1b2c3".to_string(),
                    name: "web".to_string(),
                    status: "Up".to_string(),
                    created_time: "2024-01-01 10:00:00 +0000 UTC".to_string(),
                    host_server_id: 7,
                },
                ContainerRecord {
                    container_id: "d4e5f6".to_string(),
                    name: "worker".to_string(),
                    status: "Exited (1)".to_string(),
                    created_time: "2024-01-02 11:00:00 +0000 UTC".to_string(),
                    host_server_id: 7,
                },
            ]
        );
    }

    #[test]
    fn linked_container_names_stay_together() {
        let parsed = parse_container_list(
            &lines(&["a1b2c3,web,proxy/web,Up 5 minutes (Paused),2024-03-04 09:00:00 +0000 UTC"]),
            2,
        );
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].container_id, "a1b2c3");
        assert_eq!(parsed[0].name, "web,proxy/web");
        assert_eq!(parsed[0].status, "Up (Paused)");
        assert_eq!(parsed[0].created_time, "2024-03-04 09:00:00 +0000 UTC");
    }

    async fn setup(remote: Arc<FakeRemote>) -> (crate::state::AppState, i64) {
        let state = test_state(remote);
        let server = state
            .store
            .register_server(&NewServer {
                name: "app-1".to_string(),
                public_ip: "10.3.0.1".to_string(),
                cluster_id: 1,
                username: "root".to_string(),
                encrypted_password: state.vault.encrypt("pw").unwrap(),
            })
            .await
            .unwrap()
            .unwrap();
        (state, server.id)
    }

    #[tokio::test]
    async fn lists_containers_on_a_server() {
        let remote = Arc::new(FakeRemote::default());
        remote.respond("10.3.0.1", &["abc,web,Up 1 day,2024-01-01"], &[]);
        let (state, server_id) = setup(remote.clone()).await;

        let containers = state.containers.list(server_id).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].host_server_id, server_id);
        assert_eq!(remote.calls()[0].1, LIST_COMMAND);
    }

    #[tokio::test]
    async fn actions_quote_the_container_id() {
        let remote = Arc::new(FakeRemote::default());
        remote.respond("10.3.0.1", &["abc"], &[]);
        let (state, server_id) = setup(remote.clone()).await;

        state
            .containers
            .apply(server_id, "abc", ContainerAction::Stop)
            .await
            .unwrap();
        state
            .containers
            .apply(server_id, "abc", ContainerAction::Remove)
            .await
            .unwrap();
        let calls = remote.calls();
        assert_eq!(calls[0].1, "docker stop 'abc'");
        assert_eq!(calls[1].1, "docker rm -f 'abc'");

        let err = state
            .containers
            .apply(server_id, "abc; reboot", ContainerAction::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[tokio::test]
    async fn stderr_is_a_command_failure() {
        let remote = Arc::new(FakeRemote::default());
        remote.respond("10.3.0.1", &[], &["Error: No such container: abc"]);
        let (state, server_id) = setup(remote).await;
        let err = state
            .containers
            .apply(server_id, "abc", ContainerAction::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::CommandFailed(_)));
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let (state, _) = setup(Arc::new(FakeRemote::default())).await;
        let err = state.containers.list(4242).await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }

    #[tokio::test]
    async fn inspect_unwraps_single_object() {
        let remote = Arc::new(FakeRemote::default());
        remote.respond(
            "10.3.0.1",
            &["[", "  {\"Id\": \"abc\", \"State\": {\"Running\": true}}", "]"],
            &[],
        );
        let (state, server_id) = setup(remote).await;
        let inspected = state.containers.inspect(server_id, "abc").await.unwrap();
        assert_eq!(inspected["Id"], "abc");
        assert_eq!(inspected["State"]["Running"], true);
    }
}
