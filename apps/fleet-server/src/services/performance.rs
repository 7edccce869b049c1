use std::sync::Arc;

use crate::error::{FleetError, FleetResult};
use crate::models::{ContainerPerformance, MetricKind, ServerPerformance, ServerRecord, TimeRange};
use crate::store::FleetStore;

/// Reads back the telemetry that agents push through `/remote/server/report`.
pub struct PerformanceReader {
    store: Arc<dyn FleetStore>,
}

impl PerformanceReader {
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self { store }
    }

    async fn server(&self, server_id: i64) -> FleetResult<ServerRecord> {
        self.store
            .find_server(server_id)
            .await?
            .ok_or_else(|| FleetError::not_found(format!("server {server_id} not found")))
    }

    pub async fn server_performance(
        &self,
        server_id: i64,
        range: TimeRange,
    ) -> FleetResult<ServerPerformance> {
        let (start, end) = bounds(range)?;
        let server = self.server(server_id).await?;
        let ip = server.public_ip.as_str();
        Ok(ServerPerformance {
            cpu: self.store.metric_series(ip, MetricKind::Cpu, start, end).await?,
            memory: self.store.metric_series(ip, MetricKind::Memory, start, end).await?,
            net: self.store.metric_series(ip, MetricKind::Net, start, end).await?,
            disk: self.store.latest_metric(ip, MetricKind::Disk, end).await?,
        })
    }

    pub async fn container_performance(
        &self,
        server_id: i64,
        container_name: &str,
        range: TimeRange,
    ) -> FleetResult<ContainerPerformance> {
        let container_name = container_name.trim();
        if container_name.is_empty() {
            return Err(FleetError::validation("container_name is required"));
        }
        let (start, end) = bounds(range)?;
        let server = self.server(server_id).await?;
        let samples = self
            .store
            .container_series(&server.public_ip, container_name, start, end)
            .await?;
        Ok(ContainerPerformance {
            container_name: container_name.to_string(),
            samples,
        })
    }
}

fn bounds(
    range: TimeRange,
) -> FleetResult<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)> {
    if range.start_time > range.end_time {
        return Err(FleetError::validation(
            "start_time must not be after end_time",
        ));
    }
    range
        .bounds()
        .map_err(|err| FleetError::validation(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::JsonValue;
    use crate::models::{AgentReport, NewServer};
    use crate::test_support::{test_harness, FakeRemote};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn report(ip: &str, time: i64, cpu: i64) -> AgentReport {
        AgentReport {
            public_ip: ip.to_string(),
            time,
            cpu: json!({"percent": cpu}).into(),
            memory: json!({"percent": cpu / 2}).into(),
            disk: json!({"free": 100 - cpu, "total": 100}).into(),
            net: json!({"input": time, "output": 0}).into(),
            docker: BTreeMap::from([(
                "web".to_string(),
                JsonValue::from(json!({"cpu": cpu})),
            )]),
        }
    }

    async fn seeded() -> (Arc<dyn FleetStore>, i64) {
        let (state, _) = test_harness(Arc::new(FakeRemote::default()));
        let server = state
            .store
            .register_server(&NewServer {
                name: "node".to_string(),
                public_ip: "10.3.0.1".to_string(),
                cluster_id: 1,
                username: "root".to_string(),
                encrypted_password: "sealed".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        for (time, cpu) in [(300, 30), (100, 10), (200, 20), (400, 40)] {
            state.store.append_report(&report("10.3.0.1", time, cpu)).await.unwrap();
        }
        state
            .store
            .append_report(&report("10.3.0.2", 200, 99))
            .await
            .unwrap();
        (state.store, server.id)
    }

    #[tokio::test]
    async fn server_series_are_ranged_and_ordered() {
        let (store, id) = seeded().await;
        let reader = PerformanceReader::new(store);
        let perf = reader
            .server_performance(id, TimeRange { start_time: 100, end_time: 300 })
            .await
            .unwrap();
        let cpu: Vec<_> = perf.cpu.iter().map(|p| p.content["percent"].clone()).collect();
        assert_eq!(cpu, vec![json!(10), json!(20), json!(30)]);
        assert_eq!(perf.memory.len(), 3);
        assert_eq!(perf.net[0].created_time.timestamp(), 100);
        let disk = perf.disk.unwrap();
        assert_eq!(disk.created_time.timestamp(), 300);
        assert_eq!(disk.content["free"], 70);
    }

    #[tokio::test]
    async fn disk_falls_back_to_the_last_sample_before_the_range() {
        let (store, id) = seeded().await;
        let reader = PerformanceReader::new(store);
        let perf = reader
            .server_performance(id, TimeRange { start_time: 1_000, end_time: 2_000 })
            .await
            .unwrap();
        assert!(perf.cpu.is_empty());
        assert_eq!(perf.disk.unwrap().created_time.timestamp(), 400);
    }

    #[tokio::test]
    async fn container_series_filters_by_name() {
        let (store, id) = seeded().await;
        let reader = PerformanceReader::new(store);
        let perf = reader
            .container_performance(id, " web ", TimeRange { start_time: 0, end_time: 250 })
            .await
            .unwrap();
        assert_eq!(perf.container_name, "web");
        let cpu: Vec<_> = perf.samples.iter().map(|p| p.content["cpu"].clone()).collect();
        assert_eq!(cpu, vec![json!(10), json!(20)]);

        let none = reader
            .container_performance(id, "db", TimeRange { start_time: 0, end_time: 500 })
            .await
            .unwrap();
        assert!(none.samples.is_empty());
    }

    #[tokio::test]
    async fn bad_requests_are_rejected() {
        let (store, id) = seeded().await;
        let reader = PerformanceReader::new(store);
        let inverted = reader
            .server_performance(id, TimeRange { start_time: 5, end_time: 1 })
            .await;
        assert!(matches!(inverted, Err(FleetError::Validation(_))));
        let unnamed = reader
            .container_performance(id, "  ", TimeRange { start_time: 0, end_time: 1 })
            .await;
        assert!(matches!(unnamed, Err(FleetError::Validation(_))));
        let missing = reader
            .server_performance(999, TimeRange { start_time: 0, end_time: 1 })
            .await;
        assert!(matches!(missing, Err(FleetError::NotFound(_))));
    }
}
