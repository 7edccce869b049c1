use anyhow::Context;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FleetError, FleetResult};
use crate::kv::KvStore;
use crate::models::{AgentReport, OnboardingPhase, PendingOnboarding};
use crate::services::onboarding::{DEPLOYED_KEY, DEPLOYING_KEY};
use crate::store::FleetStore;

const FINALIZE_LOCK_TTL: Duration = Duration::from_secs(30);

fn finalize_lock_key(public_ip: &str) -> String {
    format!("fleet:onboarding:finalize:{public_ip}")
}

/// Accepts agent telemetry. The first report from a host being onboarded promotes its
/// pending entry into a server record.
pub struct ReportIngestor {
    kv: Arc<dyn KvStore>,
    store: Arc<dyn FleetStore>,
}

impl ReportIngestor {
    pub fn new(kv: Arc<dyn KvStore>, store: Arc<dyn FleetStore>) -> Self {
        Self { kv, store }
    }

    /// Returns `true` when this report finalized the host's onboarding.
    pub async fn ingest(&self, mut report: AgentReport) -> FleetResult<bool> {
        let ip: IpAddr = report
            .public_ip
            .trim()
            .parse()
            .map_err(|_| FleetError::validation("public_ip is not a valid IP address"))?;
        report.public_ip = ip.to_string();
        report
            .timestamp()
            .map_err(|err| FleetError::validation(err.to_string()))?;
        let public_ip = report.public_ip.as_str();

        let pending = match self.kv.hget(DEPLOYING_KEY, public_ip).await? {
            Some(raw) => Some(
                serde_json::from_str::<PendingOnboarding>(&raw)
                    .with_context(|| format!("pending onboarding for {public_ip} is corrupt"))?,
            ),
            None => None,
        }
        .filter(|pending| pending.phase == OnboardingPhase::Installing);
        let deployed = self.kv.hget(DEPLOYED_KEY, public_ip).await?.is_some();

        if pending.is_none() && !deployed {
            tracing::warn!(public_ip = %public_ip, "rejected report from unknown host");
            return Err(FleetError::Unauthorized(format!(
                "{public_ip} is not a managed host"
            )));
        }

        let finalized = match pending {
            Some(pending) => self.finalize(pending).await?,
            None => false,
        };

        self.store
            .append_report(&report)
            .await
            .with_context(|| format!("failed to store report from {public_ip}"))?;
        Ok(finalized)
    }

    async fn finalize(&self, pending: PendingOnboarding) -> FleetResult<bool> {
        let public_ip = pending.public_ip.clone();
        let lock_key = finalize_lock_key(&public_ip);
        if !self
            .kv
            .set_nx(&lock_key, "1", Some(FINALIZE_LOCK_TTL))
            .await?
        {
            tracing::debug!(public_ip = %public_ip, "onboarding already being finalized");
            return Ok(false);
        }

        let result = self.promote(pending).await;
        if let Err(err) = self.kv.delete(&lock_key).await {
            tracing::warn!(public_ip = %public_ip, "failed to release finalize lock: {err:#}");
        }
        let created = result?;
        if created {
            tracing::info!(public_ip = %public_ip, "host onboarded");
        }
        Ok(created)
    }

    /// Marker before pending removal, so a concurrent report always sees one of the two.
    async fn promote(&self, pending: PendingOnboarding) -> anyhow::Result<bool> {
        let public_ip = pending.public_ip.clone();
        let created = self
            .store
            .register_server(&pending.into_new_server())
            .await?
            .is_some();
        self.kv
            .hset(
                DEPLOYED_KEY,
                &public_ip,
                &chrono::Utc::now().timestamp().to_string(),
            )
            .await?;
        self.kv.hdel(DEPLOYING_KEY, &public_ip).await?;
        Ok(created)
    }
}
