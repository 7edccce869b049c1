use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::FleetConfig;
use crate::kv::KvStore;
use crate::remote::RemoteExec;
use crate::services::builds::BuildRunner;
use crate::services::containers::ContainerManager;
use crate::services::credentials::CredentialResolver;
use crate::services::deployments::DeploymentExecutor;
use crate::services::hosts::HostManager;
use crate::services::ingest::ReportIngestor;
use crate::services::onboarding::OnboardingService;
use crate::services::performance::PerformanceReader;
use crate::store::FleetStore;
use crate::vault::CredentialVault;

#[derive(Clone)]
pub struct AppState {
    pub config: FleetConfig,
    pub kv: Arc<dyn KvStore>,
    pub store: Arc<dyn FleetStore>,
    pub vault: CredentialVault,
    pub onboarding: Arc<OnboardingService>,
    pub ingest: Arc<ReportIngestor>,
    pub builds: Arc<BuildRunner>,
    pub deployments: Arc<DeploymentExecutor>,
    pub containers: Arc<ContainerManager>,
    pub hosts: Arc<HostManager>,
    pub performance: Arc<PerformanceReader>,
    /// Parent of every per-connection token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wires every service onto the shared stores and remote executor.
    pub fn new(
        config: FleetConfig,
        store: Arc<dyn FleetStore>,
        kv: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteExec>,
        vault: CredentialVault,
    ) -> Self {
        let credentials = CredentialResolver::new(store.clone(), vault.clone(), config.ssh_port);
        let onboarding = Arc::new(OnboardingService::new(
            config.clone(),
            kv.clone(),
            store.clone(),
            remote.clone(),
            vault.clone(),
        ));
        let ingest = Arc::new(ReportIngestor::new(kv.clone(), store.clone()));
        let builds = Arc::new(BuildRunner::new(
            config.clone(),
            credentials.clone(),
            store.clone(),
            remote.clone(),
        ));
        let deployments = Arc::new(DeploymentExecutor::new(
            config.clone(),
            credentials.clone(),
            store.clone(),
            remote.clone(),
        ));
        let containers = Arc::new(ContainerManager::new(
            credentials.clone(),
            remote.clone(),
            config.ssh_timeout,
        ));
        let performance = Arc::new(PerformanceReader::new(store.clone()));
        let hosts = Arc::new(HostManager::new(
            config.clone(),
            credentials,
            kv.clone(),
            store.clone(),
            remote,
        ));

        Self {
            config,
            kv,
            store,
            vault,
            onboarding,
            ingest,
            builds,
            deployments,
            containers,
            hosts,
            performance,
            shutdown: CancellationToken::new(),
        }
    }
}
