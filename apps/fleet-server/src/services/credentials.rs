use anyhow::Context;
use std::sync::Arc;

use crate::error::{FleetError, FleetResult};
use crate::models::ServerRecord;
use crate::remote::SshLogin;
use crate::store::FleetStore;
use crate::vault::CredentialVault;

/// Turns a host identity into a usable SSH login. Passwords are unsealed per call and
/// never cached.
#[derive(Clone)]
pub struct CredentialResolver {
    store: Arc<dyn FleetStore>,
    vault: CredentialVault,
    ssh_port: u16,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn FleetStore>, vault: CredentialVault, ssh_port: u16) -> Self {
        Self {
            store,
            vault,
            ssh_port,
        }
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    pub async fn login_for_ip(&self, public_ip: &str) -> FleetResult<SshLogin> {
        let account = self
            .store
            .find_account(public_ip)
            .await?
            .ok_or_else(|| FleetError::not_found(format!("no SSH account recorded for {public_ip}")))?;
        let password = self
            .vault
            .decrypt(&account.encrypted_password)
            .with_context(|| format!("failed to unseal SSH password for {public_ip}"))?;
        Ok(SshLogin {
            host: account.public_ip,
            port: self.ssh_port,
            username: account.username,
            password,
        })
    }

    pub async fn login_for_server(&self, server_id: i64) -> FleetResult<(ServerRecord, SshLogin)> {
        let server = self
            .store
            .find_server(server_id)
            .await?
            .ok_or_else(|| FleetError::not_found(format!("server {server_id} not found")))?;
        let login = self.login_for_ip(&server.public_ip).await?;
        Ok((server, login))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewServer;
    use crate::test_support::{test_vault, MemoryStore};

    #[tokio::test]
    async fn resolves_and_unseals_login() {
        let store = Arc::new(MemoryStore::default());
        let vault = test_vault();
        let record = store
            .register_server(&NewServer {
                name: "web-1".to_string(),
                public_ip: "10.0.0.7".to_string(),
                cluster_id: 1,
                username: "deploy".to_string(),
                encrypted_password: vault.encrypt("hunter2").unwrap(),
            })
            .await
            .unwrap()
            .unwrap();

        let resolver = CredentialResolver::new(store, vault, 2222);
        let (server, login) = resolver.login_for_server(record.id).await.unwrap();
        assert_eq!(server.public_ip, "10.0.0.7");
        assert_eq!(login.host, "10.0.0.7");
        assert_eq!(login.port, 2222);
        assert_eq!(login.username, "deploy");
        assert_eq!(login.password, "hunter2");
    }

    #[tokio::test]
    async fn missing_account_is_not_found() {
        let resolver =
            CredentialResolver::new(Arc::new(MemoryStore::default()), test_vault(), 22);
        let err = resolver.login_for_ip("10.9.9.9").await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }

    #[tokio::test]
    async fn undecryptable_password_is_internal() {
        let store = Arc::new(MemoryStore::default());
        store
            .register_server(&NewServer {
                name: "web-2".to_string(),
                public_ip: "10.0.0.8".to_string(),
                cluster_id: 1,
                username: "root".to_string(),
                encrypted_password: "deadbeef".to_string(),
            })
            .await
            .unwrap();
        let resolver = CredentialResolver::new(store, test_vault(), 22);
        let err = resolver.login_for_ip("10.0.0.8").await.unwrap_err();
        assert!(matches!(err, FleetError::Internal(_)));
    }
}
