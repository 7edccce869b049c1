use anyhow::{Context, Result};
use std::fmt;
use std::time::Duration;

use crate::commands;

// Success is judged by an empty stderr, so every step that reports progress on stderr
// is quietened or has it folded into stdout.
pub const DEFAULT_INSTALL_COMMAND: &str =
    "(command -v docker >/dev/null 2>&1 || curl -fsSL https://get.docker.com | sh 2>&1) && docker pull -q fleet/agent:latest && (docker rm -f fleet-agent >/dev/null 2>&1 || true) && docker run -d --restart=always --name fleet-agent --net=host -v /var/run/docker.sock:/var/run/docker.sock -e FLEET_PUBLIC_IP={public_ip} fleet/agent:latest";
pub const DEFAULT_UNINSTALL_COMMAND: &str = "docker rm -f fleet-agent";
pub const DEFAULT_BUILD_COMMAND: &str =
    "workdir=$(mktemp -d) && git clone -q --depth 1 --branch {branch} {repo_url} \"$workdir\" && docker build -q -t {image_tag} \"$workdir\"; status=$?; rm -rf \"$workdir\"; exit $status";
pub const DEFAULT_DEPLOY_COMMAND: &str =
    "docker pull -q {image_name} && (docker rm -f {container_name} >/dev/null 2>&1 || true) && docker run -d --restart=always --name {container_name} {image_name}";

const MAX_SSH_WORKERS: usize = 64;

/// Remote command templates. `{name}` placeholders are filled with shell-quoted values.
#[derive(Debug, Clone)]
pub struct CommandTemplates {
    pub install: String,
    pub uninstall: String,
    pub build: String,
    pub deploy: String,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            install: DEFAULT_INSTALL_COMMAND.to_string(),
            uninstall: DEFAULT_UNINSTALL_COMMAND.to_string(),
            build: DEFAULT_BUILD_COMMAND.to_string(),
            deploy: DEFAULT_DEPLOY_COMMAND.to_string(),
        }
    }
}

impl CommandTemplates {
    /// Each template may only reference the placeholders its caller supplies.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, &str, &[&str]); 4] = [
            ("FLEET_INSTALL_COMMAND", self.install.as_str(), &["public_ip"]),
            ("FLEET_UNINSTALL_COMMAND", self.uninstall.as_str(), &["public_ip"]),
            (
                "FLEET_BUILD_COMMAND",
                self.build.as_str(),
                &["repo_url", "branch", "version", "image_name", "image_tag"],
            ),
            (
                "FLEET_DEPLOY_COMMAND",
                self.deploy.as_str(),
                &["image_name", "container_name", "public_ip"],
            ),
        ];
        for (key, template, allowed) in checks {
            for name in commands::placeholders(template) {
                if !allowed.contains(&name.as_str()) {
                    anyhow::bail!(
                        "{key} references unknown placeholder {{{name}}} (allowed: {})",
                        allowed.join(", ")
                    );
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct FleetConfig {
    pub database_url: String,
    pub vault_key: String,
    /// Public IP of the host that builds images; must itself be an onboarded server.
    pub build_host: Option<String>,
    pub ssh_port: u16,
    pub ssh_workers: usize,
    pub ssh_timeout: Duration,
    pub build_timeout: Duration,
    pub onboarding_poll_interval: Duration,
    pub deploy_job_timeout: Duration,
    pub console_repeat: u32,
    pub console_interval: Duration,
    pub commands: CommandTemplates,
}

impl fmt::Debug for FleetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetConfig")
            .field("database_url", &redact_url(&self.database_url))
            .field("vault_key", &"<redacted>")
            .field("build_host", &self.build_host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_workers", &self.ssh_workers)
            .field("ssh_timeout", &self.ssh_timeout)
            .field("build_timeout", &self.build_timeout)
            .field("onboarding_poll_interval", &self.onboarding_poll_interval)
            .field("deploy_job_timeout", &self.deploy_job_timeout)
            .field("console_repeat", &self.console_repeat)
            .field("console_interval", &self.console_interval)
            .field("commands", &self.commands)
            .finish()
    }
}

fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://<redacted>{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

impl FleetConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env_optional_string("FLEET_DATABASE_URL")
            .context("FLEET_DATABASE_URL must be set")?;
        let vault_key =
            env_optional_string("FLEET_VAULT_KEY").context("FLEET_VAULT_KEY must be set")?;

        let config = Self {
            database_url,
            vault_key,
            build_host: env_optional_string("FLEET_BUILD_HOST"),
            ssh_port: env_u16("FLEET_SSH_PORT", 22),
            ssh_workers: (env_u64("FLEET_SSH_WORKERS", 8) as usize).clamp(1, MAX_SSH_WORKERS),
            ssh_timeout: Duration::from_secs(env_u64("FLEET_SSH_TIMEOUT_SECONDS", 120).max(1)),
            build_timeout: Duration::from_secs(
                env_u64("FLEET_BUILD_TIMEOUT_SECONDS", 1800).max(1),
            ),
            onboarding_poll_interval: Duration::from_millis(
                env_u64("FLEET_ONBOARDING_POLL_INTERVAL_MS", 3000).max(100),
            ),
            deploy_job_timeout: Duration::from_secs(
                env_u64("FLEET_DEPLOY_JOB_TIMEOUT_SECONDS", 900).max(1),
            ),
            console_repeat: env_u32("FLEET_CONSOLE_REPEAT", 30).max(1),
            console_interval: Duration::from_secs(env_u64("FLEET_CONSOLE_INTERVAL_SECONDS", 2)),
            commands: CommandTemplates {
                install: env_string("FLEET_INSTALL_COMMAND", DEFAULT_INSTALL_COMMAND),
                uninstall: env_string("FLEET_UNINSTALL_COMMAND", DEFAULT_UNINSTALL_COMMAND),
                build: env_string("FLEET_BUILD_COMMAND", DEFAULT_BUILD_COMMAND),
                deploy: env_string("FLEET_DEPLOY_COMMAND", DEFAULT_DEPLOY_COMMAND),
            },
        };
        config.commands.validate()?;
        Ok(config)
    }
}

fn env_string(key: &str, default: &str) -> String {
    env_optional_string(key).unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
