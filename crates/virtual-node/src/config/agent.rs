use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use k8s_openapi::api::core::v1::Taint;

use super::run::RunArgs;
use crate::cluster::ConnectionConfig;
use crate::error::AgentError;
use crate::node::controller::DEFAULT_LEASE_DURATION;
use crate::node::controller::DEFAULT_PING_INTERVAL;
use crate::node::controller::DEFAULT_STATUS_UPDATE_INTERVAL;
use crate::pod::controller::DEFAULT_STATUS_POLL_INTERVAL;
use crate::pod::RateLimiterConfig;
use crate::provider::mock::MockProvider;

pub const SUPPORTED_OPERATING_SYSTEMS: &[&str] = &["Linux", "Windows"];

pub const DEFAULT_TAINT_KEY: &str = "virtual-kubelet.io/provider";

const TAINT_EFFECTS: &[&str] = &["NoSchedule", "NoExecute", "PreferNoSchedule"];

/// Immutable settings for one orchestrator run.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub provider: String,
    pub provider_config: Option<PathBuf>,
    pub node_name: String,
    pub operating_system: String,
    /// Empty watches every namespace.
    pub namespace: String,
    pub cluster_domain: String,
    pub listen_address: String,
    pub daemon_port: u16,
    pub internal_ip: Option<String>,
    pub pod_sync_workers: usize,
    /// Zero skips the readiness wait.
    pub startup_timeout: Duration,
    pub enable_node_lease: bool,
    pub node_lease_duration: Duration,
    pub node_status_update_interval: Duration,
    pub node_ping_interval: Duration,
    pub pod_status_poll_interval: Duration,
    pub taint: TaintConfig,
    pub admin_auth: AdminAuthConfig,
    pub connection: ConnectionConfig,
    pub sync_rate_limiter: RateLimiterConfig,
    pub delete_rate_limiter: RateLimiterConfig,
    pub status_rate_limiter: RateLimiterConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: MockProvider::NAME.to_string(),
            provider_config: None,
            node_name: "virtual-kubelet".to_string(),
            operating_system: "Linux".to_string(),
            namespace: String::new(),
            cluster_domain: "cluster.local".to_string(),
            listen_address: "0.0.0.0".to_string(),
            daemon_port: 10250,
            internal_ip: None,
            pod_sync_workers: 10,
            startup_timeout: Duration::ZERO,
            enable_node_lease: true,
            node_lease_duration: DEFAULT_LEASE_DURATION,
            node_status_update_interval: DEFAULT_STATUS_UPDATE_INTERVAL,
            node_ping_interval: DEFAULT_PING_INTERVAL,
            pod_status_poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
            taint: TaintConfig {
                value: MockProvider::NAME.to_string(),
                ..TaintConfig::default()
            },
            admin_auth: AdminAuthConfig::default(),
            connection: ConnectionConfig::default(),
            sync_rate_limiter: RateLimiterConfig::default(),
            delete_rate_limiter: RateLimiterConfig::default(),
            status_rate_limiter: RateLimiterConfig::default(),
        }
    }
}

impl From<&RunArgs> for AgentConfig {
    fn from(args: &RunArgs) -> Self {
        let rate_limiter = RateLimiterConfig {
            base_delay: args.queue_base_delay,
            max_delay: args.queue_max_delay,
            qps: args.queue_qps,
            burst: args.queue_burst,
        };
        Self {
            provider: args.provider.clone(),
            provider_config: args.provider_config.clone(),
            node_name: args.node_name.clone(),
            operating_system: args.os.clone(),
            namespace: args.namespace.clone().unwrap_or_default(),
            cluster_domain: args.cluster_domain.clone(),
            listen_address: args.listen_address.clone(),
            daemon_port: args.port,
            internal_ip: args.internal_ip.clone().filter(|ip| !ip.is_empty()),
            pod_sync_workers: args.pod_sync_workers,
            startup_timeout: args.startup_timeout,
            enable_node_lease: args.enable_node_lease,
            node_lease_duration: args.node_lease_duration,
            node_status_update_interval: args.node_status_update_interval,
            node_ping_interval: args.node_ping_interval,
            pod_status_poll_interval: args.pod_status_poll_interval,
            taint: TaintConfig {
                disabled: args.disable_taint,
                key: args.taint_key.clone(),
                value: args
                    .taint_value
                    .clone()
                    .unwrap_or_else(|| args.provider.clone()),
                effect: args.taint_effect.clone(),
            },
            admin_auth: AdminAuthConfig {
                webhook_enabled: args.authentication_token_webhook,
                token_file: args.authentication_token_file.clone(),
            },
            connection: ConnectionConfig {
                kubeconfig: args.kubeconfig.clone(),
                master_uri: args.master_uri.clone(),
            },
            sync_rate_limiter: rate_limiter,
            delete_rate_limiter: rate_limiter,
            status_rate_limiter: rate_limiter,
        }
    }
}

impl AgentConfig {
    pub fn validate_operating_system(&self) -> Result<(), Report<AgentError>> {
        if SUPPORTED_OPERATING_SYSTEMS.contains(&self.operating_system.as_str()) {
            return Ok(());
        }
        Err(Report::new(AgentError::configuration(format!(
            "operating system {:?} is not supported, expected one of {}",
            self.operating_system,
            SUPPORTED_OPERATING_SYSTEMS.join(", ")
        ))))
    }

    pub fn validate_workers(&self) -> Result<(), Report<AgentError>> {
        if self.pod_sync_workers == 0 {
            return Err(Report::new(AgentError::configuration(
                "pod sync workers must be greater than 0",
            )));
        }
        Ok(())
    }

    /// Address the admin server binds to.
    pub fn admin_listen_addr(&self) -> String {
        if self.listen_address.contains(':') && !self.listen_address.starts_with('[') {
            format!("[{}]:{}", self.listen_address, self.daemon_port)
        } else {
            format!("{}:{}", self.listen_address, self.daemon_port)
        }
    }
}

/// Taint placed on the node so only tolerating pods land on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaintConfig {
    pub disabled: bool,
    pub key: String,
    pub value: String,
    pub effect: String,
}

impl Default for TaintConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            key: DEFAULT_TAINT_KEY.to_string(),
            value: String::new(),
            effect: "NoSchedule".to_string(),
        }
    }
}

impl TaintConfig {
    /// The taint to advertise, or `None` when tainting is disabled.
    pub fn to_taint(&self) -> Result<Option<Taint>, Report<AgentError>> {
        if self.disabled {
            return Ok(None);
        }
        if self.key.is_empty() {
            return Err(Report::new(AgentError::configuration("taint key must not be empty")));
        }
        if !TAINT_EFFECTS.contains(&self.effect.as_str()) {
            return Err(Report::new(AgentError::configuration(format!(
                "taint effect {:?} is not supported, expected one of {}",
                self.effect,
                TAINT_EFFECTS.join(", ")
            ))));
        }
        Ok(Some(Taint {
            key: self.key.clone(),
            value: Some(self.value.clone()).filter(|v| !v.is_empty()),
            effect: self.effect.clone(),
            time_added: None,
        }))
    }
}

/// Bearer token protection for the admin server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminAuthConfig {
    pub webhook_enabled: bool,
    pub token_file: Option<PathBuf>,
}
