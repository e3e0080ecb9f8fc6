use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
pub struct RunArgs {
    #[arg(
        long,
        env = "VKUBELET_PROVIDER",
        default_value = "mock",
        help = "Provider backing the node, see the providers subcommand for the available names"
    )]
    pub provider: String,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Provider specific configuration file"
    )]
    pub provider_config: Option<PathBuf>,

    #[arg(
        long,
        env = "VKUBELET_NODE_NAME",
        default_value = "virtual-kubelet",
        help = "Name of the node registered in the cluster"
    )]
    pub node_name: String,

    #[arg(
        long,
        default_value = "Linux",
        help = "Operating system advertised by the node, either 'Linux' or 'Windows'"
    )]
    pub os: String,

    #[arg(
        long,
        help = "Only watch pods in this namespace (empty for all namespaces)"
    )]
    pub namespace: Option<String>,

    #[arg(
        long,
        default_value = "cluster.local",
        help = "Cluster DNS domain handed to the provider"
    )]
    pub cluster_domain: String,

    #[arg(
        long,
        env = "VKUBELET_LISTEN_ADDRESS",
        default_value = "0.0.0.0",
        help = "Address the admin HTTP server binds to"
    )]
    pub listen_address: String,

    #[arg(
        long,
        env = "KUBELET_PORT",
        default_value = "10250",
        help = "Port of the admin HTTP server, also advertised as the kubelet endpoint"
    )]
    pub port: u16,

    #[arg(
        long,
        default_value = "10",
        help = "Number of workers draining each pod queue"
    )]
    pub pod_sync_workers: usize,

    #[arg(
        long,
        default_value = "0",
        value_parser = parse_duration,
        help = "How long to wait for the pod controller to become ready before the node is advertised, 0 disables the wait"
    )]
    pub startup_timeout: Duration,

    #[arg(
        long,
        help = "Keep a heartbeat lease for the node",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_node_lease: bool,

    #[arg(
        long,
        default_value = "40s",
        value_parser = parse_duration,
        help = "Duration of the node heartbeat lease"
    )]
    pub node_lease_duration: Duration,

    #[arg(
        long,
        default_value = "60s",
        value_parser = parse_duration,
        help = "Interval between full node status updates while a lease is held"
    )]
    pub node_status_update_interval: Duration,

    #[arg(
        long,
        default_value = "10s",
        value_parser = parse_duration,
        help = "Interval between provider health checks"
    )]
    pub node_ping_interval: Duration,

    #[arg(
        long,
        default_value = "5s",
        value_parser = parse_duration,
        help = "Interval between pod status polls against the provider"
    )]
    pub pod_status_poll_interval: Duration,

    #[arg(
        long,
        help = "Register the node without the provider taint",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub disable_taint: bool,

    #[arg(
        long,
        env = "VKUBELET_TAINT_KEY",
        default_value = "virtual-kubelet.io/provider",
        help = "Key of the taint placed on the node"
    )]
    pub taint_key: String,

    #[arg(
        long,
        env = "VKUBELET_TAINT_VALUE",
        help = "Value of the taint placed on the node (defaults to the provider name)"
    )]
    pub taint_value: Option<String>,

    #[arg(
        long,
        env = "VKUBELET_TAINT_EFFECT",
        default_value = "NoSchedule",
        help = "Effect of the taint, one of 'NoSchedule', 'NoExecute' or 'PreferNoSchedule'"
    )]
    pub taint_effect: String,

    #[arg(
        long,
        env = "VKUBELET_POD_IP",
        help = "Internal IP address advertised by the node"
    )]
    pub internal_ip: Option<String>,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (in-cluster configuration is used when it does not exist)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "MASTER_URI",
        help = "Overrides the API server address"
    )]
    pub master_uri: Option<String>,

    #[arg(
        long,
        help = "Require a bearer token on admin HTTP requests",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub authentication_token_webhook: bool,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "File holding the bearer token expected by the admin HTTP server"
    )]
    pub authentication_token_file: Option<PathBuf>,

    #[arg(
        long,
        default_value = "5ms",
        value_parser = parse_duration,
        help = "Initial per-pod retry delay of the pod queues"
    )]
    pub queue_base_delay: Duration,

    #[arg(
        long,
        default_value = "1000s",
        value_parser = parse_duration,
        help = "Maximum per-pod retry delay of the pod queues"
    )]
    pub queue_max_delay: Duration,

    #[arg(
        long,
        default_value = "10",
        help = "Sustained retries per second across each pod queue"
    )]
    pub queue_qps: f64,

    #[arg(
        long,
        default_value = "100",
        help = "Retry burst allowed across each pod queue"
    )]
    pub queue_burst: u32,

    #[arg(
        long,
        env = utils::logging::LOG_PATH_ENV_VAR,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory receiving a daily rotated copy of the logs"
    )]
    pub log_dir: Option<PathBuf>,
}

/// Parses `1h`, `2m`, `40s`, `500ms` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    let value: f64 = value
        .parse()
        .map_err(|e| format!("invalid duration '{s}': {e}"))?;
    let seconds = match unit {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("invalid duration unit '{other}' in '{s}'")),
    };
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration '{s}': {e}"))
}
