use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;
use tracing::debug;

use super::ClusterError;

/// Where to find the control plane.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// Kubeconfig file. Ignored when the file does not exist.
    pub kubeconfig: Option<PathBuf>,
    /// Overrides the API server address from either source.
    pub master_uri: Option<String>,
}

pub async fn init_kube_client(
    connection: &ConnectionConfig,
) -> Result<Client, Report<ClusterError>> {
    let existing_kubeconfig = connection
        .kubeconfig
        .as_ref()
        .filter(|path| path.exists());

    let mut config = match existing_kubeconfig {
        Some(kubeconfig_path) => {
            debug!(path = %kubeconfig_path.display(), "Loading kubeconfig");
            let kubeconfig = Kubeconfig::read_from(kubeconfig_path).change_context(
                ClusterError::ConnectionFailed {
                    message: format!(
                        "Failed to read kubeconfig file: {}",
                        kubeconfig_path.display()
                    ),
                },
            )?;

            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context(ClusterError::ConnectionFailed {
                    message: format!(
                        "Failed to create config from kubeconfig: {}",
                        kubeconfig_path.display()
                    ),
                })?
        }
        None => {
            debug!("No kubeconfig found, using in-cluster configuration");
            Config::incluster().change_context(ClusterError::ConnectionFailed {
                message: "Failed to load in-cluster configuration".to_string(),
            })?
        }
    };

    if let Some(master) = connection.master_uri.as_deref().filter(|m| !m.is_empty()) {
        let cluster_url = master.parse().map_err(|e| {
            Report::new(ClusterError::ConnectionFailed {
                message: format!("Invalid master URI {master}: {e}"),
            })
        })?;
        config.cluster_url = cluster_url;
    }

    Client::try_from(config).change_context(ClusterError::ConnectionFailed {
        message: "Failed to create Kubernetes client".to_string(),
    })
}
