use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::List;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use poem::web::Query;
use serde::Deserialize;
use tracing::warn;

use crate::provider::ContainerLogOpts;
use crate::provider::Provider;
use crate::provider::ProviderError;

#[derive(Debug, Deserialize)]
pub struct ContainerLogsQuery {
    #[serde(rename = "tailLines")]
    pub tail_lines: Option<usize>,
    #[serde(default)]
    pub timestamps: bool,
}

fn provider_error(error: &ProviderError) -> poem::Error {
    let status = match error {
        ProviderError::PodNotFound { .. } => StatusCode::NOT_FOUND,
        ProviderError::NotSupported { .. } => StatusCode::NOT_IMPLEMENTED,
        ProviderError::Backend { .. } | ProviderError::InvalidConfig { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    poem::Error::from_string(error.to_string(), status)
}

#[handler]
pub fn healthz() -> &'static str {
    "ok"
}

/// Pods currently known to the provider, as a PodList.
#[handler]
pub async fn running_pods(
    provider: Data<&Arc<dyn Provider>>,
) -> poem::Result<Json<List<Pod>>> {
    let pods = provider.get_pods().await.map_err(|e| {
        warn!("Failed to list running pods: {e:?}");
        provider_error(e.current_context())
    })?;
    Ok(Json(List {
        items: pods,
        metadata: Default::default(),
    }))
}

#[handler]
pub async fn container_logs(
    Path((namespace, pod, container)): Path<(String, String, String)>,
    Query(query): Query<ContainerLogsQuery>,
    provider: Data<&Arc<dyn Provider>>,
) -> poem::Result<String> {
    let opts = ContainerLogOpts {
        tail: query.tail_lines,
        timestamps: query.timestamps,
    };
    provider
        .get_container_logs(&namespace, &pod, &container, &opts)
        .await
        .map_err(|e| {
            warn!(%namespace, %pod, %container, "Failed to get container logs: {e:?}");
            provider_error(e.current_context())
        })
}
