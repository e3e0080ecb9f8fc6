use std::sync::Arc;

use error_stack::Report;
use futures::FutureExt;
use k8s_openapi::api::core::v1::Node;
use tracing::info;

use crate::cluster::is_not_found;
use crate::cluster::ClusterError;
use crate::cluster::NodeApi;
use crate::node::StatusUpdateErrorHandler;

/// Status push error handler that re-registers a node deleted out of band.
///
/// A `NotFound` push is answered with a create of the same node, minus its
/// resource version, and swallowed. Every other error is handed back untouched.
pub fn recreate_missing_node(nodes: Arc<dyn NodeApi>) -> StatusUpdateErrorHandler {
    Arc::new(move |mut node: Node, err: Report<ClusterError>| {
        let nodes = Arc::clone(&nodes);
        async move {
            if !is_not_found(&err) {
                return Err(err);
            }
            node.metadata.resource_version = None;
            node.metadata.uid = None;
            let name = node.metadata.name.clone().unwrap_or_default();
            match nodes.create(&node).await {
                Ok(created) => {
                    info!(node = %name, uid = ?created.metadata.uid, "Node was deleted from the cluster, re-created it");
                    Ok(Some(created))
                }
                Err(create_err) => Err(create_err.attach_printable(format!(
                    "re-creating node {name} after the status update failed with: {}",
                    err.current_context()
                ))),
            }
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::ClusterClient;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test(tokio::test)]
    async fn not_found_is_answered_with_create() {
        let cluster = FakeCluster::new();
        let handler = recreate_missing_node(cluster.nodes());

        let created = handler(node("vk"), Report::new(ClusterError::not_found("node", "vk")))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(cluster.calls.count("nodes.create"), 1);
        let stored = cluster.node("vk").unwrap();
        assert_eq!(created.metadata.uid, stored.metadata.uid);
        assert!(created.metadata.uid.is_some());
    }

    #[test(tokio::test)]
    async fn other_errors_pass_through() {
        let cluster = FakeCluster::new();
        let handler = recreate_missing_node(cluster.nodes());

        let err = handler(
            node("vk"),
            Report::new(ClusterError::Api {
                message: "etcd unavailable".to_string(),
            }),
        )
        .await
        .unwrap_err();

        assert!(matches!(err.current_context(), ClusterError::Api { .. }));
        assert_eq!(cluster.calls.total(), 0);
    }

    #[test(tokio::test)]
    async fn failed_create_is_reported() {
        let cluster = FakeCluster::new();
        cluster.nodes.apply(node("vk"));
        let handler = recreate_missing_node(cluster.nodes());

        let err = handler(node("vk"), Report::new(ClusterError::not_found("node", "vk")))
            .await
            .unwrap_err();

        assert!(err.current_context().is_already_exists());
    }
}
