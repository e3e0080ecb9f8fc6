use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::NodeSpec;
use k8s_openapi::api::core::v1::NodeStatus;
use k8s_openapi::api::core::v1::NodeSystemInfo;
use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::provider::Provider;

const NODE_ARCHITECTURE: &str = "amd64";

/// Builds the node object this agent registers.
///
/// Identity comes from the arguments; capacity, conditions and addresses
/// come from [`Provider::configure_node`], which runs last.
pub fn node_from_provider(
    name: &str,
    taint: Option<Taint>,
    provider: &dyn Provider,
    kubelet_version: &str,
    operating_system: &str,
) -> Node {
    let labels = BTreeMap::from([
        ("type".to_string(), "virtual-kubelet".to_string()),
        ("kubernetes.io/role".to_string(), "agent".to_string()),
        ("kubernetes.io/hostname".to_string(), name.to_string()),
        ("kubernetes.io/os".to_string(), operating_system.to_lowercase()),
    ]);

    let mut node = Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: taint.map(|t| vec![t]),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            node_info: Some(NodeSystemInfo {
                architecture: NODE_ARCHITECTURE.to_string(),
                kubelet_version: kubelet_version.to_string(),
                operating_system: operating_system.to_lowercase(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    };

    provider.configure_node(&mut node);
    node
}
