use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use error_stack::Report;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::coordination::v1::LeaseSpec;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::debug;
use tracing::info;

use crate::cluster::is_not_found;
use crate::cluster::ClusterError;
use crate::cluster::LeaseApi;
use crate::cluster::NODE_LEASE_NAMESPACE;

/// Heartbeat lease for `node`, owned by the node object when its UID is known.
pub fn new_lease(node: &Node, duration: Duration) -> Lease {
    let name = node.metadata.name.clone().unwrap_or_default();
    let owner_references = node.metadata.uid.as_ref().map(|uid| {
        vec![OwnerReference {
            api_version: "v1".to_string(),
            kind: "Node".to_string(),
            name: name.clone(),
            uid: uid.clone(),
            ..Default::default()
        }]
    });

    Lease {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(NODE_LEASE_NAMESPACE.to_string()),
            owner_references,
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(name),
            lease_duration_seconds: Some(i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)),
            renew_time: Some(MicroTime(Utc::now())),
            ..Default::default()
        }),
    }
}

/// Keeps one node lease alive.
pub struct LeaseKeeper {
    client: Arc<dyn LeaseApi>,
    duration: Duration,
    current: Option<Lease>,
}

impl LeaseKeeper {
    pub fn new(client: Arc<dyn LeaseApi>, duration: Duration) -> Self {
        Self {
            client,
            duration,
            current: None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Renewal cadence: a quarter of the lease duration.
    pub fn renew_interval(&self) -> Duration {
        (self.duration / 4).max(Duration::from_millis(1))
    }

    /// Fetches the existing lease for `node` or creates a new one.
    pub async fn ensure(&mut self, node: &Node) -> Result<(), Report<ClusterError>> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let lease = match self.client.get(name).await {
            Ok(mut existing) => {
                let fresh = new_lease(node, self.duration);
                existing.spec = fresh.spec;
                self.client.update(&existing).await?
            }
            Err(e) if is_not_found(&e) => {
                info!(node = %name, "Creating node lease");
                self.client.create(&new_lease(node, self.duration)).await?
            }
            Err(e) => return Err(e),
        };
        self.current = Some(lease);
        Ok(())
    }

    /// Bumps the renew time, recreating the lease if it disappeared.
    pub async fn renew(&mut self, node: &Node) -> Result<(), Report<ClusterError>> {
        let Some(mut lease) = self.current.take() else {
            return self.ensure(node).await;
        };
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        spec.renew_time = Some(MicroTime(Utc::now()));

        match self.client.update(&lease).await {
            Ok(updated) => {
                debug!(node = ?node.metadata.name, "Renewed node lease");
                self.current = Some(updated);
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                info!(node = ?node.metadata.name, "Node lease disappeared, recreating");
                self.ensure(node).await
            }
            Err(e) => {
                self.current = Some(lease);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::ClusterClient;

    fn node() -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("vk".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn lease_is_owned_by_node() {
        let lease = new_lease(&node(), Duration::from_secs(40));
        assert_eq!(lease.metadata.namespace.as_deref(), Some("kube-node-lease"));
        let owner = &lease.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "Node");
        assert_eq!(owner.uid, "uid-1");
        let spec = lease.spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("vk"));
        assert_eq!(spec.lease_duration_seconds, Some(40));
    }

    #[test(tokio::test)]
    async fn renew_recreates_deleted_lease() {
        let cluster = FakeCluster::new();
        let mut keeper = LeaseKeeper::new(cluster.leases(), Duration::from_secs(40));
        assert_eq!(keeper.renew_interval(), Duration::from_secs(10));

        keeper.ensure(&node()).await.unwrap();
        assert!(cluster.lease("vk").is_some());
        keeper.renew(&node()).await.unwrap();
        assert_eq!(cluster.calls.count("leases.update"), 1);

        cluster.leases.remove(NODE_LEASE_NAMESPACE, "vk");
        keeper.renew(&node()).await.unwrap();
        assert!(cluster.lease("vk").is_some());
        assert_eq!(cluster.calls.count("leases.create"), 2);
    }
}
