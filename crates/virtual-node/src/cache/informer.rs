use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::Metadata;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ResourceCache;
use super::ResourceManager;
use crate::cluster::ClusterClient;
use crate::cluster::FeedStream;
use crate::cluster::WatchScope;

/// Feeds `cache` from `feed` until `token` is cancelled.
///
/// Feed errors are logged and skipped; the feed itself owns reconnects.
pub fn spawn_informer<K>(
    kind: &'static str,
    mut feed: FeedStream<K>,
    cache: Arc<ResourceCache<K>>,
    token: CancellationToken,
) -> JoinHandle<()>
where
    K: Metadata<Ty = ObjectMeta> + Clone + Debug + Send + Sync + 'static,
{
    tokio::spawn(async move {
        debug!(kind, "Starting informer");
        loop {
            select! {
                _ = token.cancelled() => {
                    debug!(kind, "Informer shutdown requested");
                    break;
                }
                next = feed.next() => match next {
                    Some(Ok(event)) => cache.apply(event),
                    Some(Err(e)) => warn!(kind, "Change feed error: {e:?}"),
                    None => {
                        warn!(kind, "Change feed ended");
                        break;
                    }
                }
            }
        }
    })
}

/// The six caches the agent keeps, each driven by its own informer task.
pub struct Informers {
    pub pods: Arc<ResourceCache<Pod>>,
    pub secrets: Arc<ResourceCache<Secret>>,
    pub config_maps: Arc<ResourceCache<ConfigMap>>,
    pub services: Arc<ResourceCache<Service>>,
    pub pvcs: Arc<ResourceCache<PersistentVolumeClaim>>,
    pub pvs: Arc<ResourceCache<PersistentVolume>>,
    handles: Vec<JoinHandle<()>>,
}

impl Informers {
    /// Subscribes to all feeds. Pods are restricted by `pod_scope`, the rest are unscoped.
    pub fn start(
        cluster: &dyn ClusterClient,
        pod_scope: &WatchScope,
        token: &CancellationToken,
    ) -> Self {
        let pods = Arc::new(ResourceCache::new());
        let secrets = Arc::new(ResourceCache::new());
        let config_maps = Arc::new(ResourceCache::new());
        let services = Arc::new(ResourceCache::new());
        let pvcs = Arc::new(ResourceCache::new());
        let pvs = Arc::new(ResourceCache::new());

        let handles = vec![
            spawn_informer("pods", cluster.watch_pods(pod_scope), Arc::clone(&pods), token.clone()),
            spawn_informer("secrets", cluster.watch_secrets(), Arc::clone(&secrets), token.clone()),
            spawn_informer(
                "configmaps",
                cluster.watch_config_maps(),
                Arc::clone(&config_maps),
                token.clone(),
            ),
            spawn_informer("services", cluster.watch_services(), Arc::clone(&services), token.clone()),
            spawn_informer(
                "persistentvolumeclaims",
                cluster.watch_pvcs(),
                Arc::clone(&pvcs),
                token.clone(),
            ),
            spawn_informer("persistentvolumes", cluster.watch_pvs(), Arc::clone(&pvs), token.clone()),
        ];

        Self {
            pods,
            secrets,
            config_maps,
            services,
            pvcs,
            pvs,
            handles,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.pods.is_synced()
            && self.secrets.is_synced()
            && self.config_maps.is_synced()
            && self.services.is_synced()
            && self.pvcs.is_synced()
            && self.pvs.is_synced()
    }

    /// Waits for every cache's initial listing. Returns `false` if cancelled first.
    pub async fn wait_for_sync(&self, token: &CancellationToken) -> bool {
        let all_synced = async {
            tokio::join!(
                self.pods.wait_until_synced(),
                self.secrets.wait_until_synced(),
                self.config_maps.wait_until_synced(),
                self.services.wait_until_synced(),
                self.pvcs.wait_until_synced(),
                self.pvs.wait_until_synced(),
            );
        };
        select! {
            biased;
            _ = token.cancelled() => false,
            _ = all_synced => {
                info!("Resource caches synced");
                true
            }
        }
    }

    pub fn resource_manager(&self) -> ResourceManager {
        ResourceManager::new(
            Arc::clone(&self.pods),
            Arc::clone(&self.secrets),
            Arc::clone(&self.config_maps),
            Arc::clone(&self.services),
            Arc::clone(&self.pvcs),
            Arc::clone(&self.pvs),
        )
    }

    /// Waits for the informer tasks to exit after their token was cancelled.
    pub async fn stopped(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Informer task failed: {e}");
            }
        }
    }
}
