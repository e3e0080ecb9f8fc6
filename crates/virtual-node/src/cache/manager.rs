use std::sync::Arc;

use error_stack::Report;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::core::v1::Service;

use super::ResourceCache;
use crate::cluster::ClusterError;

/// Object kinds served by the [`ResourceManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ResourceKind {
    Pod,
    Secret,
    ConfigMap,
    Service,
    PersistentVolumeClaim,
    PersistentVolume,
}

impl ResourceKind {
    fn name(self) -> &'static str {
        match self {
            Self::Pod => "Pod",
            Self::Secret => "Secret",
            Self::ConfigMap => "ConfigMap",
            Self::Service => "Service",
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
            Self::PersistentVolume => "PersistentVolume",
        }
    }
}

/// A cached object of any served kind.
#[derive(Debug, Clone)]
pub enum CachedObject {
    Pod(Arc<Pod>),
    Secret(Arc<Secret>),
    ConfigMap(Arc<ConfigMap>),
    Service(Arc<Service>),
    PersistentVolumeClaim(Arc<PersistentVolumeClaim>),
    PersistentVolume(Arc<PersistentVolume>),
}

impl CachedObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Pod(_) => ResourceKind::Pod,
            Self::Secret(_) => ResourceKind::Secret,
            Self::ConfigMap(_) => ResourceKind::ConfigMap,
            Self::Service(_) => ResourceKind::Service,
            Self::PersistentVolumeClaim(_) => ResourceKind::PersistentVolumeClaim,
            Self::PersistentVolume(_) => ResourceKind::PersistentVolume,
        }
    }
}

/// Read-only facade over the six caches.
///
/// Handed to the provider and the pod controller. Cloning is cheap and every
/// clone reads the same caches.
#[derive(Clone)]
pub struct ResourceManager {
    pods: Arc<ResourceCache<Pod>>,
    secrets: Arc<ResourceCache<Secret>>,
    config_maps: Arc<ResourceCache<ConfigMap>>,
    services: Arc<ResourceCache<Service>>,
    pvcs: Arc<ResourceCache<PersistentVolumeClaim>>,
    pvs: Arc<ResourceCache<PersistentVolume>>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("pods", &self.pods.len())
            .field("secrets", &self.secrets.len())
            .field("config_maps", &self.config_maps.len())
            .field("services", &self.services.len())
            .field("pvcs", &self.pvcs.len())
            .field("pvs", &self.pvs.len())
            .finish()
    }
}

impl ResourceManager {
    pub fn new(
        pods: Arc<ResourceCache<Pod>>,
        secrets: Arc<ResourceCache<Secret>>,
        config_maps: Arc<ResourceCache<ConfigMap>>,
        services: Arc<ResourceCache<Service>>,
        pvcs: Arc<ResourceCache<PersistentVolumeClaim>>,
        pvs: Arc<ResourceCache<PersistentVolume>>,
    ) -> Self {
        Self {
            pods,
            secrets,
            config_maps,
            services,
            pvcs,
            pvs,
        }
    }

    pub fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.pods.get(namespace, name)
    }

    pub fn list_pods(&self) -> Vec<Arc<Pod>> {
        self.pods.list(None)
    }

    pub fn get_secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>> {
        self.secrets.get(namespace, name)
    }

    pub fn get_config_map(&self, namespace: &str, name: &str) -> Option<Arc<ConfigMap>> {
        self.config_maps.get(namespace, name)
    }

    pub fn get_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services.get(namespace, name)
    }

    pub fn list_services(&self, namespace: &str) -> Vec<Arc<Service>> {
        self.services.list(Some(namespace))
    }

    pub fn get_pvc(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>> {
        self.pvcs.get(namespace, name)
    }

    pub fn get_pv(&self, name: &str) -> Option<Arc<PersistentVolume>> {
        self.pvs.get("", name)
    }

    /// Looks up one object. Cluster-scoped kinds ignore `namespace`.
    pub fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<CachedObject, Report<ClusterError>> {
        let found = match kind {
            ResourceKind::Pod => self.get_pod(namespace, name).map(CachedObject::Pod),
            ResourceKind::Secret => self.get_secret(namespace, name).map(CachedObject::Secret),
            ResourceKind::ConfigMap => self
                .get_config_map(namespace, name)
                .map(CachedObject::ConfigMap),
            ResourceKind::Service => self.get_service(namespace, name).map(CachedObject::Service),
            ResourceKind::PersistentVolumeClaim => self
                .get_pvc(namespace, name)
                .map(CachedObject::PersistentVolumeClaim),
            ResourceKind::PersistentVolume => {
                self.get_pv(name).map(CachedObject::PersistentVolume)
            }
        };
        found.ok_or_else(|| {
            let name = match kind {
                ResourceKind::PersistentVolume => name.to_string(),
                _ => format!("{namespace}/{name}"),
            };
            Report::new(ClusterError::not_found(kind.name(), name))
        })
    }

    /// Lists objects of `kind` in `namespace`, or in all namespaces when `None`.
    pub fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> Vec<CachedObject> {
        match kind {
            ResourceKind::Pod => wrap(self.pods.list(namespace), CachedObject::Pod),
            ResourceKind::Secret => wrap(self.secrets.list(namespace), CachedObject::Secret),
            ResourceKind::ConfigMap => {
                wrap(self.config_maps.list(namespace), CachedObject::ConfigMap)
            }
            ResourceKind::Service => wrap(self.services.list(namespace), CachedObject::Service),
            ResourceKind::PersistentVolumeClaim => wrap(
                self.pvcs.list(namespace),
                CachedObject::PersistentVolumeClaim,
            ),
            ResourceKind::PersistentVolume => {
                wrap(self.pvs.list(None), CachedObject::PersistentVolume)
            }
        }
    }
}

fn wrap<K>(objects: Vec<Arc<K>>, f: fn(Arc<K>) -> CachedObject) -> Vec<CachedObject> {
    objects.into_iter().map(f).collect()
}
