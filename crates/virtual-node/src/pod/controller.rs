//! Pod reconciliation: cache -> provider for specs, provider -> cluster for status.

use core::error::Error;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::env::resolve_pod_env;
use super::env::EnvSources;
use super::events::EventRecorder;
use super::events::EventType;
use super::queue::WorkQueue;
use super::rate_limiter::RateLimiter;
use crate::cache::CacheEvent;
use crate::cache::ObjectKey;
use crate::cache::ResourceCache;
use crate::cluster::is_not_found;
use crate::cluster::stored_form;
use crate::cluster::PodApi;
use crate::provider::Provider;

pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub const REASON_PROVIDER_CREATE_SUCCESS: &str = "ProviderCreateSuccess";
pub const REASON_PROVIDER_CREATE_FAILED: &str = "ProviderCreateFailed";
pub const REASON_PROVIDER_UPDATE_SUCCESS: &str = "ProviderUpdateSuccess";
pub const REASON_PROVIDER_UPDATE_FAILED: &str = "ProviderUpdateFailed";
pub const REASON_PROVIDER_DELETE_SUCCESS: &str = "ProviderDeleteSuccess";
pub const REASON_PROVIDER_DELETE_FAILED: &str = "ProviderDeleteFailed";
pub const REASON_FAILED_TO_RESOLVE_ENV: &str = "FailedToResolveEnv";

#[derive(Debug, derive_more::Display)]
pub enum PodControllerError {
    #[display("invalid pod controller option: {message}")]
    InvalidOption { message: String },
    #[display("provider failed to {operation} pod {pod}")]
    Provider { operation: &'static str, pod: String },
    #[display("failed to resolve environment of pod {pod}")]
    EnvResolution { pod: String },
    #[display("failed to update status of pod {pod}")]
    StatusUpdate { pod: String },
    #[display("failed to delete pod {pod}")]
    Delete { pod: String },
}

impl Error for PodControllerError {}

pub struct PodControllerConfig {
    pub pods: Arc<dyn PodApi>,
    pub pod_cache: Arc<ResourceCache<Pod>>,
    pub recorder: EventRecorder,
    pub provider: Arc<dyn Provider>,
    pub secrets: Arc<ResourceCache<Secret>>,
    pub config_maps: Arc<ResourceCache<ConfigMap>>,
    pub services: Arc<ResourceCache<Service>>,
    pub sync_rate_limiter: Arc<dyn RateLimiter>,
    pub delete_rate_limiter: Arc<dyn RateLimiter>,
    pub status_rate_limiter: Arc<dyn RateLimiter>,
    pub status_poll_interval: Duration,
}

/// Fires once the controller is draining its queues.
#[derive(Clone)]
pub struct ReadySignal(watch::Receiver<bool>);

impl ReadySignal {
    pub fn is_ready(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves to `true` when ready, or `false` if the controller went away first.
    pub async fn fired(mut self) -> bool {
        self.0.wait_for(|ready| *ready).await.is_ok()
    }
}

#[cfg(test)]
pub(crate) fn ready_pair() -> (watch::Sender<bool>, ReadySignal) {
    let (tx, rx) = watch::channel(false);
    (tx, ReadySignal(rx))
}

struct Shared {
    pods: Arc<dyn PodApi>,
    pod_cache: Arc<ResourceCache<Pod>>,
    recorder: EventRecorder,
    provider: Arc<dyn Provider>,
    env: EnvSources,
    sync_queue: Arc<WorkQueue>,
    delete_queue: Arc<WorkQueue>,
    status_queue: Arc<WorkQueue>,
    /// Last known state of pods that left the cache, until the provider forgets them.
    tombstones: Mutex<HashMap<ObjectKey, Arc<Pod>>>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Sync,
    Delete,
    Status,
}

pub struct PodController {
    shared: Arc<Shared>,
    cache_events: broadcast::Receiver<CacheEvent<Pod>>,
    status_poll_interval: Duration,
    ready: watch::Sender<bool>,
}

impl PodController {
    pub fn new(config: PodControllerConfig) -> Result<Self, Report<PodControllerError>> {
        if config.status_poll_interval.is_zero() {
            return Err(Report::new(PodControllerError::InvalidOption {
                message: "status poll interval must be greater than zero".to_string(),
            }));
        }

        let cache_events = config.pod_cache.subscribe();
        let (ready, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                pods: config.pods,
                pod_cache: config.pod_cache,
                recorder: config.recorder,
                provider: config.provider,
                env: EnvSources {
                    secrets: config.secrets,
                    config_maps: config.config_maps,
                    services: config.services,
                },
                sync_queue: WorkQueue::new("sync-pods-from-kubernetes", config.sync_rate_limiter),
                delete_queue: WorkQueue::new("delete-pods", config.delete_rate_limiter),
                status_queue: WorkQueue::new("sync-pod-status-from-provider", config.status_rate_limiter),
                tombstones: Mutex::new(HashMap::new()),
            }),
            cache_events,
            status_poll_interval: config.status_poll_interval,
            ready,
        })
    }

    pub fn ready(&self) -> ReadySignal {
        ReadySignal(self.ready.subscribe())
    }

    /// Reconciles until `token` is cancelled, using `workers` workers per queue.
    #[tracing::instrument(skip_all, fields(workers = workers))]
    pub async fn run(
        mut self,
        token: CancellationToken,
        workers: usize,
    ) -> Result<(), Report<PodControllerError>> {
        if workers == 0 {
            return Err(Report::new(PodControllerError::InvalidOption {
                message: "pod sync workers must be greater than zero".to_string(),
            }));
        }

        select! {
            _ = token.cancelled() => return Ok(()),
            _ = self.shared.pod_cache.wait_until_synced() => {}
        }

        self.shared.delete_dangling_pods().await;
        for key in self.shared.pod_cache.keys() {
            self.shared.sync_queue.add(key);
        }

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for _ in 0..workers {
            tasks.push(tokio::spawn(Arc::clone(&self.shared).worker(Phase::Sync)));
            tasks.push(tokio::spawn(Arc::clone(&self.shared).worker(Phase::Delete)));
        }
        tasks.push(tokio::spawn(Arc::clone(&self.shared).worker(Phase::Status)));
        tasks.push(tokio::spawn(Arc::clone(&self.shared).poll_statuses(
            self.status_poll_interval,
            token.clone(),
        )));

        self.ready.send_replace(true);
        info!("Pod controller ready");

        loop {
            select! {
                biased;
                _ = token.cancelled() => break,
                event = self.cache_events.recv() => match event {
                    Ok(CacheEvent::Upserted { key }) => self.shared.sync_queue.add(key),
                    Ok(CacheEvent::Removed { key, last }) => {
                        self.shared.tombstones().insert(key.clone(), last);
                        self.shared.sync_queue.add(key);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed pod cache events, resyncing");
                        self.shared.resync();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }

        info!("Pod controller shutting down");
        self.shared.sync_queue.shut_down();
        self.shared.delete_queue.shut_down();
        self.shared.status_queue.shut_down();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Pod controller task failed: {e}");
            }
        }
        Ok(())
    }
}

fn is_terminal_phase(phase: Option<&str>) -> bool {
    matches!(phase, Some("Succeeded" | "Failed"))
}

fn is_terminal(pod: &Pod) -> bool {
    is_terminal_phase(pod.status.as_ref().and_then(|s| s.phase.as_deref()))
}

impl Shared {
    fn tombstones(&self) -> MutexGuard<'_, HashMap<ObjectKey, Arc<Pod>>> {
        self.tombstones.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self, phase: Phase) -> &Arc<WorkQueue> {
        match phase {
            Phase::Sync => &self.sync_queue,
            Phase::Delete => &self.delete_queue,
            Phase::Status => &self.status_queue,
        }
    }

    fn resync(&self) {
        for key in self.pod_cache.keys() {
            self.sync_queue.add(key);
        }
        let gone: Vec<ObjectKey> = self.tombstones().keys().cloned().collect();
        for key in gone {
            self.sync_queue.add(key);
        }
    }

    /// Cached pod, falling back to the tombstone, falling back to a bare identity.
    fn last_known(&self, key: &ObjectKey) -> Arc<Pod> {
        if let Some(pod) = self.pod_cache.get_key(key) {
            return pod;
        }
        if let Some(pod) = self.tombstones().get(key) {
            return Arc::clone(pod);
        }
        Arc::new(Pod {
            metadata: ObjectMeta {
                namespace: key.namespace.clone(),
                name: Some(key.name.clone()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    async fn worker(self: Arc<Self>, phase: Phase) {
        let queue = Arc::clone(self.queue(phase));
        while let Some(key) = queue.get().await {
            let result = match phase {
                Phase::Sync => self.sync_pod(&key).await,
                Phase::Delete => self.delete_pod(&key).await,
                Phase::Status => self.sync_status(&key).await,
            };
            match result {
                Ok(()) => queue.forget(&key),
                Err(e) => {
                    warn!(queue = queue.name(), pod = %key, requeues = queue.num_requeues(&key), "{e:?}");
                    queue.add_rate_limited(key.clone());
                }
            }
            queue.done(&key);
        }
        debug!(queue = queue.name(), "Worker stopped");
    }

    async fn poll_statuses(self: Arc<Self>, period: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    for key in self.pod_cache.keys() {
                        self.status_queue.add(key);
                    }
                }
            }
        }
    }

    /// Removes provider pods that have no counterpart in the cache.
    async fn delete_dangling_pods(&self) {
        let provider_pods = match self.provider.get_pods().await {
            Ok(pods) => pods,
            Err(e) => {
                warn!("Failed to list provider pods: {e:?}");
                return;
            }
        };
        for pod in provider_pods {
            let key = ObjectKey::of(&pod);
            if self.pod_cache.get_key(&key).is_some() {
                continue;
            }
            info!(pod = %key, "Deleting dangling pod");
            if let Err(e) = self.provider.delete_pod(&pod).await {
                if !e.current_context().is_not_found() {
                    warn!(pod = %key, "Failed to delete dangling pod: {e:?}");
                }
            }
        }
    }

    async fn sync_pod(&self, key: &ObjectKey) -> Result<(), Report<PodControllerError>> {
        let Some(pod) = self.pod_cache.get_key(key) else {
            return self.forget_removed_pod(key).await;
        };

        if pod.metadata.deletion_timestamp.is_some() {
            debug!(pod = %key, "Pod is being deleted");
            self.delete_queue.add(key.clone());
            return Ok(());
        }
        if is_terminal(&pod) {
            debug!(pod = %key, "Pod is terminal, skipping");
            return Ok(());
        }

        let resolved = match resolve_pod_env(&pod, &self.env) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.recorder.event(
                    &pod,
                    EventType::Warning,
                    REASON_FAILED_TO_RESOLVE_ENV,
                    e.current_context().to_string(),
                );
                return Err(e.change_context(PodControllerError::EnvResolution {
                    pod: key.to_string(),
                }));
            }
        };

        let existing = self
            .provider
            .get_pod(key.namespace(), &key.name)
            .await
            .change_context_lazy(|| PodControllerError::Provider {
                operation: "get",
                pod: key.to_string(),
            })?;

        match existing {
            Some(existing) if existing.spec == resolved.spec => Ok(()),
            Some(_) => match self.provider.update_pod(&resolved).await {
                Ok(()) => {
                    self.recorder.event(
                        &pod,
                        EventType::Normal,
                        REASON_PROVIDER_UPDATE_SUCCESS,
                        "Update pod in provider successfully",
                    );
                    Ok(())
                }
                Err(e) => {
                    self.recorder.event(
                        &pod,
                        EventType::Warning,
                        REASON_PROVIDER_UPDATE_FAILED,
                        e.current_context().to_string(),
                    );
                    Err(e.change_context(PodControllerError::Provider {
                        operation: "update",
                        pod: key.to_string(),
                    }))
                }
            },
            None => match self.provider.create_pod(&resolved).await {
                Ok(()) => {
                    info!(pod = %key, "Created pod in provider");
                    self.recorder.event(
                        &pod,
                        EventType::Normal,
                        REASON_PROVIDER_CREATE_SUCCESS,
                        "Create pod in provider successfully",
                    );
                    Ok(())
                }
                Err(e) => {
                    self.recorder.event(
                        &pod,
                        EventType::Warning,
                        REASON_PROVIDER_CREATE_FAILED,
                        e.current_context().to_string(),
                    );
                    Err(e.change_context(PodControllerError::Provider {
                        operation: "create",
                        pod: key.to_string(),
                    }))
                }
            },
        }
    }

    /// The pod left the cache; make sure the provider lets go of it too.
    async fn forget_removed_pod(&self, key: &ObjectKey) -> Result<(), Report<PodControllerError>> {
        let pod = self.last_known(key);
        match self.provider.delete_pod(&pod).await {
            Ok(()) => info!(pod = %key, "Deleted pod from provider"),
            Err(e) if e.current_context().is_not_found() => {}
            Err(e) => {
                return Err(e.change_context(PodControllerError::Provider {
                    operation: "delete",
                    pod: key.to_string(),
                }))
            }
        }
        self.tombstones().remove(key);
        Ok(())
    }

    async fn delete_pod(&self, key: &ObjectKey) -> Result<(), Report<PodControllerError>> {
        let pod = self.last_known(key);
        match self.provider.delete_pod(&pod).await {
            Ok(()) => self.recorder.event(
                &pod,
                EventType::Normal,
                REASON_PROVIDER_DELETE_SUCCESS,
                "Delete pod in provider successfully",
            ),
            Err(e) if e.current_context().is_not_found() => {}
            Err(e) => {
                self.recorder.event(
                    &pod,
                    EventType::Warning,
                    REASON_PROVIDER_DELETE_FAILED,
                    e.current_context().to_string(),
                );
                return Err(e.change_context(PodControllerError::Provider {
                    operation: "delete",
                    pod: key.to_string(),
                }));
            }
        }

        match self.pods.delete(key.namespace(), &key.name, Some(0)).await {
            Ok(()) => info!(pod = %key, "Deleted pod from cluster"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                return Err(e.change_context(PodControllerError::Delete {
                    pod: key.to_string(),
                }))
            }
        }
        self.tombstones().remove(key);
        Ok(())
    }

    async fn sync_status(&self, key: &ObjectKey) -> Result<(), Report<PodControllerError>> {
        let Some(cached) = self.pod_cache.get_key(key) else {
            return Ok(());
        };
        if cached.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        let status = self
            .provider
            .get_pod_status(key.namespace(), &key.name)
            .await
            .change_context_lazy(|| PodControllerError::Provider {
                operation: "get status of",
                pod: key.to_string(),
            })?;
        let Some(status) = status else {
            return Ok(());
        };
        let status =
            stored_form(&status).change_context_lazy(|| PodControllerError::StatusUpdate {
                pod: key.to_string(),
            })?;

        if cached.status.as_ref() == Some(&status) {
            // Terminal status is already recorded; the provider can let the pod go.
            if is_terminal_phase(status.phase.as_deref()) {
                info!(pod = %key, phase = ?status.phase, "Releasing terminated pod from provider");
                match self.provider.delete_pod(&cached).await {
                    Ok(()) => {}
                    Err(e) if e.current_context().is_not_found() => {}
                    Err(e) => {
                        return Err(e.change_context(PodControllerError::Provider {
                            operation: "release",
                            pod: key.to_string(),
                        }))
                    }
                }
            }
            return Ok(());
        }

        let mut updated = (*cached).clone();
        updated.status = Some(status);
        match self.pods.update_status(&updated).await {
            Ok(_) => {
                debug!(pod = %key, "Pushed pod status");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.change_context(PodControllerError::StatusUpdate {
                pod: key.to_string(),
            })),
        }
    }
}
