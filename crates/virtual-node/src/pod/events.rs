//! Kubernetes events about pods, recorded asynchronously.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::core::v1::EventSource;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::cluster::EventSink;

const EVENT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum EventType {
    Normal,
    Warning,
}

/// Owns the background task that writes events to the cluster.
pub struct EventBroadcaster {
    sender: mpsc::Sender<Event>,
    handle: JoinHandle<()>,
}

impl EventBroadcaster {
    pub fn start(sink: Arc<dyn EventSink>, token: CancellationToken) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Event>(EVENT_QUEUE_CAPACITY);
        let handle = tokio::spawn(async move {
            loop {
                select! {
                    _ = token.cancelled() => break,
                    event = receiver.recv() => {
                        let Some(event) = event else { break };
                        if let Err(e) = sink.create_event(&event).await {
                            warn!(reason = ?event.reason, "Failed to record event: {e:?}");
                        }
                    }
                }
            }
        });
        Self { sender, handle }
    }

    /// Recorder stamping events with `component` as their source.
    pub fn new_recorder(&self, component: impl Into<String>, host: impl Into<String>) -> EventRecorder {
        EventRecorder {
            sender: self.sender.clone(),
            component: component.into(),
            host: host.into(),
        }
    }

    pub async fn stopped(self) {
        drop(self.sender);
        if let Err(e) = self.handle.await {
            warn!("Event broadcaster task failed: {e}");
        }
    }
}

#[derive(Clone)]
pub struct EventRecorder {
    sender: mpsc::Sender<Event>,
    component: String,
    host: String,
}

impl EventRecorder {
    /// Queues an event about `pod`. Never blocks; drops the event if the queue is full.
    pub fn event(&self, pod: &Pod, event_type: EventType, reason: &str, message: impl Into<String>) {
        let message = message.into();
        let namespace = pod.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        let name = pod.metadata.name.clone().unwrap_or_default();
        info!(
            %namespace,
            pod = %name,
            event_type = %event_type,
            reason,
            "{message}"
        );

        let now = Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                name: Some(format!(
                    "{name}.{:x}",
                    now.timestamp_nanos_opt().unwrap_or_default()
                )),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Pod".to_string()),
                namespace: Some(namespace),
                name: Some(name),
                uid: pod.metadata.uid.clone(),
                resource_version: pod.metadata.resource_version.clone(),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message),
            type_: Some(event_type.to_string()),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                host: Some(self.host.clone()),
            }),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            count: Some(1),
            reporting_component: Some(self.component.clone()),
            reporting_instance: Some(self.host.clone()),
            ..Default::default()
        };

        if let Err(e) = self.sender.try_send(event) {
            warn!("Dropping event: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::ClusterClient;

    #[test(tokio::test)]
    async fn recorded_events_reach_the_sink() {
        let cluster = FakeCluster::new();
        let token = CancellationToken::new();
        let broadcaster = EventBroadcaster::start(cluster.events(), token.clone());
        let recorder = broadcaster.new_recorder("vk/pod-controller", "vk");

        let pod = Pod {
            metadata: ObjectMeta {
                namespace: Some("team".to_string()),
                name: Some("web".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        recorder.event(&pod, EventType::Warning, "ProviderCreateFailed", "boom");

        tokio::time::timeout(Duration::from_secs(1), async {
            while cluster.recorded_events().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let event = &cluster.recorded_events()[0];
        assert_eq!(event.metadata.namespace.as_deref(), Some("team"));
        assert_eq!(event.involved_object.name.as_deref(), Some("web"));
        assert_eq!(event.type_.as_deref(), Some("Warning"));
        assert_eq!(event.reason.as_deref(), Some("ProviderCreateFailed"));
        assert_eq!(
            event.source.as_ref().unwrap().component.as_deref(),
            Some("vk/pod-controller")
        );

        token.cancel();
        broadcaster.stopped().await;
    }
}
