//! Resolves container environment references against the caches.
//!
//! Backends receive pods whose `env` entries are all literal values:
//! `valueFrom`, `envFrom` and service link variables are expanded here.

use core::error::Error;
use std::collections::HashMap;
use std::sync::Arc;

use error_stack::Report;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::ByteString;

use crate::cache::ResourceCache;

const MASTER_SERVICE_NAMESPACE: &str = "default";
const MASTER_SERVICE_NAME: &str = "kubernetes";

#[derive(Debug, derive_more::Display)]
pub enum EnvError {
    #[display("{kind} {namespace}/{name} not found")]
    MissingObject {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[display("key {key} not found in {kind} {namespace}/{name}")]
    MissingKey {
        kind: &'static str,
        namespace: String,
        name: String,
        key: String,
    },
    #[display("unsupported field path {path}")]
    UnsupportedFieldPath { path: String },
}

impl Error for EnvError {}

/// Caches consulted while resolving environment references.
#[derive(Clone)]
pub struct EnvSources {
    pub secrets: Arc<ResourceCache<Secret>>,
    pub config_maps: Arc<ResourceCache<ConfigMap>>,
    pub services: Arc<ResourceCache<Service>>,
}

/// Ordered variable set where a later write replaces an earlier one in place.
#[derive(Default)]
struct EnvSet {
    vars: Vec<EnvVar>,
    index: HashMap<String, usize>,
}

impl EnvSet {
    fn set(&mut self, name: String, value: String) {
        let var = EnvVar {
            name: name.clone(),
            value: Some(value),
            value_from: None,
        };
        match self.index.get(&name) {
            Some(&position) => self.vars[position] = var,
            None => {
                self.index.insert(name, self.vars.len());
                self.vars.push(var);
            }
        }
    }
}

/// Returns a copy of `pod` with every container's environment resolved.
pub fn resolve_pod_env(pod: &Pod, sources: &EnvSources) -> Result<Pod, Report<EnvError>> {
    let mut resolved = pod.clone();
    let service_vars = service_link_vars(pod, sources);

    if let Some(spec) = resolved.spec.as_mut() {
        let init = spec.init_containers.iter_mut().flatten();
        for container in spec.containers.iter_mut().chain(init) {
            resolve_container(pod, container, &service_vars, sources)?;
        }
    }
    Ok(resolved)
}

fn resolve_container(
    pod: &Pod,
    container: &mut Container,
    service_vars: &[(String, String)],
    sources: &EnvSources,
) -> Result<(), Report<EnvError>> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let mut env = EnvSet::default();

    for (name, value) in service_vars {
        env.set(name.clone(), value.clone());
    }

    for source in container.env_from.take().into_iter().flatten() {
        let prefix = source.prefix.unwrap_or_default();
        if let Some(reference) = source.config_map_ref {
            let name = reference.name.unwrap_or_default();
            match sources.config_maps.get(namespace, &name) {
                Some(config_map) => {
                    for (key, value) in config_map.data.iter().flatten() {
                        env.set(format!("{prefix}{key}"), value.clone());
                    }
                }
                None if reference.optional == Some(true) => {}
                None => return Err(missing_object("ConfigMap", namespace, &name)),
            }
        }
        if let Some(reference) = source.secret_ref {
            let name = reference.name.unwrap_or_default();
            match sources.secrets.get(namespace, &name) {
                Some(secret) => {
                    for (key, value) in secret_values(&secret) {
                        env.set(format!("{prefix}{key}"), value);
                    }
                }
                None if reference.optional == Some(true) => {}
                None => return Err(missing_object("Secret", namespace, &name)),
            }
        }
    }

    for var in container.env.take().into_iter().flatten() {
        let Some(value_from) = var.value_from else {
            env.set(var.name, var.value.unwrap_or_default());
            continue;
        };

        if let Some(selector) = value_from.config_map_key_ref {
            let map_name = selector.name.unwrap_or_default();
            let optional = selector.optional == Some(true);
            let value = match sources.config_maps.get(namespace, &map_name) {
                Some(config_map) => config_map
                    .data
                    .as_ref()
                    .and_then(|data| data.get(&selector.key))
                    .cloned(),
                None if optional => continue,
                None => return Err(missing_object("ConfigMap", namespace, &map_name)),
            };
            match value {
                Some(value) => env.set(var.name, value),
                None if optional => {}
                None => {
                    return Err(missing_key("ConfigMap", namespace, &map_name, &selector.key))
                }
            }
        } else if let Some(selector) = value_from.secret_key_ref {
            let secret_name = selector.name.unwrap_or_default();
            let optional = selector.optional == Some(true);
            let value = match sources.secrets.get(namespace, &secret_name) {
                Some(secret) => secret_values(&secret)
                    .into_iter()
                    .find_map(|(key, value)| (key == selector.key).then_some(value)),
                None if optional => continue,
                None => return Err(missing_object("Secret", namespace, &secret_name)),
            };
            match value {
                Some(value) => env.set(var.name, value),
                None if optional => {}
                None => {
                    return Err(missing_key("Secret", namespace, &secret_name, &selector.key))
                }
            }
        } else if let Some(selector) = value_from.field_ref {
            env.set(var.name, field_value(pod, &selector.field_path)?);
        } else {
            // resourceFieldRef is left for the backend.
            env.vars.push(EnvVar {
                name: var.name,
                value: None,
                value_from: Some(value_from),
            });
        }
    }

    container.env = (!env.vars.is_empty()).then_some(env.vars);
    Ok(())
}

fn secret_values(secret: &Secret) -> Vec<(String, String)> {
    let data = secret.data.iter().flatten().map(|(key, ByteString(bytes))| {
        (key.clone(), String::from_utf8_lossy(bytes).into_owned())
    });
    let string_data = secret
        .string_data
        .iter()
        .flatten()
        .map(|(key, value)| (key.clone(), value.clone()));
    data.chain(string_data).collect()
}

fn field_value(pod: &Pod, path: &str) -> Result<String, Report<EnvError>> {
    let meta = &pod.metadata;
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();

    let subscript = |prefix: &str| {
        path.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix("['"))
            .and_then(|rest| rest.strip_suffix("']"))
    };
    if let Some(key) = subscript("metadata.labels") {
        return Ok(meta
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .cloned()
            .unwrap_or_default());
    }
    if let Some(key) = subscript("metadata.annotations") {
        return Ok(meta
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .cloned()
            .unwrap_or_default());
    }

    let value = match path {
        "metadata.name" => meta.name.clone(),
        "metadata.namespace" => meta.namespace.clone(),
        "metadata.uid" => meta.uid.clone(),
        "spec.nodeName" => spec.and_then(|s| s.node_name.clone()),
        "spec.serviceAccountName" => spec.and_then(|s| s.service_account_name.clone()),
        "status.hostIP" => status.and_then(|s| s.host_ip.clone()),
        "status.podIP" => status.and_then(|s| s.pod_ip.clone()),
        _ => {
            return Err(Report::new(EnvError::UnsupportedFieldPath {
                path: path.to_string(),
            }))
        }
    };
    Ok(value.unwrap_or_default())
}

/// Docker-style link variables for services visible to `pod`.
fn service_link_vars(pod: &Pod, sources: &EnvSources) -> Vec<(String, String)> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let links_enabled = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.enable_service_links)
        .unwrap_or(true);

    let mut services: Vec<Arc<Service>> = if links_enabled {
        sources.services.list(Some(namespace))
    } else {
        Vec::new()
    };
    if namespace != MASTER_SERVICE_NAMESPACE || !links_enabled {
        if let Some(master) = sources
            .services
            .get(MASTER_SERVICE_NAMESPACE, MASTER_SERVICE_NAME)
        {
            services.push(master);
        }
    }
    services.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    services.dedup_by(|a, b| a.metadata.name == b.metadata.name);

    let mut vars = Vec::new();
    for service in services {
        let Some(spec) = service.spec.as_ref() else {
            continue;
        };
        let Some(cluster_ip) = spec.cluster_ip.as_deref().filter(|ip| !ip.is_empty() && *ip != "None") else {
            continue;
        };
        let name = service
            .metadata
            .name
            .as_deref()
            .unwrap_or_default()
            .to_uppercase()
            .replace('-', "_");

        vars.push((format!("{name}_SERVICE_HOST"), cluster_ip.to_string()));
        let ports = spec.ports.as_deref().unwrap_or_default();
        for (i, port) in ports.iter().enumerate() {
            let protocol = port.protocol.as_deref().unwrap_or("TCP");
            let number = port.port;
            if i == 0 {
                vars.push((format!("{name}_SERVICE_PORT"), number.to_string()));
                vars.push((format!("{name}_PORT"), format!("{}://{cluster_ip}:{number}", protocol.to_lowercase())));
            }
            if let Some(port_name) = port.name.as_deref().filter(|n| !n.is_empty()) {
                let port_name = port_name.to_uppercase().replace('-', "_");
                vars.push((format!("{name}_SERVICE_PORT_{port_name}"), number.to_string()));
            }
            let prefix = format!("{name}_PORT_{number}_{}", protocol.to_uppercase());
            vars.push((prefix.clone(), format!("{}://{cluster_ip}:{number}", protocol.to_lowercase())));
            vars.push((format!("{prefix}_PROTO"), protocol.to_lowercase()));
            vars.push((format!("{prefix}_PORT"), number.to_string()));
            vars.push((format!("{prefix}_ADDR"), cluster_ip.to_string()));
        }
    }
    vars
}

fn missing_object(kind: &'static str, namespace: &str, name: &str) -> Report<EnvError> {
    Report::new(EnvError::MissingObject {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    })
}

fn missing_key(kind: &'static str, namespace: &str, name: &str, key: &str) -> Report<EnvError> {
    Report::new(EnvError::MissingKey {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
        key: key.to_string(),
    })
}
