//! Deployment descriptors rendered from live registry state.
//!
//! Both renderers describe a service by its first registered instance and
//! size replicas by the instance count.

use meshkit_core::ServiceInstance;
use serde_json::{json, Value};

use crate::error::MeshError;
use crate::registry::ServiceRegistry;

fn instances_of(registry: &ServiceRegistry, service: &str) -> Result<Vec<ServiceInstance>, MeshError> {
    match registry.instances(service) {
        Some(instances) if !instances.is_empty() => Ok(instances),
        _ => Err(MeshError::UnknownService {
            name: service.to_string(),
        }),
    }
}

/// A Kubernetes `Deployment` for `service`, as pretty-printed JSON.
///
/// # Errors
///
/// [`MeshError::UnknownService`] if the service has no registered instances.
pub fn kubernetes_manifest(
    registry: &ServiceRegistry,
    image_registry: &str,
    service: &str,
) -> Result<String, MeshError> {
    let instances = instances_of(registry, service)?;
    let first = &instances[0];
    let probe = json!({ "path": first.health_check.endpoint, "port": first.port });

    let manifest = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": service, "labels": { "app": service } },
        "spec": {
            "replicas": instances.len(),
            "selector": { "matchLabels": { "app": service } },
            "template": {
                "metadata": { "labels": { "app": service } },
                "spec": {
                    "containers": [{
                        "name": service,
                        "image": format!("{image_registry}/{service}:{}", first.version),
                        "ports": [{ "containerPort": first.port }],
                        "env": [
                            { "name": "SERVICE_NAME", "value": service },
                            { "name": "SERVICE_VERSION", "value": first.version },
                        ],
                        "livenessProbe": {
                            "httpGet": probe,
                            "initialDelaySeconds": 30,
                            "periodSeconds": first.health_check.interval_ms / 1000,
                        },
                        "readinessProbe": {
                            "httpGet": probe,
                            "initialDelaySeconds": 5,
                            "periodSeconds": 5,
                        },
                        "resources": {
                            "requests": { "memory": "128Mi", "cpu": "100m" },
                            "limits": { "memory": "512Mi", "cpu": "500m" },
                        },
                    }],
                },
            },
        },
    });
    Ok(serde_json::to_string_pretty(&manifest)?)
}

/// A docker-compose service entry keyed by `service`, as pretty-printed JSON.
///
/// # Errors
///
/// [`MeshError::UnknownService`] if the service has no registered instances.
pub fn compose_service(
    registry: &ServiceRegistry,
    image_registry: &str,
    service: &str,
) -> Result<String, MeshError> {
    let instances = instances_of(registry, service)?;
    let first = &instances[0];
    let check = &first.health_check;

    let entry = json!({
        "image": format!("{image_registry}/{service}:{}", first.version),
        "ports": [format!("{0}:{0}", first.port)],
        "environment": [
            format!("SERVICE_NAME={service}"),
            format!("SERVICE_VERSION={}", first.version),
            format!("PORT={}", first.port),
        ],
        "healthcheck": {
            "test": [
                "CMD", "curl", "-f",
                format!("http://localhost:{}{}", first.port, check.endpoint),
            ],
            "interval": format!("{}s", check.interval_ms / 1000),
            "timeout": format!("{}s", check.timeout_ms / 1000),
            "retries": 3,
        },
        "deploy": {
            "replicas": instances.len(),
            "resources": {
                "limits": { "memory": "512M" },
                "reservations": { "memory": "128M" },
            },
        },
        "networks": [format!("{image_registry}-network")],
    });

    let mut doc = serde_json::Map::new();
    doc.insert(service.to_string(), entry);
    Ok(serde_json::to_string_pretty(&Value::Object(doc))?)
}
