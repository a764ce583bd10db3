/*
 * Copyright (C) 2024 The Buildctl Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::BTreeMap;

use super::client::{is_already_exists, ClusterClient};
use super::meta::{ObjectMeta, OwnerReference};
use super::ownership::resolve_final_owner;
use super::service::{IntOrString, Service, ServicePort, ServiceSpec};
use crate::buildctl::config::ControllerConfig;
use crate::buildctl::logger::log_info;
use crate::buildctl::util::error::{config_error, with_context, BoxError};

/// Port serving the controller's own instruments.
pub const CONTROLLER_PORT_NAME: &str = "http-metrics";
/// Port serving controller-runtime instruments.
pub const CR_PORT_NAME: &str = "cr-metrics";

const NAME_LABEL: &str = "name";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperationResult {
    Created,
    Updated,
}

impl OperationResult {
    fn as_str(self) -> &'static str {
        match self {
            OperationResult::Created => "created",
            OperationResult::Updated => "updated",
        }
    }
}

/// TCP port whose target is the same port number on the pod.
pub fn metrics_service_port(name: &str, port: u16) -> ServicePort {
    let port = i32::from(port);
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
    }
}

/// Desired state of the metrics Service, owned solely by `owner`.
pub fn metrics_service_descriptor(
    config: &ControllerConfig,
    ports: Vec<ServicePort>,
    owner: OwnerReference,
) -> Service {
    let labels = BTreeMap::from([(NAME_LABEL.to_string(), config.controller_name.clone())]);
    Service {
        metadata: ObjectMeta {
            name: Some(config.metrics_service_name()),
            namespace: Some(config.namespace.clone()),
            labels: labels.clone(),
            owner_references: vec![owner],
            ..Default::default()
        },
        spec: ServiceSpec {
            selector: labels,
            ports,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Creates or updates the Service exposing `ports` of the controller pods,
/// owned by the top-level controller of the pod named by `POD_NAME`.
pub async fn publish_metrics_service<C>(
    client: &C,
    config: &ControllerConfig,
    ports: Vec<ServicePort>,
) -> Result<Service, BoxError>
where
    C: ClusterClient,
{
    if ports.is_empty() {
        return Err(config_error("metrics service needs at least one port"));
    }
    let pod_name = config.pod_name()?;
    let owner = resolve_final_owner(client, pod_name, &config.namespace).await?;

    let desired = metrics_service_descriptor(config, ports, owner);
    let (service, result) = create_or_update_service(client, desired)
        .await
        .map_err(|e| with_context(e, "failed to create or get service for metrics"))?;

    log_info(
        "metrics-service",
        &format!("Metrics Service object {}", result.as_str()),
        &[
            ("service", service.metadata.name()),
            ("namespace", service.metadata.namespace()),
        ],
    );
    Ok(service)
}

/// Creates `desired`; when it already exists, replaces it once on top of the
/// stored `resourceVersion` and cluster address.
pub async fn create_or_update_service<C>(
    client: &C,
    mut desired: Service,
) -> Result<(Service, OperationResult), BoxError>
where
    C: ClusterClient,
{
    let err = match client.create_service(&desired).await {
        Ok(created) => return Ok((created, OperationResult::Created)),
        Err(err) => err,
    };
    if !is_already_exists(&*err) {
        return Err(err);
    }

    let existing = client
        .get_service(desired.metadata.namespace(), desired.metadata.name())
        .await?;
    desired.metadata.resource_version = existing.metadata.resource_version;
    // Type changes are allowed; keep the address only for ClusterIP services.
    if existing.spec.is_cluster_ip() {
        desired.spec.cluster_ip = existing.spec.cluster_ip;
        desired.spec.cluster_ips = existing.spec.cluster_ips;
    }

    let updated = client.update_service(&desired).await?;
    Ok((updated, OperationResult::Updated))
}
