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

//! Resolution of the top-level controller that owns a pod.
//!
//! Pods created by a Deployment are owned by a ReplicaSet, which is in turn
//! owned by the Deployment. Attaching the metrics Service to the top of that
//! chain keeps it alive across rollouts and garbage-collects it together with
//! the controller installation.

use std::collections::HashSet;
use std::error::Error;
use std::fmt;

use super::client::ClusterClient;
use super::meta::{controller_of, ObjectMeta, OwnerReference};
use super::pod;
use crate::buildctl::logger::{log_debug, log_error};
use crate::buildctl::util::error::{with_context, BoxError};

/// An owner chain that loops back onto an object already visited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipCycleError {
    pub namespace: String,
    /// Visited objects in walk order as `Kind/name`, ending with the repeat.
    pub chain: Vec<String>,
}

impl fmt::Display for OwnershipCycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "owner reference cycle in namespace {}: {}",
            self.namespace,
            self.chain.join(" -> ")
        )
    }
}

impl Error for OwnershipCycleError {}

/// Follows controller owner references upwards from pod
/// `namespace/pod_name` and returns a reference to the last object reached.
/// A pod without a controller owner resolves to itself.
pub async fn resolve_final_owner<C>(
    client: &C,
    pod_name: &str,
    namespace: &str,
) -> Result<OwnerReference, BoxError>
where
    C: ClusterClient,
{
    let mut pod = match client.get_pod(namespace, pod_name).await {
        Ok(pod) => pod,
        Err(err) => {
            let error = err.to_string();
            log_error(
                "ownership",
                "Failed to get the controller pod",
                &[
                    ("namespace", namespace),
                    ("pod", pod_name),
                    ("error", error.as_str()),
                ],
            );
            return Err(with_context(
                err,
                format!("failed to get pod {namespace}/{pod_name}"),
            ));
        }
    };
    // The read path may leave type information empty.
    pod.api_version = pod::API_VERSION.to_string();
    pod.kind = pod::KIND.to_string();

    let mut visited = HashSet::new();
    let mut chain = Vec::new();
    visit(&mut visited, &mut chain, namespace, &pod.kind, pod.metadata.name())?;

    let mut meta: ObjectMeta = pod.metadata;
    let mut current = OwnerReference::controller_for(&pod.api_version, &pod.kind, &meta);

    while let Some(owner) = controller_of(&meta).cloned() {
        visit(&mut visited, &mut chain, namespace, &owner.kind, &owner.name)?;
        let object = client
            .get_object(&owner.api_version, &owner.kind, namespace, &owner.name)
            .await
            .map_err(|err| {
                with_context(
                    err,
                    format!("failed to get owner {}/{} in {namespace}", owner.kind, owner.name),
                )
            })?;
        log_debug(
            "ownership",
            "Followed controller reference",
            &[("kind", owner.kind.as_str()), ("name", owner.name.as_str())],
        );
        meta = object.metadata;
        current = owner;
    }

    Ok(current)
}

fn visit(
    visited: &mut HashSet<(String, String, String)>,
    chain: &mut Vec<String>,
    namespace: &str,
    kind: &str,
    name: &str,
) -> Result<(), OwnershipCycleError> {
    chain.push(format!("{kind}/{name}"));
    let key = (kind.to_string(), namespace.to_string(), name.to_string());
    if visited.insert(key) {
        Ok(())
    } else {
        Err(OwnershipCycleError {
            namespace: namespace.to_string(),
            chain: chain.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildctl::k8s::client::{is_not_found, ApiError};
    use crate::buildctl::logger::{take_test_logs, LogLevel};
    use crate::buildctl::test_support::{ClusterCall, FakeCluster};
    use crate::buildctl::util::error::find_source;

    const NS: &str = "shipwright-build";

    #[tokio::test]
    async fn pod_without_owner_resolves_to_itself() {
        let cluster = FakeCluster::new();
        cluster.insert_pod(NS, "standalone", "pod-uid", None);

        let owner = resolve_final_owner(&cluster, "standalone", NS).await.unwrap();
        assert_eq!(owner.api_version, "v1");
        assert_eq!(owner.kind, "Pod");
        assert_eq!(owner.name, "standalone");
        assert_eq!(owner.uid, "pod-uid");
        assert!(owner.is_controller());
        assert_eq!(owner.block_owner_deletion, Some(true));
        assert_eq!(cluster.call_count(ClusterCall::GetObject), 0);
    }

    #[tokio::test]
    async fn walks_deployment_chain() {
        let cluster = FakeCluster::new();
        cluster.insert_owner(NS, "apps/v1", "Deployment", "controller", "d-uid", None);
        cluster.insert_owner(
            NS,
            "apps/v1",
            "ReplicaSet",
            "controller-7d9f",
            "rs-uid",
            Some(("apps/v1", "Deployment", "controller", "d-uid")),
        );
        cluster.insert_pod(
            NS,
            "controller-7d9f-x1",
            "pod-uid",
            Some(("apps/v1", "ReplicaSet", "controller-7d9f", "rs-uid")),
        );

        let owner = resolve_final_owner(&cluster, "controller-7d9f-x1", NS)
            .await
            .unwrap();
        assert_eq!(owner.kind, "Deployment");
        assert_eq!(owner.name, "controller");
        assert_eq!(owner.uid, "d-uid");
        assert_eq!(cluster.call_count(ClusterCall::GetPod), 1);
        assert_eq!(cluster.call_count(ClusterCall::GetObject), 2);
    }

    #[tokio::test]
    async fn cycle_is_reported() {
        let cluster = FakeCluster::new();
        cluster.insert_owner(
            NS,
            "example.dev/v1",
            "Widget",
            "a",
            "a-uid",
            Some(("example.dev/v1", "Widget", "b", "b-uid")),
        );
        cluster.insert_owner(
            NS,
            "example.dev/v1",
            "Widget",
            "b",
            "b-uid",
            Some(("example.dev/v1", "Widget", "a", "a-uid")),
        );
        cluster.insert_pod(NS, "p", "p-uid", Some(("example.dev/v1", "Widget", "a", "a-uid")));

        let err = resolve_final_owner(&cluster, "p", NS).await.unwrap_err();
        let cycle = find_source::<OwnershipCycleError>(&*err).expect("cycle error");
        assert_eq!(cycle.chain, vec!["Pod/p", "Widget/a", "Widget/b", "Widget/a"]);
        assert_eq!(cluster.call_count(ClusterCall::GetObject), 2);
    }

    #[tokio::test]
    async fn missing_owner_propagates_not_found() {
        let cluster = FakeCluster::new();
        cluster.insert_pod(
            NS,
            "orphan",
            "pod-uid",
            Some(("apps/v1", "ReplicaSet", "gone", "rs-uid")),
        );

        let err = resolve_final_owner(&cluster, "orphan", NS).await.unwrap_err();
        assert!(is_not_found(&*err), "{err}");
    }

    #[tokio::test]
    async fn pod_fetch_failure_is_logged() {
        let cluster = FakeCluster::new();
        cluster.fail_next(
            ClusterCall::GetPod,
            ApiError::new(reqwest::StatusCode::FORBIDDEN, "Forbidden", "pods is forbidden"),
        );

        let err = resolve_final_owner(&cluster, "controller-0", NS).await.unwrap_err();
        assert!(err.to_string().contains("pods is forbidden"));

        let logs = take_test_logs("ownership");
        let (level, line) = logs
            .iter()
            .find(|(_, line)| line.contains("controller-0"))
            .expect("error log for pod fetch");
        assert_eq!(*level, LogLevel::Error);
        assert!(line.contains(NS), "{line}");
    }
}
