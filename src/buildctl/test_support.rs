#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::buildctl::k8s::client::{ApiError, ClusterClient};
use crate::buildctl::k8s::meta::ObjectMetadata;
use crate::buildctl::k8s::pod::{self, Pod};
use crate::buildctl::k8s::service::{self, Service};
use crate::buildctl::util::error::{with_context, BoxError};

/// Operations of [`ClusterClient`], used to count calls and inject failures.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClusterCall {
    GetPod,
    GetObject,
    CreateService,
    GetService,
    UpdateService,
}

/// Owner of an inserted object as `(apiVersion, kind, name, uid)`.
pub type ControllerRef<'a> = (&'a str, &'a str, &'a str, &'a str);

type ObjectKey = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    calls: BTreeMap<ClusterCall, usize>,
    failures: BTreeMap<ClusterCall, VecDeque<ApiError>>,
    next_version: u64,
    next_address: u32,
}

impl State {
    fn next_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn next_cluster_ip(&mut self) -> String {
        self.next_address += 1;
        format!("10.96.{}.{}", self.next_address / 250, 10 + self.next_address % 250)
    }
}

/// In-memory object store implementing [`ClusterClient`] with API server
/// semantics for the calls the controller makes: optimistic concurrency on
/// `resourceVersion`, an immutable `clusterIP`, and read paths that drop
/// type information from pods.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn call_count(&self, call: ClusterCall) -> usize {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// Makes the next `call` fail with `error`. Queued failures are consumed
    /// in order.
    pub fn fail_next(&self, call: ClusterCall, error: ApiError) {
        self.lock()
            .failures
            .entry(call)
            .or_default()
            .push_back(error);
    }

    pub fn insert_pod(&self, namespace: &str, name: &str, uid: &str, owner: Option<ControllerRef<'_>>) {
        self.insert_object(namespace, pod::API_VERSION, pod::KIND, name, uid, owner);
    }

    pub fn insert_owner(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        name: &str,
        uid: &str,
        owner: Option<ControllerRef<'_>>,
    ) {
        self.insert_object(namespace, api_version, kind, name, uid, owner);
    }

    fn insert_object(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        name: &str,
        uid: &str,
        owner: Option<ControllerRef<'_>>,
    ) {
        let owner_references: Vec<Value> = owner
            .into_iter()
            .map(|(api_version, kind, name, uid)| {
                json!({
                    "apiVersion": api_version,
                    "kind": kind,
                    "name": name,
                    "uid": uid,
                    "controller": true,
                    "blockOwnerDeletion": true,
                })
            })
            .collect();
        let mut state = self.lock();
        let version = state.next_version();
        state.objects.insert(
            key(kind, namespace, name),
            json!({
                "apiVersion": api_version,
                "kind": kind,
                "metadata": {
                    "name": name,
                    "namespace": namespace,
                    "uid": uid,
                    "resourceVersion": version,
                    "ownerReferences": owner_references,
                },
                "spec": {"replicas": 1},
            }),
        );
    }

    /// Stores `service` as if created earlier by another writer.
    pub fn insert_service(&self, service: Service) -> Service {
        let mut state = self.lock();
        Self::store_new_service(&mut state, service)
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        let state = self.lock();
        state
            .objects
            .get(&key(service::KIND, namespace, name))
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn services(&self) -> Vec<Service> {
        let state = self.lock();
        state
            .objects
            .iter()
            .filter(|((kind, _, _), _)| kind == service::KIND)
            .filter_map(|(_, value)| serde_json::from_value(value.clone()).ok())
            .collect()
    }

    fn begin(&self, call: ClusterCall) -> Result<(), BoxError> {
        let mut state = self.lock();
        *state.calls.entry(call).or_insert(0) += 1;
        match state.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(error) => Err(Box::new(error)),
            None => Ok(()),
        }
    }

    fn read<T: DeserializeOwned>(&self, kind: &str, namespace: &str, name: &str) -> Result<T, BoxError> {
        let state = self.lock();
        let value = state
            .objects
            .get(&key(kind, namespace, name))
            .cloned()
            .ok_or_else(|| ApiError::not_found(&resource_name(kind), name))?;
        decode(value)
    }

    fn store_new_service(state: &mut State, mut service: Service) -> Service {
        let version = state.next_version();
        service.metadata.resource_version = Some(version.clone());
        service.metadata.uid = Some(format!("svc-uid-{version}"));
        if service.spec.is_cluster_ip() && service.spec.cluster_ip.is_none() {
            let address = state.next_cluster_ip();
            service.spec.cluster_ips = vec![address.clone()];
            service.spec.cluster_ip = Some(address);
        }
        let name = service.metadata.name().to_string();
        let namespace = service.metadata.namespace().to_string();
        state
            .objects
            .insert(key(service::KIND, &namespace, &name), encode(&service));
        service
    }

    fn create_now(&self, service: &Service) -> Result<Service, BoxError> {
        let mut state = self.lock();
        let name = service.metadata.name();
        let namespace = service.metadata.namespace();
        if state
            .objects
            .contains_key(&key(service::KIND, namespace, name))
        {
            return Err(Box::new(ApiError::already_exists("services", name)));
        }
        Ok(Self::store_new_service(&mut state, service.clone()))
    }

    fn update_now(&self, service: &Service) -> Result<Service, BoxError> {
        let mut state = self.lock();
        let name = service.metadata.name();
        let object_key = key(service::KIND, service.metadata.namespace(), name);
        let existing: Service = match state.objects.get(&object_key) {
            Some(value) => decode(value.clone())?,
            None => return Err(Box::new(ApiError::not_found("services", name))),
        };

        if let Some(version) = service.metadata.resource_version.as_deref() {
            if existing.metadata.resource_version.as_deref() != Some(version) {
                return Err(Box::new(ApiError::conflict("services", name)));
            }
        }
        if existing.spec.cluster_ip.is_some() && existing.spec.cluster_ip != service.spec.cluster_ip {
            return Err(Box::new(ApiError::new(
                reqwest::StatusCode::UNPROCESSABLE_ENTITY,
                "Invalid",
                format!("Service \"{name}\" is invalid: spec.clusterIP: Invalid value: field is immutable"),
            )));
        }

        let mut updated = service.clone();
        updated.metadata.uid = existing.metadata.uid;
        updated.metadata.resource_version = Some(state.next_version());
        state.objects.insert(object_key, encode(&updated));
        Ok(updated)
    }
}

impl ClusterClient for FakeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, BoxError> {
        self.begin(ClusterCall::GetPod)?;
        tokio::task::yield_now().await;
        let mut pod: Pod = self.read(pod::KIND, namespace, name)?;
        pod.api_version.clear();
        pod.kind.clear();
        Ok(pod)
    }

    async fn get_object(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<ObjectMetadata, BoxError> {
        self.begin(ClusterCall::GetObject)?;
        tokio::task::yield_now().await;
        let object: ObjectMetadata = self.read(kind, namespace, name)?;
        if object.api_version != api_version {
            return Err(Box::new(ApiError::not_found(&resource_name(kind), name)));
        }
        Ok(object)
    }

    async fn create_service(&self, service: &Service) -> Result<Service, BoxError> {
        self.begin(ClusterCall::CreateService)?;
        tokio::task::yield_now().await;
        self.create_now(service)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, BoxError> {
        self.begin(ClusterCall::GetService)?;
        tokio::task::yield_now().await;
        self.read(service::KIND, namespace, name)
    }

    async fn update_service(&self, service: &Service) -> Result<Service, BoxError> {
        self.begin(ClusterCall::UpdateService)?;
        tokio::task::yield_now().await;
        self.update_now(service)
    }
}

fn key(kind: &str, namespace: &str, name: &str) -> ObjectKey {
    (kind.to_string(), namespace.to_string(), name.to_string())
}

fn resource_name(kind: &str) -> String {
    format!("{}s", kind.to_ascii_lowercase())
}

fn encode<T: Serialize>(object: &T) -> Value {
    serde_json::to_value(object).unwrap_or(Value::Null)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, BoxError> {
    serde_json::from_value(value).map_err(|e| with_context(e, "stored object has an unexpected shape"))
}
