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

//! In-cluster API client backed by `reqwest`.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::{Certificate, Client, Url};
use serde::de::DeserializeOwned;

use super::client::{ApiError, ClusterClient};
use super::discovery::{discovery_segments, APIResource, APIResourceList};
use super::meta::ObjectMetadata;
use super::pod::{self, Pod};
use super::service::Service;
use crate::buildctl::logger::log_debug;
use crate::buildctl::util::error::{config_error, new_error, with_context, BoxError};

pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection parameters for the API server.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub server: Url,
    pub token: Option<String>,
    pub ca_certificate: Option<Vec<u8>>,
}

impl ClusterConfig {
    pub fn new(server: &str) -> Result<Self, BoxError> {
        let server = Url::parse(server)
            .map_err(|e| with_context(e, format!("invalid API server URL '{server}'")))?;
        Ok(ClusterConfig {
            server,
            token: None,
            ca_certificate: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_ca_certificate(mut self, pem: Vec<u8>) -> Self {
        self.ca_certificate = Some(pem);
        self
    }

    /// Configuration of a process running inside a pod.
    pub fn in_cluster() -> Result<Self, BoxError> {
        let host = env::var(SERVICE_HOST_ENV).unwrap_or_default();
        let port = env::var(SERVICE_PORT_ENV).unwrap_or_default();
        Self::from_service_account(&host, &port, Path::new(SERVICE_ACCOUNT_DIR))
    }

    /// Builds the configuration from the service host and port plus the
    /// `token` and `ca.crt` files found in `dir`.
    pub fn from_service_account(host: &str, port: &str, dir: &Path) -> Result<Self, BoxError> {
        let (host, port) = (host.trim(), port.trim());
        if host.is_empty() || port.is_empty() {
            return Err(config_error(format!(
                "unable to load in-cluster configuration, {SERVICE_HOST_ENV} and {SERVICE_PORT_ENV} must be defined"
            )));
        }
        let authority = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };

        let token_path = dir.join("token");
        let token = fs::read_to_string(&token_path).map_err(|e| {
            with_context(
                e,
                format!("failed to read service account token {}", token_path.display()),
            )
        })?;
        let ca_path = dir.join("ca.crt");
        let ca_certificate = fs::read(&ca_path).map_err(|e| {
            with_context(
                e,
                format!("failed to read cluster CA bundle {}", ca_path.display()),
            )
        })?;

        Ok(Self::new(&format!("https://{authority}"))?
            .with_token(token.trim())
            .with_ca_certificate(ca_certificate))
    }
}

pub struct KubeClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
    discovery: Mutex<HashMap<String, Arc<APIResourceList>>>,
}

impl KubeClient {
    pub fn new(config: ClusterConfig) -> Result<Self, BoxError> {
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(pem) = config.ca_certificate.as_deref() {
            let certificate = Certificate::from_pem(pem)
                .map_err(|e| with_context(e, "cluster CA bundle is not valid PEM"))?;
            builder = builder.add_root_certificate(certificate);
        }
        let client = builder
            .build()
            .map_err(|e| with_context(e, "failed to construct Kubernetes HTTP client"))?;

        Ok(KubeClient {
            client,
            base_url: config.server,
            token: config.token.filter(|token| !token.is_empty()),
            discovery: Mutex::new(HashMap::new()),
        })
    }

    pub fn url_from_segments(&self, segments: &[&str]) -> Result<Url, BoxError> {
        let mut url = self.base_url.clone();
        {
            let mut parts = url
                .path_segments_mut()
                .map_err(|_| new_error("base URL cannot be base for segments"))?;
            parts.clear();
            for segment in segments {
                if !segment.is_empty() {
                    parts.push(segment);
                }
            }
        }
        Ok(url)
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn handle_json<T>(&self, response: reqwest::Response) -> Result<T, BoxError>
    where
        T: DeserializeOwned,
    {
        let status = response.status();
        if status.is_success() {
            let body = response
                .json::<T>()
                .await
                .map_err(|e| with_context(e, "failed to decode API response"))?;
            return Ok(body);
        }
        let text = response.text().await.unwrap_or_default();
        Err(Box::new(ApiError::from_response(status, &text)))
    }

    async fn send_json<T>(&self, request: reqwest::RequestBuilder) -> Result<T, BoxError>
    where
        T: DeserializeOwned,
    {
        let response = self.apply_auth(request).send().await?;
        self.handle_json(response).await
    }

    fn cached_resources(&self, api_version: &str) -> Option<Arc<APIResourceList>> {
        self.discovery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(api_version)
            .cloned()
    }

    /// Maps `kind` to its resource through the discovery document of
    /// `api_version`, fetched once per API version.
    async fn resource_for(&self, api_version: &str, kind: &str) -> Result<APIResource, BoxError> {
        let resources = match self.cached_resources(api_version) {
            Some(resources) => resources,
            None => {
                let url = self.url_from_segments(&discovery_segments(api_version))?;
                let list: APIResourceList = self
                    .send_json(self.client.get(url))
                    .await
                    .map_err(|e| with_context(e, format!("failed to discover {api_version}")))?;
                log_debug(
                    "kube-client",
                    "Cached API discovery document",
                    &[
                        ("api_version", api_version),
                        ("resources", list.resources.len().to_string().as_str()),
                    ],
                );
                let list = Arc::new(list);
                self.discovery
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(api_version.to_string(), Arc::clone(&list));
                list
            }
        };
        resources.resource_for_kind(kind).cloned().ok_or_else(|| {
            new_error(format!(
                "the server does not serve kind {kind} in {api_version}"
            ))
        })
    }

    fn namespaced_url(
        &self,
        api_version: &str,
        resource: &str,
        namespace: &str,
        name: Option<&str>,
    ) -> Result<Url, BoxError> {
        let mut segments = discovery_segments(api_version);
        segments.extend(["namespaces", namespace, resource]);
        if let Some(name) = name {
            segments.push(name);
        }
        self.url_from_segments(&segments)
    }

    fn service_url(&self, service: &Service, with_name: bool) -> Result<Url, BoxError> {
        let name = with_name.then(|| service.metadata.name());
        self.namespaced_url(
            &service.api_version,
            "services",
            service.metadata.namespace(),
            name,
        )
    }
}

impl ClusterClient for KubeClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, BoxError> {
        let url = self.namespaced_url(pod::API_VERSION, "pods", namespace, Some(name))?;
        self.send_json(self.client.get(url)).await
    }

    async fn get_object(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<ObjectMetadata, BoxError> {
        let resource = self.resource_for(api_version, kind).await?;
        let url = if resource.namespaced {
            self.namespaced_url(api_version, &resource.name, namespace, Some(name))?
        } else {
            let mut segments = discovery_segments(api_version);
            segments.extend([resource.name.as_str(), name]);
            self.url_from_segments(&segments)?
        };
        self.send_json(self.client.get(url)).await
    }

    async fn create_service(&self, service: &Service) -> Result<Service, BoxError> {
        let url = self.service_url(service, false)?;
        self.send_json(self.client.post(url).json(service)).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, BoxError> {
        let url = self.namespaced_url(super::service::API_VERSION, "services", namespace, Some(name))?;
        self.send_json(self.client.get(url)).await
    }

    async fn update_service(&self, service: &Service) -> Result<Service, BoxError> {
        let url = self.service_url(service, true)?;
        self.send_json(self.client.put(url).json(service)).await
    }
}
