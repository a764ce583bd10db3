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

use std::error::Error;
use std::fmt;
use std::future::Future;

use reqwest::StatusCode;
use serde::Deserialize;

use super::meta::ObjectMetadata;
use super::pod::Pod;
use super::service::Service;
use crate::buildctl::util::error::{find_source, BoxError};

pub const REASON_NOT_FOUND: &str = "NotFound";
pub const REASON_ALREADY_EXISTS: &str = "AlreadyExists";
pub const REASON_CONFLICT: &str = "Conflict";

/// Cluster object store operations used by the controller at start-up.
///
/// Errors reported by the API server surface as [`ApiError`] somewhere in
/// the returned error's source chain.
pub trait ClusterClient: Send + Sync {
    fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Pod, BoxError>> + Send;

    /// Fetches any namespaced object, decoding only its type and metadata.
    fn get_object(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<ObjectMetadata, BoxError>> + Send;

    fn create_service(
        &self,
        service: &Service,
    ) -> impl Future<Output = Result<Service, BoxError>> + Send;

    fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Service, BoxError>> + Send;

    fn update_service(
        &self,
        service: &Service,
    ) -> impl Future<Output = Result<Service, BoxError>> + Send;
}

/// Failure status returned by the API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub reason: String,
    pub message: String,
}

/// The `Status` object carried by non-2xx API responses.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct StatusBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub code: u16,
}

impl ApiError {
    pub fn new(status: StatusCode, reason: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError {
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: &str, name: &str) -> Self {
        ApiError::new(
            StatusCode::NOT_FOUND,
            REASON_NOT_FOUND,
            format!("{kind} \"{name}\" not found"),
        )
    }

    pub fn already_exists(kind: &str, name: &str) -> Self {
        ApiError::new(
            StatusCode::CONFLICT,
            REASON_ALREADY_EXISTS,
            format!("{kind} \"{name}\" already exists"),
        )
    }

    pub fn conflict(kind: &str, name: &str) -> Self {
        ApiError::new(
            StatusCode::CONFLICT,
            REASON_CONFLICT,
            format!(
                "Operation cannot be fulfilled on {kind} \"{name}\": the object has been modified; please apply your changes to the latest version and try again"
            ),
        )
    }

    /// Builds an error from a response status and its raw body. Bodies that
    /// are not a `Status` object keep the text as the message.
    pub(crate) fn from_response(status: StatusCode, body: &str) -> Self {
        match serde_json::from_str::<StatusBody>(body) {
            Ok(parsed) if !parsed.reason.is_empty() || !parsed.message.is_empty() => {
                let status = StatusCode::from_u16(parsed.code)
                    .ok()
                    .filter(|code| code.as_u16() >= 400)
                    .unwrap_or(status);
                ApiError::new(status, parsed.reason, parsed.message)
            }
            _ => {
                let message = if body.trim().is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_string()
                } else {
                    body.trim().to_string()
                };
                ApiError::new(status, String::new(), message)
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }

    pub fn is_already_exists(&self) -> bool {
        self.status == StatusCode::CONFLICT && self.reason == REASON_ALREADY_EXISTS
    }

    pub fn is_conflict(&self) -> bool {
        self.status == StatusCode::CONFLICT && self.reason == REASON_CONFLICT
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.message, self.status)
    }
}

impl Error for ApiError {}

pub fn api_error<'a>(err: &'a (dyn Error + 'static)) -> Option<&'a ApiError> {
    find_source::<ApiError>(err)
}

pub fn is_not_found(err: &(dyn Error + 'static)) -> bool {
    api_error(err).is_some_and(ApiError::is_not_found)
}

pub fn is_already_exists(err: &(dyn Error + 'static)) -> bool {
    api_error(err).is_some_and(ApiError::is_already_exists)
}

pub fn is_conflict(err: &(dyn Error + 'static)) -> bool {
    api_error(err).is_some_and(ApiError::is_conflict)
}
