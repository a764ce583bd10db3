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

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct APIResourceList {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(rename = "groupVersion")]
    pub group_version: String,
    pub resources: Vec<APIResource>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct APIResource {
    pub name: String,
    #[serde(rename = "singularName", default)]
    pub singular_name: String,
    pub namespaced: bool,
    pub kind: String,
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(rename = "shortNames", default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
}

impl APIResource {
    pub fn is_subresource(&self) -> bool {
        self.name.contains('/')
    }
}

impl APIResourceList {
    /// Top-level resource serving `kind`. Subresources share the kind of
    /// their parent in some groups and are skipped.
    pub fn resource_for_kind(&self, kind: &str) -> Option<&APIResource> {
        self.resources
            .iter()
            .find(|resource| !resource.is_subresource() && resource.kind == kind)
    }
}

/// Path segments of the discovery document for `api_version`: `/api/v1` for
/// the core group, `/apis/<group>/<version>` otherwise.
pub fn discovery_segments(api_version: &str) -> Vec<&str> {
    match api_version.split_once('/') {
        Some((group, version)) => vec!["apis", group, version],
        None => vec!["api", api_version],
    }
}
