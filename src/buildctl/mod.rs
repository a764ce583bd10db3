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

//! Instrumentation and self-registration for the build controller.
//!
//! Two independent start-up flows live here: the Prometheus instrument
//! registry that reconcilers record build lifecycle observations into, and
//! the publisher that exposes those instruments through a cluster Service
//! owned by the top-level controller of the running pod.

pub mod config;
pub mod k8s;
pub mod logger;
pub mod observability;
pub mod test_support;
pub mod util;
