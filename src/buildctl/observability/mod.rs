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

//! Observability primitives for the build controller.
//!
//! Instruments follow the Prometheus conventions: snake_case names prefixed
//! with `build_`, counters ending with `_total`, and duration histograms
//! ending with `_seconds`. Label keys are the Shipwright resource names
//! (`buildstrategy`, `namespace`, `build`, `buildrun`).

pub mod labels;
pub mod metrics;
pub mod server;
pub mod tracing;
