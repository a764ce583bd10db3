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
use std::sync::{Mutex, OnceLock, RwLock};

use axum::routing::MethodRouter;
use chrono::Duration;
use prometheus::core::Collector;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use crate::buildctl::config::PrometheusConfig;
use crate::buildctl::logger::log_info;
use crate::buildctl::observability::labels::LabelConfig;
use crate::buildctl::util::error::{config_error, new_error, with_context, BoxError};

const METRICS_NAMESPACE: &str = "build";
pub const METRICS_PATH: &str = "/metrics";

/// The five build-run duration histograms.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DurationMetric {
    Establish,
    Completion,
    BuildRunRampUp,
    TaskRunRampUp,
    TaskRunPodRampUp,
}

impl DurationMetric {
    fn name(self) -> &'static str {
        match self {
            DurationMetric::Establish => "buildrun_establish_duration_seconds",
            DurationMetric::Completion => "buildrun_completion_duration_seconds",
            DurationMetric::BuildRunRampUp => "buildrun_rampup_duration_seconds",
            DurationMetric::TaskRunRampUp => "buildrun_taskrun_rampup_duration_seconds",
            DurationMetric::TaskRunPodRampUp => "buildrun_taskrun_pod_rampup_duration_seconds",
        }
    }

    fn help(self) -> &'static str {
        match self {
            DurationMetric::Establish => "BuildRun establish duration in seconds.",
            DurationMetric::Completion => "BuildRun completion duration in seconds.",
            DurationMetric::BuildRunRampUp => {
                "BuildRun ramp-up duration in seconds (time between buildrun creation and taskrun creation)."
            }
            DurationMetric::TaskRunRampUp => {
                "BuildRun taskrun ramp-up duration in seconds (time between taskrun creation and taskrun pod creation)."
            }
            DurationMetric::TaskRunPodRampUp => {
                "BuildRun taskrun pod ramp-up duration in seconds (time between pod creation and last init container completion)."
            }
        }
    }

    fn buckets(self, config: &PrometheusConfig) -> &[f64] {
        match self {
            DurationMetric::Establish => &config.establish_buckets,
            DurationMetric::Completion => &config.completion_buckets,
            DurationMetric::BuildRunRampUp
            | DurationMetric::TaskRunRampUp
            | DurationMetric::TaskRunPodRampUp => &config.rampup_buckets,
        }
    }
}

struct Instruments {
    labels: LabelConfig,
    builds_registered: IntCounterVec,
    buildruns_completed: IntCounterVec,
    buildrun_establish: HistogramVec,
    buildrun_completion: HistogramVec,
    buildrun_rampup: HistogramVec,
    taskrun_rampup: HistogramVec,
    taskrun_pod_rampup: HistogramVec,
}

impl Instruments {
    fn build(config: &PrometheusConfig) -> Result<Self, BoxError> {
        let labels = LabelConfig::new(config.enabled_labels.iter().copied());
        let build_keys = labels.build_keys();
        let buildrun_keys = labels.buildrun_keys();

        let builds_registered = IntCounterVec::new(
            Opts::new("builds_registered_total", "Number of total registered Builds."),
            &build_keys,
        )
        .map_err(|err| with_context(err, "failed to build registered builds counter"))?;
        let buildruns_completed = IntCounterVec::new(
            Opts::new("buildruns_completed_total", "Number of total completed BuildRuns."),
            &buildrun_keys,
        )
        .map_err(|err| with_context(err, "failed to build completed buildruns counter"))?;

        let histogram = |metric: DurationMetric| -> Result<HistogramVec, BoxError> {
            let buckets = metric.buckets(config);
            check_buckets(metric, buckets)?;
            let opts = HistogramOpts::new(metric.name(), metric.help()).buckets(buckets.to_vec());
            HistogramVec::new(opts, &buildrun_keys).map_err(|err| {
                with_context(err, format!("failed to build {} histogram", metric.name()))
            })
        };

        Ok(Instruments {
            builds_registered,
            buildruns_completed,
            buildrun_establish: histogram(DurationMetric::Establish)?,
            buildrun_completion: histogram(DurationMetric::Completion)?,
            buildrun_rampup: histogram(DurationMetric::BuildRunRampUp)?,
            taskrun_rampup: histogram(DurationMetric::TaskRunRampUp)?,
            taskrun_pod_rampup: histogram(DurationMetric::TaskRunPodRampUp)?,
            labels,
        })
    }

    fn collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.builds_registered.clone()),
            Box::new(self.buildruns_completed.clone()),
            Box::new(self.buildrun_establish.clone()),
            Box::new(self.buildrun_completion.clone()),
            Box::new(self.buildrun_rampup.clone()),
            Box::new(self.taskrun_rampup.clone()),
            Box::new(self.taskrun_pod_rampup.clone()),
        ]
    }

    /// Registers every instrument, or none of them.
    fn register(&self, registry: &Registry) -> Result<(), BoxError> {
        for (index, collector) in self.collectors().into_iter().enumerate() {
            if let Err(err) = registry.register(collector) {
                for previous in self.collectors().into_iter().take(index) {
                    let _ = registry.unregister(previous);
                }
                return Err(with_context(err, "failed to register build metric collector"));
            }
        }
        Ok(())
    }

    fn histogram(&self, metric: DurationMetric) -> &HistogramVec {
        match metric {
            DurationMetric::Establish => &self.buildrun_establish,
            DurationMetric::Completion => &self.buildrun_completion,
            DurationMetric::BuildRunRampUp => &self.buildrun_rampup,
            DurationMetric::TaskRunRampUp => &self.taskrun_rampup,
            DurationMetric::TaskRunPodRampUp => &self.taskrun_pod_rampup,
        }
    }
}

fn path_segments(path: &str) -> Vec<&str> {
    path.strip_prefix('/').unwrap_or(path).split('/').collect()
}

fn is_capture_char(c: char) -> bool {
    c == ':' || c == '*'
}

fn is_capture(segment: &str) -> bool {
    segment.starts_with(is_capture_char)
}

fn check_handler_path(path: &str) -> Result<(), BoxError> {
    let invalid = |reason: &str| config_error(format!("metrics handler path '{path}' {reason}"));
    if !path.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    if path == METRICS_PATH {
        return Err(invalid("is reserved"));
    }
    if path == "/" {
        return Ok(());
    }
    let segments = path_segments(path);
    let last = segments.len() - 1;
    for (index, segment) in segments.into_iter().enumerate() {
        if segment.is_empty() {
            return Err(invalid("has an empty segment"));
        }
        match segment.strip_prefix(is_capture_char) {
            Some("") => return Err(invalid("has a capture without a name")),
            Some(name) if name.contains(is_capture_char) => {
                return Err(invalid("may only capture whole segments"))
            }
            None if segment.contains(is_capture_char) => {
                return Err(invalid("may only capture whole segments"))
            }
            _ => {}
        }
        if segment.starts_with('*') && index != last {
            return Err(invalid("has a wildcard before its last segment"));
        }
    }
    Ok(())
}

/// Whether two valid, distinct paths cannot be mounted on the same router.
/// Captures at the same position must agree on kind and name, and a
/// wildcard cannot sit next to a sibling segment.
fn paths_conflict(left: &str, right: &str) -> bool {
    for (a, b) in path_segments(left).into_iter().zip(path_segments(right)) {
        if a == b {
            continue;
        }
        if a.starts_with('*') || b.starts_with('*') {
            return true;
        }
        return is_capture(a) && is_capture(b);
    }
    false
}

fn check_buckets(metric: DurationMetric, buckets: &[f64]) -> Result<(), BoxError> {
    if buckets.iter().any(|bound| bound.is_nan()) {
        return Err(config_error(format!(
            "{} buckets contain NaN",
            metric.name()
        )));
    }
    if buckets.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(config_error(format!(
            "{} buckets must be strictly increasing, got {buckets:?}",
            metric.name()
        )));
    }
    Ok(())
}

/// Build lifecycle instruments backed by a dedicated Prometheus registry.
///
/// Construct one per process and share it by reference; reconcilers call the
/// `record_*` / `observe_*` operations, the metrics listener calls
/// [`BuildMetrics::gather`]. Until [`BuildMetrics::initialize`] has run every
/// recording operation is a silent no-op.
pub struct BuildMetrics {
    registry: Registry,
    instruments: OnceLock<Instruments>,
    init_gate: Mutex<()>,
    extra_handlers: RwLock<BTreeMap<String, MethodRouter>>,
}

impl BuildMetrics {
    pub fn new() -> Result<Self, BoxError> {
        let registry = Registry::new_custom(Some(METRICS_NAMESPACE.to_string()), None)
            .map_err(|err| with_context(err, "failed to initialise build metrics registry"))?;
        Ok(BuildMetrics {
            registry,
            instruments: OnceLock::new(),
            init_gate: Mutex::new(()),
            extra_handlers: RwLock::new(BTreeMap::new()),
        })
    }

    /// Creates and registers the instruments. Later calls are no-ops and the
    /// first configuration stays in effect. On error nothing is registered
    /// and a later call may try again.
    pub fn initialize(&self, config: &PrometheusConfig) -> Result<(), BoxError> {
        if self.is_initialized() {
            return Ok(());
        }
        let _gate = self
            .init_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.is_initialized() {
            return Ok(());
        }

        let instruments = Instruments::build(config)?;
        instruments.register(&self.registry)?;
        let enabled = instruments.labels.buildrun_keys().join(",");
        if self.instruments.set(instruments).is_err() {
            return Err(new_error("build metrics initialised outside the init gate"));
        }

        log_info(
            "metrics",
            "Build metrics registered",
            &[("enabled_labels", enabled.as_str())],
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.instruments.get().is_some()
    }

    pub fn record_build_registered(&self, strategy: &str, namespace: &str, build: &str) {
        if let Some(instruments) = self.instruments.get() {
            let values = instruments.labels.build_values(strategy, namespace, build);
            instruments.builds_registered.with_label_values(&values).inc();
        }
    }

    pub fn record_buildrun_completed(
        &self,
        strategy: &str,
        namespace: &str,
        build: &str,
        buildrun: &str,
    ) {
        if let Some(instruments) = self.instruments.get() {
            let values = instruments
                .labels
                .buildrun_values(strategy, namespace, build, buildrun);
            instruments.buildruns_completed.with_label_values(&values).inc();
        }
    }

    /// Time between BuildRun creation and its Established condition.
    pub fn observe_buildrun_establish(
        &self,
        strategy: &str,
        namespace: &str,
        build: &str,
        buildrun: &str,
        duration: Duration,
    ) -> Result<(), BoxError> {
        self.observe(DurationMetric::Establish, [strategy, namespace, build, buildrun], duration)
    }

    /// Time between BuildRun creation and completion.
    pub fn observe_buildrun_completion(
        &self,
        strategy: &str,
        namespace: &str,
        build: &str,
        buildrun: &str,
        duration: Duration,
    ) -> Result<(), BoxError> {
        self.observe(DurationMetric::Completion, [strategy, namespace, build, buildrun], duration)
    }

    /// Time between BuildRun creation and TaskRun creation.
    pub fn observe_buildrun_rampup(
        &self,
        strategy: &str,
        namespace: &str,
        build: &str,
        buildrun: &str,
        duration: Duration,
    ) -> Result<(), BoxError> {
        self.observe(
            DurationMetric::BuildRunRampUp,
            [strategy, namespace, build, buildrun],
            duration,
        )
    }

    /// Time between TaskRun creation and TaskRun pod creation.
    pub fn observe_taskrun_rampup(
        &self,
        strategy: &str,
        namespace: &str,
        build: &str,
        buildrun: &str,
        duration: Duration,
    ) -> Result<(), BoxError> {
        self.observe(
            DurationMetric::TaskRunRampUp,
            [strategy, namespace, build, buildrun],
            duration,
        )
    }

    /// Time between pod creation and completion of the last init container.
    pub fn observe_taskrun_pod_rampup(
        &self,
        strategy: &str,
        namespace: &str,
        build: &str,
        buildrun: &str,
        duration: Duration,
    ) -> Result<(), BoxError> {
        self.observe(
            DurationMetric::TaskRunPodRampUp,
            [strategy, namespace, build, buildrun],
            duration,
        )
    }

    // Negative durations are rejected even before initialization.
    fn observe(
        &self,
        metric: DurationMetric,
        [strategy, namespace, build, buildrun]: [&str; 4],
        duration: Duration,
    ) -> Result<(), BoxError> {
        let elapsed = duration.to_std().map_err(|_| {
            new_error(format!(
                "refusing to record negative duration {duration} in {}",
                metric.name()
            ))
        })?;
        if let Some(instruments) = self.instruments.get() {
            let values = instruments
                .labels
                .buildrun_values(strategy, namespace, build, buildrun);
            instruments
                .histogram(metric)
                .with_label_values(&values)
                .observe(elapsed.as_secs_f64());
        }
        Ok(())
    }

    /// Mounts `handler` at `path` on the metrics listener, alongside
    /// [`METRICS_PATH`]. Must be called before the listener is started.
    /// Registering the same path again replaces the handler.
    ///
    /// Paths use the router's syntax (`/:name` captures one segment,
    /// `/*name` the rest of the path). Paths the router would refuse, or that
    /// overlap a mounted route in a way it cannot resolve, are rejected here.
    pub fn register_handler(
        &self,
        path: impl Into<String>,
        handler: MethodRouter,
    ) -> Result<(), BoxError> {
        let path = path.into();
        check_handler_path(&path)?;

        let mut handlers = self
            .extra_handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mounted = std::iter::once(METRICS_PATH).chain(handlers.keys().map(String::as_str));
        for existing in mounted {
            if existing != path && paths_conflict(existing, &path) {
                return Err(config_error(format!(
                    "metrics handler path '{path}' conflicts with '{existing}'"
                )));
            }
        }
        handlers.insert(path, handler);
        Ok(())
    }

    /// Additional handlers to mount on the metrics listener, keyed by path.
    pub fn extra_handlers(&self) -> BTreeMap<String, MethodRouter> {
        self.extra_handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Encodes every registered instrument in the Prometheus text format.
    pub fn gather(&self) -> Result<Vec<u8>, BoxError> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(|err| with_context(err, "failed to encode build metrics"))?;
        Ok(buffer)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
