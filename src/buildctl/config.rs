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

use std::env;
use std::net::SocketAddr;

use crate::buildctl::logger::{log_warn, LogFormat};
use crate::buildctl::observability::labels::MetricLabel;
use crate::buildctl::util::error::{config_error, BoxError};

pub const DEFAULT_CONTROLLER_NAME: &str = "shipwright-build-controller";
pub const DEFAULT_NAMESPACE: &str = "shipwright-build";
const DEFAULT_METRICS_PORT: u16 = 8383;

/// Environment-driven configuration parameters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Setting {
    EnabledLabels,
    EstablishBuckets,
    CompletionBuckets,
    RampUpBuckets,
    Namespace,
    ControllerName,
    MetricsAddress,
    MetricsPort,
    PodName,
    LogFormat,
}

impl Setting {
    pub const ALL: [Setting; 10] = [
        Setting::EnabledLabels,
        Setting::EstablishBuckets,
        Setting::CompletionBuckets,
        Setting::RampUpBuckets,
        Setting::Namespace,
        Setting::ControllerName,
        Setting::MetricsAddress,
        Setting::MetricsPort,
        Setting::PodName,
        Setting::LogFormat,
    ];

    /// Returns the environment variable backing the parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Setting::EnabledLabels => "PROMETHEUS_ENABLED_LABELS",
            Setting::EstablishBuckets => "PROMETHEUS_BR_EST_DUR_BUCKETS",
            Setting::CompletionBuckets => "PROMETHEUS_BR_COMP_DUR_BUCKETS",
            Setting::RampUpBuckets => "PROMETHEUS_BR_RAMPUP_DUR_BUCKETS",
            Setting::Namespace => "BUILD_CONTROLLER_LEADER_ELECTION_NAMESPACE",
            Setting::ControllerName => "BUILD_CONTROLLER_NAME",
            Setting::MetricsAddress => "BUILD_CONTROLLER_METRICS_ADDRESS",
            Setting::MetricsPort => "BUILD_CONTROLLER_METRICS_PORT",
            Setting::PodName => "POD_NAME",
            Setting::LogFormat => "BUILD_CONTROLLER_LOG_FORMAT",
        }
    }

    /// Trimmed value of the variable; unset and blank are treated alike.
    pub fn value(&self) -> Option<String> {
        env::var(self.env_var())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

/// Instrument registry configuration: enabled label dimensions and the
/// bucket boundaries of each histogram family.
#[derive(Clone, Debug, PartialEq)]
pub struct PrometheusConfig {
    pub enabled_labels: Vec<MetricLabel>,
    pub establish_buckets: Vec<f64>,
    pub completion_buckets: Vec<f64>,
    /// Shared by the three ramp-up histograms.
    pub rampup_buckets: Vec<f64>,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        PrometheusConfig {
            enabled_labels: Vec::new(),
            establish_buckets: vec![0.0, 1.0, 2.0, 3.0, 5.0, 7.0, 10.0, 15.0, 20.0, 30.0],
            completion_buckets: linear_buckets(50.0, 50.0, 10),
            rampup_buckets: linear_buckets(0.0, 1.0, 10),
        }
    }
}

impl PrometheusConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        let defaults = PrometheusConfig::default();
        Ok(PrometheusConfig {
            enabled_labels: Setting::EnabledLabels
                .value()
                .map(|raw| parse_labels(&raw))
                .unwrap_or(defaults.enabled_labels),
            establish_buckets: buckets_from_env(
                Setting::EstablishBuckets,
                defaults.establish_buckets,
            )?,
            completion_buckets: buckets_from_env(
                Setting::CompletionBuckets,
                defaults.completion_buckets,
            )?,
            rampup_buckets: buckets_from_env(Setting::RampUpBuckets, defaults.rampup_buckets)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    pub controller_name: String,
    /// Namespace the controller runs in; the metrics Service lands here.
    pub namespace: String,
    pub metrics_address: SocketAddr,
    pub metrics_port: u16,
    pub pod_name: Option<String>,
    pub log_format: LogFormat,
    pub prometheus: PrometheusConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            metrics_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_METRICS_PORT)),
            metrics_port: DEFAULT_METRICS_PORT,
            pod_name: None,
            log_format: LogFormat::Text,
            prometheus: PrometheusConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Loads every setting from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, BoxError> {
        let defaults = ControllerConfig::default();
        let metrics_address = match Setting::MetricsAddress.value() {
            Some(raw) => raw.parse::<SocketAddr>().map_err(|err| {
                config_error(format!(
                    "{}: '{raw}' is not a socket address: {err}",
                    Setting::MetricsAddress.env_var()
                ))
            })?,
            None => defaults.metrics_address,
        };
        let metrics_port = match Setting::MetricsPort.value() {
            Some(raw) => raw.parse::<u16>().map_err(|err| {
                config_error(format!(
                    "{}: '{raw}' is not a port: {err}",
                    Setting::MetricsPort.env_var()
                ))
            })?,
            None => metrics_address.port(),
        };
        let log_format = match Setting::LogFormat.value() {
            Some(raw) => LogFormat::parse(&raw).ok_or_else(|| {
                config_error(format!(
                    "{}: unsupported log format '{raw}'",
                    Setting::LogFormat.env_var()
                ))
            })?,
            None => defaults.log_format,
        };

        Ok(ControllerConfig {
            controller_name: Setting::ControllerName
                .value()
                .unwrap_or(defaults.controller_name),
            namespace: Setting::Namespace.value().unwrap_or(defaults.namespace),
            metrics_address,
            metrics_port,
            pod_name: Setting::PodName.value(),
            log_format,
            prometheus: PrometheusConfig::from_env()?,
        })
    }

    /// Name of the pod running this process, injected through the downward API.
    pub fn pod_name(&self) -> Result<&str, BoxError> {
        self.pod_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| {
                config_error(format!(
                    "required env {} not set, please configure downward API",
                    Setting::PodName.env_var()
                ))
            })
    }

    pub fn metrics_service_name(&self) -> String {
        format!("{}-metrics", self.controller_name)
    }
}

pub fn linear_buckets(start: f64, width: f64, count: usize) -> Vec<f64> {
    (0..count).map(|i| start + width * i as f64).collect()
}

/// Parses a comma separated label list. Unknown names are skipped.
pub fn parse_labels(raw: &str) -> Vec<MetricLabel> {
    let mut labels = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        match MetricLabel::parse(item) {
            Some(label) if !labels.contains(&label) => labels.push(label),
            Some(_) => {}
            None => log_warn(
                "config",
                "Ignoring unknown metric label",
                &[
                    ("label", item),
                    ("variable", Setting::EnabledLabels.env_var()),
                ],
            ),
        }
    }
    labels
}

/// Parses a comma separated list of histogram bucket upper bounds.
pub fn parse_buckets(raw: &str) -> Result<Vec<f64>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<f64>()
                .map_err(|err| format!("invalid bucket value '{item}': {err}"))
        })
        .collect()
}

fn buckets_from_env(setting: Setting, default: Vec<f64>) -> Result<Vec<f64>, BoxError> {
    match setting.value() {
        Some(raw) => parse_buckets(&raw)
            .map_err(|message| config_error(format!("{}: {message}", setting.env_var()))),
        None => Ok(default),
    }
}
