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

//! Label dimensions an operator may enable on the build instruments.
//!
//! Every enabled dimension multiplies the number of time series an
//! instrument can produce, so the set is fixed when the registry is
//! initialized and key order never changes afterwards.

use std::collections::BTreeSet;

/// A label dimension. Declaration order is the key order on every instrument.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetricLabel {
    BuildStrategy,
    Namespace,
    Build,
    BuildRun,
}

impl MetricLabel {
    pub const ALL: [MetricLabel; 4] = [
        MetricLabel::BuildStrategy,
        MetricLabel::Namespace,
        MetricLabel::Build,
        MetricLabel::BuildRun,
    ];

    pub fn as_label(self) -> &'static str {
        match self {
            MetricLabel::BuildStrategy => "buildstrategy",
            MetricLabel::Namespace => "namespace",
            MetricLabel::Build => "build",
            MetricLabel::BuildRun => "buildrun",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let wanted = value.trim();
        Self::ALL
            .into_iter()
            .find(|label| label.as_label().eq_ignore_ascii_case(wanted))
    }

    /// `buildrun` only exists on instruments scoped to a single run.
    fn applies_to_builds(self) -> bool {
        self != MetricLabel::BuildRun
    }
}

/// The enabled label dimensions, frozen at registry initialization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelConfig {
    enabled: BTreeSet<MetricLabel>,
}

impl LabelConfig {
    pub fn new(enabled: impl IntoIterator<Item = MetricLabel>) -> Self {
        LabelConfig {
            enabled: enabled.into_iter().collect(),
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = MetricLabel> + '_ {
        self.enabled.iter().copied()
    }

    /// Label keys of the build-scoped instruments.
    pub fn build_keys(&self) -> Vec<&'static str> {
        self.enabled()
            .filter(|label| label.applies_to_builds())
            .map(MetricLabel::as_label)
            .collect()
    }

    /// Label keys of the build-run-scoped instruments.
    pub fn buildrun_keys(&self) -> Vec<&'static str> {
        self.enabled().map(MetricLabel::as_label).collect()
    }

    /// Values matching [`LabelConfig::build_keys`], in the same order.
    pub fn build_values<'a>(
        &self,
        strategy: &'a str,
        namespace: &'a str,
        build: &'a str,
    ) -> Vec<&'a str> {
        self.enabled()
            .filter(|label| label.applies_to_builds())
            .map(|label| match label {
                MetricLabel::BuildStrategy => strategy,
                MetricLabel::Namespace => namespace,
                MetricLabel::Build | MetricLabel::BuildRun => build,
            })
            .collect()
    }

    /// Values matching [`LabelConfig::buildrun_keys`], in the same order.
    pub fn buildrun_values<'a>(
        &self,
        strategy: &'a str,
        namespace: &'a str,
        build: &'a str,
        buildrun: &'a str,
    ) -> Vec<&'a str> {
        self.enabled()
            .map(|label| match label {
                MetricLabel::BuildStrategy => strategy,
                MetricLabel::Namespace => namespace,
                MetricLabel::Build => build,
                MetricLabel::BuildRun => buildrun,
            })
            .collect()
    }
}
