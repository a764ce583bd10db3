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

use crate::buildctl::observability::tracing;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
#[cfg(not(test))]
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

const SERVICE_NAME: &str = "build-controller";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    #[default]
    Text = 0,
    Json = 1,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "" => Some(LogFormat::Text),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    #[cfg_attr(test, allow(dead_code))]
    fn is_stderr(self) -> bool {
        matches!(self, LogLevel::Warn | LogLevel::Error)
    }
}

fn quote_if_needed(value: &str) -> String {
    let plain = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\\' | '=' | ',' | '{' | '}'));
    if plain {
        return value.to_string();
    }
    // Debug formatting of a str yields a quoted, escaped literal.
    format!("{value:?}")
}

/// Emits one structured line. Base fields come first, then the caller's
/// metadata in order; empty keys are dropped.
pub fn log_event(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    let mut fields: Vec<(&str, String)> = vec![
        ("ts", Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        ("level", level.as_str().to_string()),
        ("service", SERVICE_NAME.to_string()),
        ("component", component.to_string()),
        ("msg", message.to_string()),
    ];
    if let Some(ctx) = tracing::current_context() {
        fields.push(("trace_id", ctx.trace_id().to_string()));
        fields.push(("span_id", ctx.span_id().to_string()));
    }
    fields.extend(
        metadata
            .iter()
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (*key, (*value).to_string())),
    );

    let line = match current_log_format() {
        LogFormat::Text => fields
            .iter()
            .map(|(key, value)| format!("{key}={}", quote_if_needed(value)))
            .collect::<Vec<_>>()
            .join(" "),
        LogFormat::Json => {
            let payload: Map<String, Value> = fields
                .into_iter()
                .map(|(key, value)| (key.to_string(), Value::String(value)))
                .collect();
            Value::Object(payload).to_string()
        }
    };
    write_line(level, &line);
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, metadata);
}

#[cfg(not(test))]
fn write_line(level: LogLevel, line: &str) {
    let result = if level.is_stderr() {
        writeln!(io::stderr().lock(), "{line}")
    } else {
        writeln!(io::stdout().lock(), "{line}")
    };
    if let Err(error) = result {
        let _ = writeln!(
            io::stderr().lock(),
            "{SERVICE_NAME}: failed to write log line: {error} (original: {line})"
        );
    }
}

#[cfg(test)]
fn write_line(level: LogLevel, line: &str) {
    test_log_store()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push((level, line.to_string()));
}

#[cfg(test)]
fn test_log_store() -> &'static Mutex<Vec<(LogLevel, String)>> {
    static STORE: OnceLock<Mutex<Vec<(LogLevel, String)>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Returns captured lines for `component`, leaving other components' lines
/// in place so parallel tests do not steal each other's output.
#[cfg(test)]
pub(crate) fn take_test_logs(component: &str) -> Vec<(LogLevel, String)> {
    let needle_text = format!("component={}", quote_if_needed(component));
    let needle_json = format!("\"component\":{}", Value::String(component.to_string()));
    let mut guard = test_log_store()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let (matching, rest): (Vec<_>, Vec<_>) = guard.drain(..).partition(|(_, line)| {
        line.contains(&needle_text) || line.contains(&needle_json)
    });
    *guard = rest;
    matching
}
