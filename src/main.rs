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

use std::process::ExitCode;
use std::sync::Arc;

use buildctl::buildctl::config::ControllerConfig;
use buildctl::buildctl::k8s::kube::{ClusterConfig, KubeClient};
use buildctl::buildctl::k8s::metrics_service::{
    metrics_service_port, publish_metrics_service, CONTROLLER_PORT_NAME,
};
use buildctl::buildctl::logger::{log_error, log_info, set_log_format};
use buildctl::buildctl::observability::metrics::BuildMetrics;
use buildctl::buildctl::observability::{server, tracing};
use buildctl::buildctl::util::error::{with_context, BoxError};
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() -> ExitCode {
    tracing::init();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log_error(
                "main",
                "Build controller start-up failed",
                &[("error", err.to_string().as_str())],
            );
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), BoxError> {
    let config = ControllerConfig::from_env()?;
    set_log_format(config.log_format);

    let metrics = Arc::new(BuildMetrics::new()?);
    metrics.initialize(&config.prometheus)?;

    let listener = server::bind(config.metrics_address).await?;
    let listener_task = tokio::spawn(server::serve_metrics(
        listener,
        Arc::clone(&metrics),
        shutdown_signal(),
    ));

    let client = KubeClient::new(ClusterConfig::in_cluster()?)?;
    let ports = vec![metrics_service_port(CONTROLLER_PORT_NAME, config.metrics_port)];
    tracing::with_span(
        "main",
        "publish-metrics-service",
        publish_metrics_service(&client, &config, ports),
    )
    .await?;

    listener_task
        .await
        .map_err(|e| with_context(e, "metrics listener task failed"))?
}

async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    log_info("main", "Shutdown signal received", &[]);
}
