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

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::buildctl::logger::{log_error, log_info};
use crate::buildctl::observability::metrics::{BuildMetrics, METRICS_PATH};
use crate::buildctl::util::error::{with_context, BoxError};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Routes served by the metrics listener: [`METRICS_PATH`] plus every
/// handler registered on `metrics` at the time of the call.
pub fn router(metrics: Arc<BuildMetrics>) -> Router {
    let extra = metrics.extra_handlers();
    let mut router = Router::new()
        .route(METRICS_PATH, get(metrics_handler))
        .with_state(metrics);
    for (path, handler) in extra {
        router = router.route(&path, handler);
    }
    router
}

async fn metrics_handler(State(metrics): State<Arc<BuildMetrics>>) -> Response {
    match metrics.gather() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(err) => {
            let message = err.to_string();
            log_error("metrics", "Failed to encode metrics", &[("error", message.as_str())]);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {message}"),
            )
                .into_response()
        }
    }
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, BoxError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| with_context(e, format!("Failed to bind metrics listener at {addr}")))
}

/// Serves the metrics routes on `listener` until `shutdown` resolves.
pub async fn serve_metrics<F>(
    listener: TcpListener,
    metrics: Arc<BuildMetrics>,
    shutdown: F,
) -> Result<(), BoxError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local = listener
        .local_addr()
        .map_err(|e| with_context(e, "Failed to read metrics listener address"))?
        .to_string();
    log_info(
        "metrics",
        "Metrics listener started",
        &[("address", local.as_str()), ("path", METRICS_PATH)],
    );

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| with_context(e, "Metrics listener failed"))?;

    log_info("metrics", "Metrics listener stopped", &[("address", local.as_str())]);
    Ok(())
}
