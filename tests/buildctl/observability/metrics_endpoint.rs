use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::routing::get;
use buildctl::buildctl::config::PrometheusConfig;
use buildctl::buildctl::observability::labels::MetricLabel;
use buildctl::buildctl::observability::metrics::BuildMetrics;
use buildctl::buildctl::observability::server::{bind, router, serve_metrics};
use chrono::Duration;
use tokio::sync::oneshot;
use tower::ServiceExt;

fn initialized_metrics() -> Arc<BuildMetrics> {
    let metrics = BuildMetrics::new().expect("registry");
    metrics
        .initialize(&PrometheusConfig {
            enabled_labels: vec![MetricLabel::BuildStrategy, MetricLabel::Namespace],
            ..Default::default()
        })
        .expect("initialize");
    Arc::new(metrics)
}

async fn get_text(app: axum::Router, path: &str) -> (StatusCode, Option<String>, String) {
    let response = app
        .oneshot(Request::get(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, content_type, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn metrics_route_exposes_recorded_series() {
    let metrics = initialized_metrics();
    metrics.record_buildrun_completed("buildah", "team-a", "app", "app-run-1");
    metrics
        .observe_buildrun_completion("buildah", "team-a", "app", "app-run-1", Duration::seconds(120))
        .unwrap();

    let (status, content_type, body) = get_text(router(metrics), "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("text/plain; version=0.0.4"));
    assert!(
        body.contains("build_buildruns_completed_total{buildstrategy=\"buildah\",namespace=\"team-a\"} 1"),
        "{body}"
    );
    assert!(
        body.contains("build_buildrun_completion_duration_seconds_count{buildstrategy=\"buildah\",namespace=\"team-a\"} 1"),
        "{body}"
    );
}

#[tokio::test]
async fn extra_handlers_are_mounted_next_to_metrics() {
    let metrics = initialized_metrics();
    metrics
        .register_handler("/debug/ready", get(|| async { "ready" }))
        .unwrap();

    let app = router(Arc::clone(&metrics));
    let (status, _, body) = get_text(app.clone(), "/debug/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ready");

    let (status, _, _) = get_text(app, "/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rejected_paths_never_reach_the_router() {
    let metrics = initialized_metrics();
    assert!(metrics.register_handler("/debug/*", get(|| async { "all" })).is_err());
    assert!(metrics.register_handler("//x", get(|| async { "x" })).is_err());
    metrics
        .register_handler("/debug/pods/:name", get(|| async { "pod" }))
        .unwrap();
    metrics
        .register_handler("/debug/pods/summary", get(|| async { "summary" }))
        .unwrap();

    let app = router(metrics);
    let (status, _, body) = get_text(app.clone(), "/debug/pods/build-controller-0").await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "pod"));
    let (status, _, body) = get_text(app.clone(), "/debug/pods/summary").await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "summary"));
    let (status, _, _) = get_text(app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn listener_serves_until_shutdown() {
    let metrics = initialized_metrics();
    metrics.record_build_registered("kaniko", "team-b", "api");

    let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let address = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(serve_metrics(listener, Arc::clone(&metrics), async move {
        let _ = stopped.await;
    }));

    let body = reqwest::get(format!("http://{address}/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(
        body.contains("build_builds_registered_total{buildstrategy=\"kaniko\",namespace=\"team-b\"} 1"),
        "{body}"
    );

    stop.send(()).unwrap();
    task.await.unwrap().expect("clean shutdown");
}
