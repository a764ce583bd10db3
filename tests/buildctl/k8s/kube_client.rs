use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use buildctl::buildctl::config::ControllerConfig;
use buildctl::buildctl::k8s::client::{is_not_found, ClusterClient};
use buildctl::buildctl::k8s::kube::{ClusterConfig, KubeClient};
use buildctl::buildctl::k8s::metrics_service::{
    metrics_service_port, publish_metrics_service, CONTROLLER_PORT_NAME,
};
use buildctl::buildctl::k8s::ownership::resolve_final_owner;
use serde_json::{json, Value};
use tokio::net::TcpListener;

const NS: &str = "shipwright-build";
const POD: &str = "shipwright-build-controller-5b8c-q7x2z";
const SERVICE: &str = "shipwright-build-controller-metrics";

#[derive(Default)]
struct ApiServer {
    discovery_hits: AtomicUsize,
    updates: Mutex<Vec<(Option<String>, Value)>>,
}

fn status(code: StatusCode, reason: &str, message: &str) -> (StatusCode, Json<Value>) {
    (
        code,
        Json(json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": code.as_u16(),
        })),
    )
}

async fn pod() -> Json<Value> {
    // Type information omitted, as some read paths return it.
    Json(json!({
        "metadata": {
            "name": POD,
            "namespace": NS,
            "uid": "pod-uid",
            "ownerReferences": [{
                "apiVersion": "apps/v1", "kind": "ReplicaSet",
                "name": "shipwright-build-controller-5b8c", "uid": "rs-uid",
                "controller": true, "blockOwnerDeletion": true
            }]
        },
        "spec": {"containers": [{"name": "controller", "image": "ghcr.io/shipwright-io/build"}]}
    }))
}

async fn apps_discovery(State(server): State<Arc<ApiServer>>) -> Json<Value> {
    server.discovery_hits.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "kind": "APIResourceList",
        "apiVersion": "v1",
        "groupVersion": "apps/v1",
        "resources": [
            {"name": "deployments", "singularName": "deployment", "namespaced": true,
             "kind": "Deployment", "verbs": ["get", "list"]},
            {"name": "deployments/scale", "singularName": "", "namespaced": true,
             "kind": "Scale", "verbs": ["get"]},
            {"name": "replicasets", "singularName": "replicaset", "namespaced": true,
             "kind": "ReplicaSet", "verbs": ["get", "list"]}
        ]
    }))
}

async fn replica_set() -> Json<Value> {
    Json(json!({
        "apiVersion": "apps/v1",
        "kind": "ReplicaSet",
        "metadata": {
            "name": "shipwright-build-controller-5b8c",
            "namespace": NS,
            "uid": "rs-uid",
            "ownerReferences": [{
                "apiVersion": "apps/v1", "kind": "Deployment",
                "name": "shipwright-build-controller", "uid": "deploy-uid", "controller": true
            }]
        },
        "spec": {"replicas": 1}
    }))
}

async fn deployment() -> Json<Value> {
    Json(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "shipwright-build-controller", "namespace": NS, "uid": "deploy-uid"},
        "spec": {"replicas": 1}
    }))
}

async fn create_service() -> (StatusCode, Json<Value>) {
    status(
        StatusCode::CONFLICT,
        "AlreadyExists",
        "services \"shipwright-build-controller-metrics\" already exists",
    )
}

async fn existing_service() -> Json<Value> {
    Json(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": SERVICE, "namespace": NS, "resourceVersion": "77", "uid": "svc-uid"},
        "spec": {
            "type": "ClusterIP",
            "clusterIP": "10.96.14.3",
            "clusterIPs": ["10.96.14.3"],
            "ports": [{"name": "old", "port": 9000, "targetPort": 9000, "protocol": "TCP"}]
        }
    }))
}

async fn update_service(
    State(server): State<Arc<ApiServer>>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Json<Value> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    server
        .updates
        .lock()
        .unwrap()
        .push((authorization, body.clone()));
    body["metadata"]["resourceVersion"] = json!("78");
    Json(body)
}

async fn not_found() -> (StatusCode, Json<Value>) {
    status(StatusCode::NOT_FOUND, "NotFound", "the server could not find the requested resource")
}

async fn start_api_server() -> (Arc<ApiServer>, KubeClient) {
    let server = Arc::new(ApiServer::default());
    let app = Router::new()
        .route(&format!("/api/v1/namespaces/{NS}/pods/{POD}"), get(pod))
        .route("/apis/apps/v1", get(apps_discovery))
        .route(
            &format!("/apis/apps/v1/namespaces/{NS}/replicasets/shipwright-build-controller-5b8c"),
            get(replica_set),
        )
        .route(
            &format!("/apis/apps/v1/namespaces/{NS}/deployments/shipwright-build-controller"),
            get(deployment),
        )
        .route(&format!("/api/v1/namespaces/{NS}/services"), post(create_service))
        .route(
            &format!("/api/v1/namespaces/{NS}/services/{SERVICE}"),
            get(existing_service).put(update_service),
        )
        .fallback(not_found)
        .with_state(Arc::clone(&server));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = KubeClient::new(
        ClusterConfig::new(&format!("http://{address}"))
            .unwrap()
            .with_token("test-token"),
    )
    .unwrap();
    (server, client)
}

#[tokio::test]
async fn owner_walk_uses_discovery_once_per_group() {
    let (server, client) = start_api_server().await;

    let owner = resolve_final_owner(&client, POD, NS).await.unwrap();
    assert_eq!(owner.kind, "Deployment");
    assert_eq!(owner.name, "shipwright-build-controller");
    assert_eq!(owner.uid, "deploy-uid");
    assert_eq!(server.discovery_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_objects_map_to_not_found() {
    let (_server, client) = start_api_server().await;

    let err = client.get_pod(NS, "ghost").await.unwrap_err();
    assert!(is_not_found(&*err), "{err}");
}

#[tokio::test]
async fn publish_replaces_existing_service() {
    let (server, client) = start_api_server().await;
    let config = ControllerConfig {
        pod_name: Some(POD.to_string()),
        ..Default::default()
    };

    let service = publish_metrics_service(
        &client,
        &config,
        vec![metrics_service_port(CONTROLLER_PORT_NAME, 8383)],
    )
    .await
    .unwrap();
    assert_eq!(service.metadata.resource_version.as_deref(), Some("78"));

    let updates = server.updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    let (authorization, body) = &updates[0];
    assert_eq!(authorization.as_deref(), Some("Bearer test-token"));
    assert_eq!(body["metadata"]["resourceVersion"], "77");
    assert_eq!(body["spec"]["clusterIP"], "10.96.14.3");
    assert_eq!(body["spec"]["clusterIPs"], json!(["10.96.14.3"]));
    assert_eq!(body["spec"]["selector"]["name"], "shipwright-build-controller");
    assert_eq!(body["spec"]["ports"][0]["name"], "http-metrics");
    assert_eq!(body["spec"]["ports"][0]["targetPort"], 8383);
    assert_eq!(body["metadata"]["ownerReferences"][0]["kind"], "Deployment");
}
