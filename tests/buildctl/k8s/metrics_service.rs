use std::sync::Arc;

use buildctl::buildctl::config::ControllerConfig;
use buildctl::buildctl::k8s::metrics_service::{
    metrics_service_port, publish_metrics_service, CONTROLLER_PORT_NAME, CR_PORT_NAME,
};
use buildctl::buildctl::test_support::{ClusterCall, FakeCluster};

const NS: &str = "shipwright-build";

fn deployment_cluster(replicas: &[&str]) -> FakeCluster {
    let cluster = FakeCluster::new();
    cluster.insert_owner(NS, "apps/v1", "Deployment", "shipwright-build-controller", "deploy-uid", None);
    cluster.insert_owner(
        NS,
        "apps/v1",
        "ReplicaSet",
        "shipwright-build-controller-5b8c",
        "rs-uid",
        Some(("apps/v1", "Deployment", "shipwright-build-controller", "deploy-uid")),
    );
    for (index, replica) in replicas.iter().enumerate() {
        cluster.insert_pod(
            NS,
            replica,
            &format!("pod-uid-{index}"),
            Some(("apps/v1", "ReplicaSet", "shipwright-build-controller-5b8c", "rs-uid")),
        );
    }
    cluster
}

fn config_for(pod: &str) -> ControllerConfig {
    ControllerConfig {
        pod_name: Some(pod.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn service_is_owned_by_the_deployment() {
    let cluster = deployment_cluster(&["shipwright-build-controller-5b8c-q7x2z"]);
    let config = config_for("shipwright-build-controller-5b8c-q7x2z");
    let ports = vec![
        metrics_service_port(CONTROLLER_PORT_NAME, config.metrics_port),
        metrics_service_port(CR_PORT_NAME, 8080),
    ];

    let service = publish_metrics_service(&cluster, &config, ports).await.unwrap();

    let owners = &service.metadata.owner_references;
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].api_version, "apps/v1");
    assert_eq!(owners[0].kind, "Deployment");
    assert_eq!(owners[0].name, "shipwright-build-controller");
    assert_eq!(owners[0].uid, "deploy-uid");
    assert_eq!(owners[0].controller, Some(true));
    assert_eq!(service.spec.ports.len(), 2);
    assert_eq!(service.spec.ports[0].port, 8383);
    assert_eq!(cluster.call_count(ClusterCall::GetObject), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_replicas_converge_on_one_service() {
    let replicas = ["shipwright-build-controller-5b8c-aaaaa", "shipwright-build-controller-5b8c-bbbbb"];
    let cluster = Arc::new(deployment_cluster(&replicas));

    let tasks: Vec<_> = replicas
        .iter()
        .map(|replica| {
            let cluster = Arc::clone(&cluster);
            let config = config_for(replica);
            tokio::spawn(async move {
                let ports = vec![metrics_service_port(CONTROLLER_PORT_NAME, config.metrics_port)];
                publish_metrics_service(&*cluster, &config, ports).await
            })
        })
        .collect();

    let mut published = Vec::new();
    for task in tasks {
        published.push(task.await.unwrap().expect("publish"));
    }

    let services = cluster.services();
    assert_eq!(services.len(), 1);
    let stored = &services[0];
    assert_eq!(stored.metadata.owner_references[0].kind, "Deployment");
    assert!(published
        .iter()
        .all(|service| service.spec.cluster_ip == stored.spec.cluster_ip));
    assert_eq!(cluster.call_count(ClusterCall::CreateService), 2);
    assert_eq!(cluster.call_count(ClusterCall::UpdateService), 1);
}
