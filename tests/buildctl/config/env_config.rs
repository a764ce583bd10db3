use std::env;
use std::fs;
use std::net::SocketAddr;

use buildctl::buildctl::config::{ControllerConfig, Setting};
use buildctl::buildctl::k8s::kube::ClusterConfig;
use buildctl::buildctl::logger::LogFormat;
use buildctl::buildctl::observability::labels::MetricLabel;
use buildctl::buildctl::util::error::is_config_error;
use serial_test::serial;
use tempfile::TempDir;

fn clear_settings() {
    for setting in Setting::ALL {
        env::remove_var(setting.env_var());
    }
}

#[test]
#[serial]
fn defaults_apply_when_unset() {
    clear_settings();
    let config = ControllerConfig::from_env().unwrap();
    assert_eq!(config, ControllerConfig::default());
    assert_eq!(config.metrics_port, 8383);
    assert!(config.pod_name().is_err());
}

#[test]
#[serial]
fn environment_overrides_defaults() {
    clear_settings();
    env::set_var("PROMETHEUS_ENABLED_LABELS", "buildstrategy, Namespace,unknown");
    env::set_var("PROMETHEUS_BR_EST_DUR_BUCKETS", "0.5,1,5");
    env::set_var("BUILD_CONTROLLER_NAME", "build-operator");
    env::set_var("BUILD_CONTROLLER_LEADER_ELECTION_NAMESPACE", "builds");
    env::set_var("BUILD_CONTROLLER_METRICS_ADDRESS", "127.0.0.1:9090");
    env::set_var("BUILD_CONTROLLER_LOG_FORMAT", "json");
    env::set_var("POD_NAME", "build-operator-0");

    let config = ControllerConfig::from_env().unwrap();
    clear_settings();

    assert_eq!(
        config.prometheus.enabled_labels,
        vec![MetricLabel::BuildStrategy, MetricLabel::Namespace]
    );
    assert_eq!(config.prometheus.establish_buckets, vec![0.5, 1.0, 5.0]);
    assert_eq!(config.metrics_address, "127.0.0.1:9090".parse::<SocketAddr>().unwrap());
    assert_eq!(config.metrics_port, 9090);
    assert_eq!(config.log_format, LogFormat::Json);
    assert_eq!(config.pod_name().unwrap(), "build-operator-0");
    assert_eq!(config.namespace, "builds");
    assert_eq!(config.metrics_service_name(), "build-operator-metrics");
}

#[test]
#[serial]
fn malformed_buckets_are_config_errors() {
    clear_settings();
    env::set_var("PROMETHEUS_BR_COMP_DUR_BUCKETS", "50,100,ten");
    let err = ControllerConfig::from_env().unwrap_err();
    clear_settings();

    assert!(is_config_error(&*err), "{err}");
    assert!(err.to_string().contains("PROMETHEUS_BR_COMP_DUR_BUCKETS"), "{err}");
}

#[test]
#[serial]
fn unsupported_log_format_is_rejected() {
    clear_settings();
    env::set_var("BUILD_CONTROLLER_LOG_FORMAT", "yaml");
    let err = ControllerConfig::from_env().unwrap_err();
    clear_settings();
    assert!(err.to_string().contains("yaml"), "{err}");
}

#[test]
#[serial]
fn in_cluster_requires_service_environment() {
    env::remove_var("KUBERNETES_SERVICE_HOST");
    env::remove_var("KUBERNETES_SERVICE_PORT");
    let err = ClusterConfig::in_cluster().unwrap_err();
    assert!(is_config_error(&*err), "{err}");
}

#[test]
fn service_account_files_are_loaded() {
    let dir = TempDir::new().expect("tempdir");
    fs::write(dir.path().join("token"), "  sa-token\n").unwrap();
    fs::write(dir.path().join("ca.crt"), "-----BEGIN CERTIFICATE-----\n").unwrap();

    let config = ClusterConfig::from_service_account("10.96.0.1", "443", dir.path()).unwrap();
    assert_eq!(config.server.as_str(), "https://10.96.0.1/");
    assert_eq!(config.token.as_deref(), Some("sa-token"));
    assert!(config.ca_certificate.is_some());

    fs::remove_file(dir.path().join("token")).unwrap();
    let err = ClusterConfig::from_service_account("10.96.0.1", "443", dir.path()).unwrap_err();
    assert!(err.to_string().contains("token"), "{err}");
}
